//! Crate-level error taxonomy.
//!
//! Every layer (`block`, `freelist`, `btree`, `version`, `changes`, `shard`,
//! `compactor`) defines its own `thiserror`-derived error enum scoped to the
//! failures that layer can actually produce, the same way the teacher splits
//! `ManifestError` / `SSTableError` / `EngineError` by layer. [`Error`] is the
//! single crate-level type those per-layer errors fold into via `#[from]`, so
//! application code matches on one enum regardless of which layer raised it.

use thiserror::Error;

/// The crate-wide error type, implementing the taxonomy named in the
/// external-interfaces and error-handling sections of the specification.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The shard could not be opened: missing files, bad permissions, or an
    /// unparseable version file.
    #[error("database opening failed: {0}")]
    DatabaseOpening(String),

    /// A structural or checksum violation was detected on disk.
    #[error("database corrupt: {0}")]
    DatabaseCorrupt(String),

    /// A reader observed a block stamped with a revision newer than its own
    /// snapshot; the caller should reopen the database.
    #[error("database modified by another writer since this snapshot was opened")]
    DatabaseModified,

    /// A second writable handle was requested on a shard that already has one.
    #[error("database is locked by another writer")]
    DatabaseLock,

    /// A generic I/O failure, with the OS-reported error preserved.
    #[error("database I/O error: {0}")]
    DatabaseError(#[from] std::io::Error),

    /// A caller-supplied argument violated a documented precondition (empty or
    /// oversized key, destination equal to a source, etc).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller requested an operation whose preconditions are violated by the
    /// current state (overlapping docid ranges under preserve-docids
    /// compaction, replacing docid 0, etc).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation is not supported by this shard's on-disk format.
    #[error("feature unavailable: {0}")]
    FeatureUnavailable(String),

    /// The requested operation is recognized but not implemented (e.g.
    /// cross-format compaction).
    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl Error {
    /// Construct a [`Error::DatabaseCorrupt`] with added path context.
    pub fn corrupt_at(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Error::DatabaseCorrupt(format!("{}: {reason}", path.display()))
    }

    /// Construct a [`Error::DatabaseOpening`] with added path context.
    pub fn opening_at(path: &std::path::Path, reason: impl std::fmt::Display) -> Self {
        Error::DatabaseOpening(format!("{}: {reason}", path.display()))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
