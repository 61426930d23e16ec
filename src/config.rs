//! Explicit configuration, threaded down instead of read lazily from the
//! environment.
//!
//! Per the design note that configuration like `XAPIAN_OMEGA_PKGLIBBINDIR` was
//! historically read lazily from the environment: this crate takes an explicit
//! [`Config`] value at every entry point (`Shard::open`, `BTree::open`,
//! `Compactor::run`) and passes it down. There is no global mutable state.

/// Tuning knobs for a single [`crate::btree::BTree`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Block size in bytes. Must be a power of two in `2 KiB..=64 KiB`.
    pub block_size: u32,

    /// Minimum tag length (in bytes) before compression is attempted. Tags
    /// shorter than this are always stored uncompressed.
    pub compress_min: u32,

    /// Number of consecutive in-order appends to the same block required
    /// before sequential split mode engages automatically (§4.2.3).
    pub sequential_trigger: u32,

    /// Maximum B-tree depth before a split is refused with
    /// [`crate::error::Error::DatabaseCorrupt`].
    pub max_tree_depth: u32,
}

impl TableConfig {
    /// Default block size (8 KiB), matching common Xapian deployments.
    pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

    /// Default compression threshold (4 bytes, per §4.2.5 / §3).
    pub const DEFAULT_COMPRESS_MIN: u32 = 4;

    /// Upper bound on the largest single item (`header + key + tag`) as a
    /// fraction of the block size, so at least four items fit in a block
    /// (§3 invariant 5).
    pub fn max_item_size(self) -> usize {
        self.block_size as usize / 4
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            compress_min: Self::DEFAULT_COMPRESS_MIN,
            sequential_trigger: 8,
            max_tree_depth: 10,
        }
    }
}

/// Policy governing how the optional changes log is retained (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangesRetention {
    /// No changes log is written.
    #[default]
    Disabled,
    /// Keep every changeset ever written.
    KeepAll,
    /// Keep only the most recent `n` changesets; older ones are pruned on
    /// commit.
    KeepLast(u32),
}

/// Configuration for a whole [`crate::shard::Shard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Per-table tuning, applied uniformly to every table the shard opens.
    pub table: TableConfig,

    /// Whether and how to retain the optional changes log.
    pub changes_retention: ChangesRetention,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            changes_retention: ChangesRetention::Disabled,
        }
    }
}

/// Docid-mapping policy for the [`crate::compactor::Compactor`] (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionMode {
    /// Each source is offset by the cumulative `last_docid` of prior sources;
    /// output docids are contiguous starting from 1.
    #[default]
    Renumber,
    /// Sources must have disjoint used-docid ranges; their own docids are
    /// preserved verbatim in the output.
    PreserveDocids,
}
