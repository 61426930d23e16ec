//! Optional, append-only changes log (§4.4): each commit that opts in
//! records the blocks it modified, so a replica can be brought forward by
//! applying the log instead of copying whole table files.
//!
//! Grounded on `wal/mod.rs`'s `Wal<T>`: the same length-prefixed,
//! CRC-framed record layout and fsync-before-publish discipline, but
//! specialized to `(block number, block bytes)` pairs instead of a generic
//! `Encode`/`Decode` record type, and terminated by a sentinel record
//! (§4.4) rather than relying on file length alone to know a commit's
//! changes are complete.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;

use crate::config::ChangesRetention;
use crate::encoding::{Decode, Encode};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"XBCL";
const U32_SIZE: usize = 4;
/// A record length of `u32::MAX` can never occur for a real block (blocks
/// are far smaller), so it doubles as the sentinel marking "no more
/// records in this commit".
const SENTINEL_LEN: u32 = u32::MAX;

fn crc_of(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn changes_file_name(table: &str, revision: u32) -> String {
    format!("changes.{table}.{revision}")
}

/// The header fields of one changes file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesHeader {
    pub table: String,
    pub block_size: u32,
}

/// Appends one commit's modified blocks to a fresh changes file.
pub struct ChangesWriter {
    file: File,
    path: PathBuf,
}

impl ChangesWriter {
    /// Create the changes file for `table` at `revision` inside `dir`,
    /// writing and checksumming its header.
    pub fn create(dir: &Path, table: &str, revision: u32, block_size: u32) -> Result<Self> {
        let path = dir.join(changes_file_name(table, revision));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut header = Vec::new();
        header.extend_from_slice(MAGIC);
        table.encode_to(&mut header).expect("string encoding cannot fail");
        block_size
            .encode_to(&mut header)
            .expect("u32 encoding cannot fail");
        let crc = crc_of(&header);

        file.write_all(&header)?;
        file.write_all(&crc.to_le_bytes())?;

        Ok(ChangesWriter { file, path })
    }

    /// Append one modified block's current bytes.
    pub fn write_block(&mut self, block_no: u32, block_bytes: &[u8]) -> Result<()> {
        let mut record = Vec::with_capacity(U32_SIZE + block_bytes.len());
        record.extend_from_slice(&block_no.to_le_bytes());
        record.extend_from_slice(block_bytes);

        let len = u32::try_from(record.len())
            .map_err(|_| Error::InvalidArgument("changes record too large".into()))?;
        if len == SENTINEL_LEN {
            return Err(Error::InvalidArgument(
                "changes record length collides with sentinel".into(),
            ));
        }

        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&record)?;
        self.file.write_all(&crc_of(&record).to_le_bytes())?;
        Ok(())
    }

    /// Write the terminating sentinel and fsync. The caller should call
    /// this only after the corresponding version-file commit has also
    /// succeeded, so an applier never sees a changes file for a revision
    /// the version file doesn't (yet) agree happened.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.file.write_all(&SENTINEL_LEN.to_le_bytes())?;
        self.file.sync_all()?;
        Ok(self.path)
    }
}

/// A fully-read, checksum-verified changes file.
#[derive(Debug)]
pub struct ChangesReader {
    pub header: ChangesHeader,
    records: Vec<(u32, Vec<u8>)>,
}

impl ChangesReader {
    /// Read and verify every record in the changes file at `path`. A
    /// missing sentinel (a commit whose writer crashed before `finish`)
    /// surfaces as `DatabaseCorrupt` — there is no such thing as a
    /// partially-applicable changes file.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::opening_at(path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::opening_at(path, e))?;

        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::corrupt_at(path, "bad changes-file magic"));
        }
        let mut offset = MAGIC.len();
        let (table, n) =
            String::decode_from(&bytes[offset..]).map_err(|e| Error::corrupt_at(path, e))?;
        offset += n;
        let (block_size, n) =
            u32::decode_from(&bytes[offset..]).map_err(|e| Error::corrupt_at(path, e))?;
        offset += n;

        let header_end = offset;
        if bytes.len() < header_end + U32_SIZE {
            return Err(Error::corrupt_at(path, "changes file truncated header"));
        }
        let stored = read_u32(&bytes, header_end);
        if crc_of(&bytes[..header_end]) != stored {
            return Err(Error::corrupt_at(path, "changes file header checksum mismatch"));
        }
        offset = header_end + U32_SIZE;

        let mut records = Vec::new();
        loop {
            if offset + U32_SIZE > bytes.len() {
                return Err(Error::corrupt_at(path, "changes file missing sentinel"));
            }
            let len = read_u32(&bytes, offset);
            offset += U32_SIZE;
            if len == SENTINEL_LEN {
                break;
            }
            let len = len as usize;
            if offset + len + U32_SIZE > bytes.len() {
                return Err(Error::corrupt_at(path, "changes file truncated record"));
            }
            let record = &bytes[offset..offset + len];
            let stored = read_u32(&bytes, offset + len);
            if crc_of(record) != stored {
                return Err(Error::corrupt_at(path, "changes record checksum mismatch"));
            }
            if record.len() < U32_SIZE {
                return Err(Error::corrupt_at(path, "changes record missing block number"));
            }
            let block_no = u32::from_le_bytes(record[..U32_SIZE].try_into().expect("4 bytes"));
            records.push((block_no, record[U32_SIZE..].to_vec()));
            offset += len + U32_SIZE;
        }

        Ok(ChangesReader {
            header: ChangesHeader { table, block_size },
            records,
        })
    }

    /// The `(block number, block bytes)` pairs recorded for this commit,
    /// in the order they were written.
    pub fn records(&self) -> &[(u32, Vec<u8>)] {
        &self.records
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + U32_SIZE].try_into().expect("4 bytes"))
}

/// Delete changes files for `table` in `dir` that fall outside the
/// retention policy, returning the oldest revision retained (`None` if
/// none are kept, e.g. under [`ChangesRetention::Disabled`]).
///
/// `oldest_changeset` in the version file's stats (§4.3) should be set to
/// the value this returns, so readers know the earliest revision a replica
/// can still be brought forward from.
pub fn prune(dir: &Path, table: &str, retention: ChangesRetention) -> Result<Option<u32>> {
    let prefix = format!("changes.{table}.");
    let mut revisions = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rev_str) = name.strip_prefix(&prefix) {
            if let Ok(rev) = rev_str.parse::<u32>() {
                revisions.push(rev);
            }
        }
    }
    revisions.sort_unstable();

    let keep_from = match retention {
        ChangesRetention::Disabled => None,
        ChangesRetention::KeepAll => revisions.first().copied(),
        ChangesRetention::KeepLast(n) => {
            let n = n as usize;
            if revisions.len() > n {
                revisions.get(revisions.len() - n).copied()
            } else {
                revisions.first().copied()
            }
        }
    };

    for rev in &revisions {
        let keep = keep_from.is_some_and(|boundary| *rev >= boundary);
        if keep {
            continue;
        }
        let path = dir.join(changes_file_name(table, *rev));
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "pruned old changes file"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to prune old changes file"),
        }
    }

    Ok(keep_from)
}
