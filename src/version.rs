//! Database version file: the authoritative record of the current revision
//! (§4.3) — per-table root blocks, a UUID, and database-wide statistics.
//!
//! Grounded on
//! `examples/original_source/xapian-core/backends/honey/honey_version.h`'s
//! `HoneyVersion`/`Honey::RootInfo` (entity shape, `add_document`/
//! `delete_document`/`merge_stats` bookkeeping) and on the teacher's
//! `manifest/mod.rs::Manifest::checkpoint` for the write-temp/fsync/rename/
//! fsync-directory commit sequence.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;

use crate::btree::RootInfo;
use crate::encoding::{self, Decode, Encode, EncodingError, VarU64};
use crate::error::{Error, Result};

/// Identifies this crate's on-disk version-file format; distinguishes it
/// from an unrelated file placed at the same path.
const MAGIC: &[u8; 8] = b"XBTCORE1";
const FORMAT_VERSION: u8 = 1;
const CHECKSUM_SIZE: usize = 4;

const CANONICAL_NAME: &str = "version";
const TMP_NAME: &str = "version.tmp";

impl Encode for RootInfo {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        self.revision.encode_to(buf)?;
        self.root.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.block_count.encode_to(buf)?;
        self.freelist_head.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for RootInfo {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (revision, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (root, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        let (block_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (freelist_head, n) = Option::<u32>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            RootInfo {
                revision,
                root,
                level,
                block_count,
                freelist_head,
            },
            offset,
        ))
    }
}

/// Database-wide statistics tracked in the version file (§4.3), mirroring
/// `HoneyVersion`'s bound-tracking fields one-for-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DatabaseStats {
    pub doccount: u64,
    pub total_doclen: u64,
    pub last_docid: u64,
    pub doclen_lbound: u64,
    pub doclen_ubound: u64,
    pub wdf_ubound: u64,
    pub spelling_wordfreq_ubound: u64,
    pub oldest_changeset: u64,
    pub uniq_terms_lbound: u64,
    pub uniq_terms_ubound: u64,
}

impl DatabaseStats {
    /// Record a newly added document of length `doclen`.
    pub fn add_document(&mut self, doclen: u64) {
        self.doccount += 1;
        if self.total_doclen == 0 || (doclen != 0 && doclen < self.doclen_lbound) {
            self.doclen_lbound = doclen;
        }
        if doclen > self.doclen_ubound {
            self.doclen_ubound = doclen;
        }
        self.total_doclen += doclen;
    }

    /// Record the removal of a document of length `doclen`.
    pub fn delete_document(&mut self, doclen: u64) {
        self.doccount = self.doccount.saturating_sub(1);
        self.total_doclen = self.total_doclen.saturating_sub(doclen);
        // Once no postings remain, the bounds no longer mean anything and
        // reset rather than linger at stale values.
        if self.total_doclen == 0 {
            self.doclen_lbound = 0;
            self.doclen_ubound = 0;
            self.wdf_ubound = 0;
        }
    }

    /// Widen `wdf_ubound` if `wdf` exceeds it.
    pub fn check_wdf(&mut self, wdf: u64) {
        if wdf > self.wdf_ubound {
            self.wdf_ubound = wdf;
        }
    }

    /// Allocate and return the next document id.
    pub fn get_next_docid(&mut self) -> u64 {
        self.last_docid += 1;
        self.last_docid
    }

    /// Fold another shard's stats into this one, used by the compactor
    /// (§4.7) when producing a single merged output database.
    pub fn merge_stats(&mut self, other: &DatabaseStats) {
        let doclen_lbound = if self.doccount == 0 {
            other.doclen_lbound
        } else if other.doccount == 0 {
            self.doclen_lbound
        } else {
            self.doclen_lbound.min(other.doclen_lbound)
        };
        self.doclen_ubound = self.doclen_ubound.max(other.doclen_ubound);
        self.wdf_ubound = self.wdf_ubound.max(other.wdf_ubound);
        self.spelling_wordfreq_ubound = self.spelling_wordfreq_ubound.max(other.spelling_wordfreq_ubound);
        self.uniq_terms_lbound = if self.doccount == 0 {
            other.uniq_terms_lbound
        } else if other.doccount == 0 {
            self.uniq_terms_lbound
        } else {
            self.uniq_terms_lbound.min(other.uniq_terms_lbound)
        };
        self.uniq_terms_ubound = self.uniq_terms_ubound.max(other.uniq_terms_ubound);
        self.oldest_changeset = self.oldest_changeset.min(other.oldest_changeset);

        self.doccount += other.doccount;
        self.total_doclen += other.total_doclen;
        self.last_docid = self.last_docid.max(other.last_docid);
        self.doclen_lbound = doclen_lbound;
    }
}

impl Encode for DatabaseStats {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        VarU64(self.doccount).encode_to(buf)?;
        VarU64(self.total_doclen).encode_to(buf)?;
        VarU64(self.last_docid).encode_to(buf)?;
        VarU64(self.doclen_lbound).encode_to(buf)?;
        VarU64(self.doclen_ubound).encode_to(buf)?;
        VarU64(self.wdf_ubound).encode_to(buf)?;
        VarU64(self.spelling_wordfreq_ubound).encode_to(buf)?;
        VarU64(self.oldest_changeset).encode_to(buf)?;
        VarU64(self.uniq_terms_lbound).encode_to(buf)?;
        VarU64(self.uniq_terms_ubound).encode_to(buf)?;
        Ok(())
    }
}

impl Decode for DatabaseStats {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        macro_rules! next {
            () => {{
                let (v, n) = VarU64::decode_from(&buf[offset..])?;
                offset += n;
                v.0
            }};
        }
        let stats = DatabaseStats {
            doccount: next!(),
            total_doclen: next!(),
            last_docid: next!(),
            doclen_lbound: next!(),
            doclen_ubound: next!(),
            wdf_ubound: next!(),
            spelling_wordfreq_ubound: next!(),
            oldest_changeset: next!(),
            uniq_terms_lbound: next!(),
            uniq_terms_ubound: next!(),
        };
        Ok((stats, offset))
    }
}

/// A `(table name, root info)` pair, encoded as a named entry rather than a
/// fixed-index array — this crate doesn't fix the table set at the version
/// layer, leaving that to the shard above it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NamedRoot {
    name: String,
    info: RootInfo,
}

impl Encode for NamedRoot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        self.name.encode_to(buf)?;
        self.info.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for NamedRoot {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (info, n) = RootInfo::decode_from(&buf[offset..])?;
        offset += n;
        Ok((NamedRoot { name, info }, offset))
    }
}

/// The parsed contents of a version file, independent of the checksum that
/// frames it on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Payload {
    revision: u64,
    uuid: [u8; 16],
    roots: Vec<NamedRoot>,
    stats_bytes: Vec<u8>,
}

impl Encode for Payload {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        buf.extend_from_slice(MAGIC);
        FORMAT_VERSION.encode_to(buf)?;
        self.uuid.encode_to(buf)?;
        VarU64(self.revision).encode_to(buf)?;
        encoding::encode_vec(&self.roots, buf)?;
        self.stats_bytes.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Payload {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
            return Err(EncodingError::Custom("bad version-file magic".into()));
        }
        let mut offset = MAGIC.len();
        let (format, n) = u8::decode_from(&buf[offset..])?;
        offset += n;
        if format != FORMAT_VERSION {
            return Err(EncodingError::Custom(format!(
                "unsupported version-file format {format}"
            )));
        }
        let (uuid, n) = <[u8; 16]>::decode_from(&buf[offset..])?;
        offset += n;
        let (revision, n) = VarU64::decode_from(&buf[offset..])?;
        offset += n;
        let (roots, n) = encoding::decode_vec::<NamedRoot>(&buf[offset..])?;
        offset += n;
        let (stats_bytes, n) = Vec::<u8>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Payload {
                revision: revision.0,
                uuid,
                roots,
                stats_bytes,
            },
            offset,
        ))
    }
}

/// The authoritative revision record for one shard directory: per-table
/// root blocks, a UUID, and database statistics, durable via temp-write +
/// fsync + rename + directory-fsync (§4.3).
#[derive(Debug)]
pub struct DatabaseVersion {
    dir: PathBuf,
    revision: u64,
    uuid: [u8; 16],
    roots: Vec<NamedRoot>,
    stats: DatabaseStats,
}

impl DatabaseVersion {
    /// Create a brand-new version at revision 0 with no tables yet
    /// registered, generating a fresh UUID. Does not write anything to
    /// disk; call [`Self::commit`] once the first tables have roots.
    pub fn create(dir: impl Into<PathBuf>) -> Self {
        DatabaseVersion {
            dir: dir.into(),
            revision: 0,
            uuid: random_uuid(),
            roots: Vec::new(),
            stats: DatabaseStats::default(),
        }
    }

    /// Read the canonical version file from `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(CANONICAL_NAME);
        let mut file = File::open(&path).map_err(|e| Error::opening_at(&path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::opening_at(&path, e))?;
        if bytes.len() < CHECKSUM_SIZE {
            return Err(Error::corrupt_at(&path, "version file too small"));
        }
        let (payload_bytes, checksum_bytes) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let expected = u32::from_le_bytes(checksum_bytes.try_into().expect("4 bytes"));
        let mut hasher = Crc32::new();
        hasher.update(payload_bytes);
        if hasher.finalize() != expected {
            return Err(Error::corrupt_at(&path, "version file checksum mismatch"));
        }
        let (payload, _) = Payload::decode_from(payload_bytes)
            .map_err(|e| Error::corrupt_at(&path, e))?;
        let (stats, _) = DatabaseStats::decode_from(&payload.stats_bytes)
            .map_err(|e| Error::corrupt_at(&path, e))?;
        Ok(DatabaseVersion {
            dir,
            revision: payload.revision,
            uuid: payload.uuid,
            roots: payload.roots,
            stats,
        })
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn stats(&self) -> &DatabaseStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut DatabaseStats {
        &mut self.stats
    }

    /// The root info last published for `table`, if any.
    pub fn root_for(&self, table: &str) -> Option<&RootInfo> {
        self.roots.iter().find(|r| r.name == table).map(|r| &r.info)
    }

    fn set_root(&mut self, table: &str, info: RootInfo) {
        if let Some(existing) = self.roots.iter_mut().find(|r| r.name == table) {
            existing.info = info;
        } else {
            self.roots.push(NamedRoot {
                name: table.to_string(),
                info,
            });
        }
    }

    /// Publish a new revision: record each table's fresh `RootInfo`, bump the
    /// revision counter, and durably commit via temp-write, fsync, rename,
    /// then fsync the containing directory. On any failure the prior
    /// canonical file is untouched.
    pub fn commit(&mut self, new_roots: &[(&str, RootInfo)]) -> Result<()> {
        for (table, info) in new_roots {
            self.set_root(table, *info);
        }
        let new_revision = self.revision + 1;

        let mut stats_bytes = Vec::new();
        self.stats
            .encode_to(&mut stats_bytes)
            .expect("DatabaseStats encoding cannot fail");

        let payload = Payload {
            revision: new_revision,
            uuid: self.uuid,
            roots: self.roots.clone(),
            stats_bytes,
        };
        let mut bytes = Vec::new();
        payload
            .encode_to(&mut bytes)
            .expect("version payload encoding cannot fail");

        let mut hasher = Crc32::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_le_bytes());

        let tmp_path = self.dir.join(TMP_NAME);
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }

        let final_path = self.dir.join(CANONICAL_NAME);
        fs::rename(&tmp_path, &final_path)?;
        fsync_dir(&self.dir)?;

        tracing::info!(revision = new_revision, tables = self.roots.len(), "version committed");
        self.revision = new_revision;
        Ok(())
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    match File::open(dir) {
        Ok(f) => {
            // Directory fsync is unsupported on some platforms/filesystems;
            // the rename itself is already atomic, so tolerate the failure.
            if let Err(e) = f.sync_all() {
                tracing::warn!(dir = %dir.display(), error = %e, "directory fsync unsupported, tolerating");
            }
            Ok(())
        }
        Err(e) => Err(Error::DatabaseError(e)),
    }
}

/// A v4-ish random UUID built from process/time entropy. No external `uuid`
/// crate is in the dependency stack, and this value only needs to be unique
/// enough to distinguish database instances from each other.
fn random_uuid() -> [u8; 16] {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut bytes = [0u8; 16];
    bytes[..16].copy_from_slice(&nanos.to_le_bytes());
    // Mix in the address of a stack value for a little more entropy across
    // processes started in the same nanosecond.
    let stack_addr = &bytes as *const _ as usize as u64;
    for (i, b) in stack_addr.to_le_bytes().iter().enumerate() {
        bytes[i] ^= b;
    }
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}
