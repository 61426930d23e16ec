//! Database (shard): the fixed set of named tables a query engine would
//! address as one logical database (§4.5).
//!
//! Grounded on `engine/mod.rs`'s `Engine`/`EngineInner` orchestration (one
//! struct owning several on-disk structures behind a single commit point,
//! freeze-and-retry style mutation helpers) generalized from one KV engine
//! to a fixed table set, plus `honey_version.h`'s table names (`postlist`,
//! `termlist`, `position`, `docdata`, `spelling`, `synonym`). The posting,
//! term, and position list *encodings* are this crate's own design — the
//! exact wire format Xapian's query engine expects is out of scope (the
//! overview's non-goals: query engine, text analysis), so each table simply
//! holds enough information to reconstruct postings/terms/positions for a
//! document, without claiming byte compatibility with Xapian's own format.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::btree::{BTree, Cursor, MAX_KEY};
use crate::changes::{prune, ChangesWriter};
use crate::config::{ChangesRetention, Config, TableConfig};
use crate::encoding::{decode_vec, encode_vec, Decode, Encode, EncodingError, VarU64};
use crate::error::{Error, Result};
use crate::version::{DatabaseStats, DatabaseVersion};

/// One of the fixed, ordered tables a shard owns. Declaration order here is
/// also commit order (§4.5: "calls commit on each modified table in a fixed
/// order").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    PostList,
    TermList,
    Position,
    DocData,
    Spelling,
    Synonym,
}

impl Table {
    const ALL: [Table; 6] = [
        Table::PostList,
        Table::TermList,
        Table::Position,
        Table::DocData,
        Table::Spelling,
        Table::Synonym,
    ];

    fn name(self) -> &'static str {
        match self {
            Table::PostList => "postlist",
            Table::TermList => "termlist",
            Table::Position => "position",
            Table::DocData => "docdata",
            Table::Spelling => "spelling",
            Table::Synonym => "synonym",
        }
    }

    fn file_name(self) -> String {
        format!("{}.bt", self.name())
    }
}

struct Tables {
    postlist: BTree,
    termlist: BTree,
    position: BTree,
    docdata: BTree,
    spelling: BTree,
    synonym: BTree,
}

impl Tables {
    fn create(dir: &Path, config: TableConfig) -> Result<Self> {
        Ok(Tables {
            postlist: BTree::create(dir.join(Table::PostList.file_name()), config)?,
            termlist: BTree::create(dir.join(Table::TermList.file_name()), config)?,
            position: BTree::create(dir.join(Table::Position.file_name()), config)?,
            docdata: BTree::create(dir.join(Table::DocData.file_name()), config)?,
            spelling: BTree::create(dir.join(Table::Spelling.file_name()), config)?,
            synonym: BTree::create(dir.join(Table::Synonym.file_name()), config)?,
        })
    }

    // A table absent from the version file is treated as brand new and
    // created fresh. This is correct for spelling/synonym tables a database
    // has simply never used, but relies on `Shard::commit`'s documented
    // partial-failure case never having left an unregistered, non-empty
    // table file behind for an earlier table in the fixed commit order — if
    // the very first commit a shard ever makes fails after some tables
    // committed but before the version file itself was written, a reopen
    // would re-`create` over that table's now-nonempty file. Accepted as a
    // narrow edge case rather than adding file-presence probing here.
    fn open(dir: &Path, config: TableConfig, version: &DatabaseVersion) -> Result<Self> {
        let open_one = |table: Table| -> Result<BTree> {
            let path = dir.join(table.file_name());
            match version.root_for(table.name()) {
                Some(info) => BTree::open(path, config, *info),
                None => BTree::create(path, config),
            }
        };
        Ok(Tables {
            postlist: open_one(Table::PostList)?,
            termlist: open_one(Table::TermList)?,
            position: open_one(Table::Position)?,
            docdata: open_one(Table::DocData)?,
            spelling: open_one(Table::Spelling)?,
            synonym: open_one(Table::Synonym)?,
        })
    }

    fn get(&self, table: Table) -> &BTree {
        match table {
            Table::PostList => &self.postlist,
            Table::TermList => &self.termlist,
            Table::Position => &self.position,
            Table::DocData => &self.docdata,
            Table::Spelling => &self.spelling,
            Table::Synonym => &self.synonym,
        }
    }

    fn get_mut_table(&mut self, table: Table) -> &mut BTree {
        match table {
            Table::PostList => &mut self.postlist,
            Table::TermList => &mut self.termlist,
            Table::Position => &mut self.position,
            Table::DocData => &mut self.docdata,
            Table::Spelling => &mut self.spelling,
            Table::Synonym => &mut self.synonym,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&'static str, &BTree)> {
        Table::ALL.iter().map(move |&t| (t.name(), self.get(t)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (&'static str, &mut BTree)> {
        [
            (Table::PostList.name(), &mut self.postlist),
            (Table::TermList.name(), &mut self.termlist),
            (Table::Position.name(), &mut self.position),
            (Table::DocData.name(), &mut self.docdata),
            (Table::Spelling.name(), &mut self.spelling),
            (Table::Synonym.name(), &mut self.synonym),
        ]
        .into_iter()
    }
}

/// One of the two tables whose keys are caller-defined metadata rather
/// than docid-derived (§4.7: "spelling/synonym: keys are metadata").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataTable {
    Spelling,
    Synonym,
}

impl MetadataTable {
    fn table(self) -> Table {
        match self {
            MetadataTable::Spelling => Table::Spelling,
            MetadataTable::Synonym => Table::Synonym,
        }
    }
}

/// One posting: a term occurring in a document, its within-document
/// frequency, and the positions it occurs at (empty if position data isn't
/// tracked for this field).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Posting {
    pub term: String,
    pub wdf: u32,
    pub positions: Vec<u32>,
}

/// A document to be indexed: its opaque stored value plus the postings
/// that should be added to the postlist/termlist/position tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewDocument {
    pub data: Vec<u8>,
    pub doclen: u32,
    pub postings: Vec<Posting>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TermEntry {
    term: String,
    wdf: u32,
}

impl Encode for TermEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        self.term.encode_to(buf)?;
        VarU64(u64::from(self.wdf)).encode_to(buf)
    }
}

impl Decode for TermEntry {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let (term, mut n) = String::decode_from(buf)?;
        let (wdf, m) = VarU64::decode_from(&buf[n..])?;
        n += m;
        Ok((
            TermEntry {
                term,
                wdf: wdf.0 as u32,
            },
            n,
        ))
    }
}

/// The tag stored under a docid in the termlist table.
struct TermListTag {
    doclen: u32,
    terms: Vec<TermEntry>,
}

impl Encode for TermListTag {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        VarU64(u64::from(self.doclen)).encode_to(buf)?;
        encode_vec(&self.terms, buf)
    }
}

impl Decode for TermListTag {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let (doclen, mut n) = VarU64::decode_from(buf)?;
        let (terms, m) = decode_vec::<TermEntry>(&buf[n..])?;
        n += m;
        Ok((
            TermListTag {
                doclen: doclen.0 as u32,
                terms,
            },
            n,
        ))
    }
}

/// Iterator returned by [`Shard::iter_all_terms`]: walks the postlist table
/// in ascending term order, decoding each tag lazily.
pub struct ShardTermIter<'a> {
    cursor: Cursor<'a>,
    started: bool,
}

impl Iterator for ShardTermIter<'_> {
    type Item = Result<(String, Vec<(u32, u32)>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.cursor.rewind();
        }
        if let Err(e) = self.cursor.next() {
            return Some(Err(e));
        }
        let key = self.cursor.key()?;
        let term = String::from_utf8_lossy(&key).into_owned();
        let tag = match self.cursor.read_tag() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Some(Err(Error::DatabaseCorrupt("positioned postlist cursor has no tag".into()))),
            Err(e) => return Some(Err(e)),
        };
        let entries = match decode_posting_entries(&tag) {
            Ok(entries) => entries,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok((term, entries.into_iter().map(|e| (e.docid, e.wdf)).collect())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PostingEntry {
    docid: u32,
    wdf: u32,
}

impl Encode for PostingEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> std::result::Result<(), EncodingError> {
        VarU64(u64::from(self.docid)).encode_to(buf)?;
        VarU64(u64::from(self.wdf)).encode_to(buf)
    }
}

impl Decode for PostingEntry {
    fn decode_from(buf: &[u8]) -> std::result::Result<(Self, usize), EncodingError> {
        let (docid, mut n) = VarU64::decode_from(buf)?;
        let (wdf, m) = VarU64::decode_from(&buf[n..])?;
        n += m;
        Ok((
            PostingEntry {
                docid: docid.0 as u32,
                wdf: wdf.0 as u32,
            },
            n,
        ))
    }
}

fn docid_key(docid: u32) -> Vec<u8> {
    docid.to_be_bytes().to_vec()
}

fn key_to_docid(key: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = key
        .try_into()
        .map_err(|_| Error::DatabaseCorrupt("docdata key is not 4 bytes".into()))?;
    Ok(u32::from_be_bytes(bytes))
}

fn position_key(docid: u32, term: &str) -> Vec<u8> {
    let mut key = docid_key(docid);
    key.extend_from_slice(term.as_bytes());
    key
}

fn check_key_len(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY {
        return Err(Error::InvalidArgument(format!(
            "key length {} outside 1..={MAX_KEY}",
            key.len()
        )));
    }
    Ok(())
}

fn encode_positions(positions: &[u32]) -> Vec<u8> {
    let varints: Vec<VarU64> = positions.iter().map(|&p| VarU64(u64::from(p))).collect();
    let mut buf = Vec::new();
    encode_vec(&varints, &mut buf).expect("VarU64 encoding cannot fail");
    buf
}

fn decode_positions(bytes: &[u8]) -> Result<Vec<u32>> {
    let (varints, _) = decode_vec::<VarU64>(bytes)
        .map_err(|e| Error::DatabaseCorrupt(format!("position list entry: {e}")))?;
    Ok(varints.into_iter().map(|v| v.0 as u32).collect())
}

fn decode_posting_entries(bytes: &[u8]) -> Result<Vec<PostingEntry>> {
    let (entries, _) = decode_vec::<PostingEntry>(bytes)
        .map_err(|e| Error::DatabaseCorrupt(format!("postlist entry: {e}")))?;
    Ok(entries)
}

fn encode_posting_entries(entries: &[PostingEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_vec(entries, &mut buf).expect("PostingEntry encoding cannot fail");
    buf
}

fn decode_term_list_tag(bytes: &[u8]) -> Result<TermListTag> {
    let (tag, _) = TermListTag::decode_from(bytes)
        .map_err(|e| Error::DatabaseCorrupt(format!("termlist entry: {e}")))?;
    Ok(tag)
}

fn encode_term_list_tag(tag: &TermListTag) -> Vec<u8> {
    let mut buf = Vec::new();
    tag.encode_to(&mut buf).expect("TermListTag encoding cannot fail");
    buf
}

const LOCK_FILE_NAME: &str = ".lock";

/// Marker file held for the lifetime of a writable [`Shard`], enforcing
/// the "one writer at a time" rule (§4.5, §5).
///
/// This is a `create_new` marker file rather than a real `flock`/`fcntl`
/// advisory lock: no flock-wrapping crate appears anywhere in this crate's
/// dependency stack, and a marker file is the standard no-extra-deps
/// idiom for single-writer enforcement (the same shape as a PID lockfile).
/// Known limitation: a process that is killed without unwinding (so the
/// `Drop` below never runs) leaves a stale lock behind; a real flock would
/// release automatically when the file descriptor closes. Left unhandled
/// since taking on a locking crate's own dependency footprint is a bigger
/// change than this shard layer warrants.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove shard lock file");
        }
    }
}

fn acquire_lock(dir: &Path) -> Result<LockGuard> {
    let path = dir.join(LOCK_FILE_NAME);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(_) => Ok(LockGuard { path }),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::DatabaseLock),
        Err(e) => Err(e.into()),
    }
}

/// A shard: one directory holding a version file and the fixed set of
/// tables it names (§4.5).
pub struct Shard {
    dir: PathBuf,
    config: Config,
    version: DatabaseVersion,
    tables: Tables,
    last_committed_stats: DatabaseStats,
    _lock: Option<LockGuard>,
}

impl Shard {
    /// Create a brand-new, empty shard at `dir`, which must not already
    /// contain a version file. Always writable; takes the writer lock.
    pub fn create(dir: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let lock = acquire_lock(&dir)?;
        let version = DatabaseVersion::create(&dir);
        let tables = Tables::create(&dir, config.table)?;
        let last_committed_stats = *version.stats();
        Ok(Shard {
            dir,
            config,
            version,
            tables,
            last_committed_stats,
            _lock: Some(lock),
        })
    }

    /// Open an existing shard. `writable` requests the writer lock
    /// ([`Error::DatabaseLock`] if another writable handle is already
    /// open); a read-only handle takes no lock and never mutates the shard.
    pub fn open(dir: impl Into<PathBuf>, config: Config, writable: bool) -> Result<Self> {
        let dir = dir.into();
        let lock = if writable {
            Some(acquire_lock(&dir)?)
        } else {
            None
        };
        let version = DatabaseVersion::open(&dir)?;
        let tables = Tables::open(&dir, config.table, &version)?;
        let last_committed_stats = *version.stats();
        Ok(Shard {
            dir,
            config,
            version,
            tables,
            last_committed_stats,
            _lock: lock,
        })
    }

    /// The directory this shard's version file and tables live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn revision(&self) -> u64 {
        self.version.revision()
    }

    pub fn get_doccount(&self) -> u64 {
        self.version.stats().doccount
    }

    pub fn get_lastdocid(&self) -> u64 {
        self.version.stats().last_docid
    }

    pub fn get_avlength(&self) -> f64 {
        let stats = self.version.stats();
        if stats.doccount == 0 {
            0.0
        } else {
            stats.total_doclen as f64 / stats.doccount as f64
        }
    }

    /// Docids and within-document frequencies for `term`, in postlist
    /// order (ascending docid, since postings are appended as documents
    /// are added in increasing docid order and never reordered in place).
    pub fn open_post_list(&self, term: &str) -> Result<Vec<(u32, u32)>> {
        check_key_len(term.as_bytes())?;
        match self.tables.get(Table::PostList).get_exact_entry(term.as_bytes())? {
            None => Ok(Vec::new()),
            Some(tag) => Ok(decode_posting_entries(&tag)?
                .into_iter()
                .map(|e| (e.docid, e.wdf))
                .collect()),
        }
    }

    /// A document's length and `(term, wdf)` pairs, or `None` if the docid
    /// is not present.
    pub fn open_term_list(&self, docid: u32) -> Result<Option<(u32, Vec<(String, u32)>)>> {
        match self
            .tables
            .get(Table::TermList)
            .get_exact_entry(&docid_key(docid))?
        {
            None => Ok(None),
            Some(bytes) => {
                let tag = decode_term_list_tag(&bytes)?;
                Ok(Some((
                    tag.doclen,
                    tag.terms.into_iter().map(|t| (t.term, t.wdf)).collect(),
                )))
            }
        }
    }

    /// The positions `term` occurs at within `docid`, empty if neither the
    /// document nor position data for that term exists.
    pub fn open_position_list(&self, docid: u32, term: &str) -> Result<Vec<u32>> {
        let key = position_key(docid, term);
        check_key_len(&key)?;
        match self.tables.get(Table::Position).get_exact_entry(&key)? {
            None => Ok(Vec::new()),
            Some(bytes) => decode_positions(&bytes),
        }
    }

    /// The stored document value, or `None` if `docid` is not present.
    pub fn open_document(&self, docid: u32) -> Result<Option<Vec<u8>>> {
        self.tables.get(Table::DocData).get_exact_entry(&docid_key(docid))
    }

    /// Reconstruct everything needed to reindex `docid` elsewhere: its
    /// stored value, length, and every posting with its positions. `None`
    /// if the docid isn't present. Used by the compactor (§4.7), which
    /// copies documents into the output shard under rewritten docids
    /// rather than merging the postlist/termlist/position tables' raw
    /// bytes directly — simpler, and just as exact, since it reuses the
    /// same `index_document` path every other mutation goes through.
    pub fn full_document(&self, docid: u32) -> Result<Option<NewDocument>> {
        let Some(data) = self.open_document(docid)? else {
            return Ok(None);
        };
        let (doclen, terms) = self
            .open_term_list(docid)?
            .ok_or_else(|| Error::DatabaseCorrupt("docdata entry without matching termlist entry".into()))?;
        let mut postings = Vec::with_capacity(terms.len());
        for (term, wdf) in terms {
            let positions = self.open_position_list(docid, &term)?;
            postings.push(Posting {
                term,
                wdf,
                positions,
            });
        }
        Ok(Some(NewDocument {
            data,
            doclen,
            postings,
        }))
    }

    /// The minimum and maximum docid currently stored, or `None` if the
    /// shard has no documents. Used by the compactor to plan renumbering.
    pub fn get_used_docid_range(&self) -> Result<Option<(u32, u32)>> {
        let docdata = self.tables.get(Table::DocData);
        let mut cursor = docdata.open_cursor();
        cursor.rewind();
        cursor.next()?;
        let Some(first_key) = cursor.key() else {
            return Ok(None);
        };
        let first = key_to_docid(&first_key)?;

        cursor.to_end();
        cursor.prev()?;
        let last_key = cursor
            .key()
            .ok_or_else(|| Error::DatabaseCorrupt("docdata non-empty on next() but empty on prev()".into()))?;
        let last = key_to_docid(&last_key)?;

        Ok(Some((first, last)))
    }

    /// An ascending-term iterator over every term currently posted in this
    /// shard, each paired with its postlist (docid, wdf) entries. Used by
    /// the multi-shard merged all-terms iterator (§4.6), which needs to
    /// walk every shard's postlist table in lockstep rather than look up
    /// terms one at a time.
    pub fn iter_all_terms(&self) -> ShardTermIter<'_> {
        ShardTermIter {
            cursor: self.tables.get(Table::PostList).open_cursor(),
            started: false,
        }
    }

    /// Index `doc` under `docid`, batching writes across postlist,
    /// termlist, position, and docdata. Part of the shard's pending
    /// mutation set; has no effect on readers until [`Shard::commit`].
    fn index_document(&mut self, docid: u32, doc: &NewDocument) -> Result<()> {
        for posting in &doc.postings {
            check_key_len(posting.term.as_bytes())?;
            if !posting.positions.is_empty() {
                check_key_len(&position_key(docid, &posting.term))?;
            }
        }

        let key = docid_key(docid);
        self.tables.get_mut_table(Table::DocData).add(&key, &doc.data, false)?;

        let term_entries: Vec<TermEntry> = doc
            .postings
            .iter()
            .map(|p| TermEntry {
                term: p.term.clone(),
                wdf: p.wdf,
            })
            .collect();
        let term_list_tag = encode_term_list_tag(&TermListTag {
            doclen: doc.doclen,
            terms: term_entries,
        });
        self.tables
            .get_mut_table(Table::TermList)
            .add(&key, &term_list_tag, false)?;

        for posting in &doc.postings {
            self.version.stats_mut().check_wdf(u64::from(posting.wdf));

            if !posting.positions.is_empty() {
                let pos_key = position_key(docid, &posting.term);
                self.tables
                    .get_mut_table(Table::Position)
                    .add(&pos_key, &encode_positions(&posting.positions), false)?;
            }

            let mut entries = match self
                .tables
                .get(Table::PostList)
                .get_exact_entry(posting.term.as_bytes())?
            {
                Some(bytes) => decode_posting_entries(&bytes)?,
                None => Vec::new(),
            };
            entries.retain(|e| e.docid != docid);
            // Keep ascending-docid order (relied on by `open_post_list`'s
            // callers and `multi::MergedTermIter`), not just append order.
            let insert_at = entries.partition_point(|e| e.docid < docid);
            entries.insert(
                insert_at,
                PostingEntry {
                    docid,
                    wdf: posting.wdf,
                },
            );
            self.tables.get_mut_table(Table::PostList).add(
                posting.term.as_bytes(),
                &encode_posting_entries(&entries),
                false,
            )?;
        }

        self.version.stats_mut().add_document(u64::from(doc.doclen));
        Ok(())
    }

    /// Remove `docid` and every posting/position entry derived from it,
    /// returning whether it was present.
    fn deindex_document(&mut self, docid: u32) -> Result<bool> {
        let key = docid_key(docid);
        let Some(bytes) = self.tables.get(Table::TermList).get_exact_entry(&key)? else {
            return Ok(false);
        };
        let term_list_tag = decode_term_list_tag(&bytes)?;

        self.tables.get_mut_table(Table::DocData).del(&key)?;
        self.tables.get_mut_table(Table::TermList).del(&key)?;

        for entry in &term_list_tag.terms {
            let pos_key = position_key(docid, &entry.term);
            self.tables.get_mut_table(Table::Position).del(&pos_key)?;

            if let Some(bytes) = self
                .tables
                .get(Table::PostList)
                .get_exact_entry(entry.term.as_bytes())?
            {
                let mut entries = decode_posting_entries(&bytes)?;
                entries.retain(|e| e.docid != docid);
                if entries.is_empty() {
                    self.tables.get_mut_table(Table::PostList).del(entry.term.as_bytes())?;
                } else {
                    self.tables
                        .get_mut_table(Table::PostList)
                        .add(entry.term.as_bytes(), &encode_posting_entries(&entries), false)?;
                }
            }
        }

        self.version
            .stats_mut()
            .delete_document(u64::from(term_list_tag.doclen));
        Ok(true)
    }

    /// Index `doc` under a freshly allocated docid, returning it.
    pub fn add_document(&mut self, doc: NewDocument) -> Result<u32> {
        let docid = self.version.stats_mut().get_next_docid() as u32;
        self.index_document(docid, &doc)?;
        Ok(docid)
    }

    /// Replace the document at `docid` with `doc`, indexing it under that
    /// same docid whether or not one was previously stored there (matching
    /// Xapian's `replace_document`, which also serves as a targeted insert).
    pub fn replace_document(&mut self, docid: u32, doc: NewDocument) -> Result<()> {
        if docid == 0 {
            return Err(Error::InvalidOperation("docid 0 is not valid".into()));
        }
        self.deindex_document(docid)?;
        self.index_document(docid, &doc)
    }

    /// Remove the document at `docid`, returning whether it was present.
    pub fn delete_document(&mut self, docid: u32) -> Result<bool> {
        self.deindex_document(docid)
    }

    /// Remove every document indexed under `unique_term` (Xapian's
    /// `delete_document(term)`, typically used with an externally-unique
    /// identifier term). Returns the number of documents removed.
    pub fn delete_document_by_term(&mut self, unique_term: &str) -> Result<usize> {
        let docids: Vec<u32> = self
            .open_post_list(unique_term)?
            .into_iter()
            .map(|(docid, _)| docid)
            .collect();
        let mut removed = 0;
        for docid in docids {
            if self.deindex_document(docid)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every `(key, tag)` pair currently stored in `table`, in ascending
    /// key order. Used by the compactor to merge spelling/synonym data,
    /// which isn't keyed by docid and so can't go through
    /// [`Shard::full_document`]'s per-document reconstruction.
    pub fn iter_metadata_table(&self, table: MetadataTable) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let btree = self.tables.get(table.table());
        let mut cursor = btree.open_cursor();
        cursor.rewind();
        let mut out = Vec::new();
        loop {
            cursor.next()?;
            let Some(key) = cursor.key() else { break };
            let tag = cursor
                .read_tag()?
                .ok_or_else(|| Error::DatabaseCorrupt("positioned metadata cursor has no tag".into()))?;
            out.push((key, tag));
        }
        Ok(out)
    }

    /// Store `tag` under `key` in `table`, overwriting any existing entry.
    /// Part of the shard's pending mutation set.
    pub fn put_metadata(&mut self, table: MetadataTable, key: &[u8], tag: &[u8]) -> Result<()> {
        check_key_len(key)?;
        self.tables.get_mut_table(table.table()).add(key, tag, false)
    }

    /// Widen the in-memory `last_docid` stat to at least `at_least`,
    /// never lowering it. `replace_document` indexes under a caller-chosen
    /// docid rather than auto-allocating one, so it never advances
    /// `last_docid` itself (only [`Shard::add_document`] does, via
    /// [`DatabaseStats::get_next_docid`]); the compactor (§4.7) uses this
    /// after writing a dense renumbered docid range to make the output
    /// shard's `get_lastdocid()` agree with what was actually written,
    /// the same widen-never-shrink rule [`DatabaseStats::merge_stats`]
    /// already applies to `last_docid` when combining two shards' stats.
    pub fn bump_lastdocid(&mut self, at_least: u64) {
        let stats = self.version.stats_mut();
        stats.last_docid = stats.last_docid.max(at_least);
    }

    /// Docids currently present in the shard, ascending. Used by the
    /// compactor to enumerate documents to copy without probing every
    /// integer in `get_used_docid_range`'s span one at a time.
    pub fn iter_docids(&self) -> Result<Vec<u32>> {
        let docdata = self.tables.get(Table::DocData);
        let mut cursor = docdata.open_cursor();
        cursor.rewind();
        let mut out = Vec::new();
        loop {
            cursor.next()?;
            let Some(key) = cursor.key() else { break };
            out.push(key_to_docid(&key)?);
        }
        Ok(out)
    }

    /// Toggle full-compaction mode (§4.2.2) on every table: subsequent
    /// `commit()`s pack blocks as densely as possible instead of leaving
    /// sequential-insertion headroom. Used by the compactor (§4.7), which
    /// writes a fresh output shard it knows will never be appended to
    /// again in insertion order.
    pub fn set_full_compaction(&mut self, enabled: bool) {
        for (_, table) in self.tables.iter_mut() {
            table.set_full_compaction(enabled);
        }
    }

    /// Discard every uncommitted mutation since the last [`Shard::commit`]
    /// (or since opening), restoring each table and the in-memory
    /// statistics to their last-committed state.
    pub fn rollback(&mut self) -> Result<()> {
        let mut first_err = None;
        for (_, table) in self.tables.iter_mut() {
            if let Err(e) = table.cancel() {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        *self.version.stats_mut() = self.last_committed_stats;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Commit every table in fixed order, then publish the new version
    /// file (§4.3). If a table's commit fails, the error propagates
    /// immediately: tables committed earlier in this call keep their new
    /// on-disk revision (that can't be undone once written), but the
    /// version file is left untouched, so the shard's externally-visible
    /// state — what [`Shard::open`] sees next time — is still the prior
    /// revision. The newly written blocks in already-committed tables
    /// simply become unreferenced garbage until a future successful
    /// compaction or commit reclaims them.
    pub fn commit(&mut self) -> Result<()> {
        let want_changes = !matches!(self.config.changes_retention, ChangesRetention::Disabled);
        let dirty_snapshots: Vec<(&'static str, Vec<(u32, Vec<u8>)>)> = if want_changes {
            self.tables
                .iter()
                .map(|(name, table)| (name, table.dirty_blocks()))
                .collect()
        } else {
            Vec::new()
        };

        let mut new_roots = Vec::with_capacity(6);
        for (name, table) in self.tables.iter_mut() {
            new_roots.push((name, table.commit()?));
        }

        self.version.commit(&new_roots)?;
        self.last_committed_stats = *self.version.stats();

        if want_changes {
            let revision = self.version.revision() as u32;
            let mut oldest_seen: Option<u32> = None;
            for (name, blocks) in dirty_snapshots {
                let mut writer =
                    ChangesWriter::create(&self.dir, name, revision, self.config.table.block_size)?;
                for (block_no, bytes) in blocks {
                    writer.write_block(block_no, &bytes)?;
                }
                writer.finish()?;
                if let Some(oldest) = prune(&self.dir, name, self.config.changes_retention)? {
                    oldest_seen = Some(oldest_seen.map_or(oldest, |o| o.min(oldest)));
                }
            }
            // Persisted on the *next* commit: this revision's version file
            // was already durably written above, so this only updates the
            // in-memory stat. Acceptable given the changes log is optional
            // (§4.4) and `oldest_changeset` only needs to be a safe lower
            // bound for replicas catching up, not exact-as-of-this-instant.
            if let Some(oldest) = oldest_seen {
                self.version.stats_mut().oldest_changeset = u64::from(oldest);
            }
        }
        Ok(())
    }
}
