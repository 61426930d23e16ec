//! Multi-shard overlay (§4.6): presents an ordered sequence of shards as one
//! logical database, interleaving docids across them.
//!
//! Grounded on `engine/utils.rs`'s `MergeIterator` (a `BinaryHeap`-based
//! k-way merge over per-source record streams, ordered `(key ASC, ...)`)
//! adapted from merging per-SSTable `Record` streams to merging per-shard
//! postlist cursors ([`Shard::iter_all_terms`]), summing frequencies across
//! shards that share a term instead of preferring the highest-LSN version.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::shard::Shard;

/// Maps a global docid to the shard and local docid that store it, and
/// back. Chosen so a run of consecutive global docids spreads evenly across
/// shards (§4.6): `s = (g−1) mod N`, `d = (g−1) div N + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDocId {
    pub shard: usize,
    pub local_docid: u32,
}

/// Split `global` into its shard index and local docid, given `shard_count`
/// shards. Panics if `shard_count` is zero or `global` is zero (docid 0 is
/// never valid, per the shard layer).
pub fn split_docid(global: u32, shard_count: usize) -> GlobalDocId {
    assert!(shard_count > 0, "a multi database must have at least one shard");
    assert!(global > 0, "docid 0 is not valid");
    let n = shard_count as u64;
    let g = u64::from(global) - 1;
    GlobalDocId {
        shard: (g % n) as usize,
        local_docid: (g / n + 1) as u32,
    }
}

/// The inverse of [`split_docid`]: recover the global docid for a shard
/// index and local docid, given `shard_count` shards.
pub fn join_docid(shard: usize, local_docid: u32, shard_count: usize) -> u32 {
    assert!(shard_count > 0, "a multi database must have at least one shard");
    assert!(shard < shard_count, "shard index out of range");
    assert!(local_docid > 0, "docid 0 is not valid");
    ((local_docid - 1) as u64 * shard_count as u64 + shard as u64 + 1) as u32
}

/// An ordered sequence of shards presented as one logical database.
pub struct MultiDatabase {
    shards: Vec<Shard>,
}

impl MultiDatabase {
    /// Wrap an ordered sequence of already-open shards. Order matters: it
    /// fixes the `s` in the `g ↔ (s,d)` mapping for every later lookup.
    pub fn new(shards: Vec<Shard>) -> Self {
        MultiDatabase { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> &Shard {
        &self.shards[index]
    }

    pub fn shard_mut(&mut self, index: usize) -> &mut Shard {
        &mut self.shards[index]
    }

    /// Sum of every shard's `get_doccount()`.
    pub fn get_doccount(&self) -> u64 {
        self.shards.iter().map(Shard::get_doccount).sum()
    }

    /// Sum of every shard's `get_lastdocid()`. Not itself a meaningful
    /// global docid (shards number their own documents independently); use
    /// [`join_docid`]/[`split_docid`] for that.
    pub fn get_total_lastdocid(&self) -> u64 {
        self.shards.iter().map(Shard::get_lastdocid).sum()
    }

    /// Collection-wide average document length, computed from summed
    /// per-shard doccount/total length rather than averaging the per-shard
    /// averages (which would misweight unevenly sized shards).
    pub fn get_avlength(&self) -> f64 {
        let (doccount, total_doclen) = self.shards.iter().fold((0u64, 0u64), |(dc, tl), s| {
            (dc + s.get_doccount(), tl + (s.get_avlength() * s.get_doccount() as f64).round() as u64)
        });
        if doccount == 0 {
            0.0
        } else {
            total_doclen as f64 / doccount as f64
        }
    }

    /// Open the document stored at global docid `global`.
    pub fn open_document(&self, global: u32) -> Result<Option<Vec<u8>>> {
        let id = split_docid(global, self.shards.len());
        self.shards[id.shard].open_document(id.local_docid)
    }

    /// Translate `global`'s shard/local mapping without touching disk.
    pub fn split_docid(&self, global: u32) -> GlobalDocId {
        split_docid(global, self.shards.len())
    }

    /// The inverse of [`MultiDatabase::split_docid`].
    pub fn join_docid(&self, shard: usize, local_docid: u32) -> u32 {
        join_docid(shard, local_docid, self.shards.len())
    }

    /// A merged, ascending-term iterator over every shard, yielding each
    /// distinct term once with its docid+wdf postings translated to global
    /// docids and its collection frequency (the summed postings count)
    /// alongside.
    ///
    /// Implemented as a `BinaryHeap`-based k-way merge rather than
    /// collecting and sorting every shard's terms up front, so memory use
    /// stays proportional to the number of shards rather than the total
    /// vocabulary size.
    pub fn iter_all_terms(&self) -> MergedTermIter<'_> {
        let mut heap = BinaryHeap::new();
        let mut iters: Vec<_> = self.shards.iter().map(Shard::iter_all_terms).collect();
        for (idx, iter) in iters.iter_mut().enumerate() {
            if let Some(item) = iter.next() {
                match item {
                    Ok((term, postings)) => heap.push(MergeEntry {
                        term,
                        postings,
                        source_idx: idx,
                    }),
                    Err(e) => {
                        return MergedTermIter {
                            iters,
                            heap,
                            shard_count: self.shards.len(),
                            pending_err: Some(e),
                        }
                    }
                }
            }
        }
        MergedTermIter {
            iters,
            heap,
            shard_count: self.shards.len(),
            pending_err: None,
        }
    }
}

struct MergeEntry {
    term: String,
    postings: Vec<(u32, u32)>,
    source_idx: usize,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term
    }
}
impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    /// Min-heap by term: reverse so the lexicographically smallest term
    /// pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.term.cmp(&other.term).reverse()
    }
}

/// One term's merged posting list across every shard that contains it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPosting {
    pub term: String,
    /// `(global docid, wdf)` pairs, in ascending shard order then ascending
    /// local docid order (not globally docid-sorted, since interleaving
    /// would require buffering the whole list).
    pub postings: Vec<(u32, u32)>,
    /// Sum of `wdf` across every posting, i.e. the term's total frequency
    /// across the whole collection.
    pub collection_frequency: u64,
}

/// Iterator returned by [`MultiDatabase::iter_all_terms`].
pub struct MergedTermIter<'a> {
    iters: Vec<crate::shard::ShardTermIter<'a>>,
    heap: BinaryHeap<MergeEntry>,
    shard_count: usize,
    pending_err: Option<crate::error::Error>,
}

impl Iterator for MergedTermIter<'_> {
    type Item = Result<MergedPosting>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_err.take() {
            return Some(Err(e));
        }

        let first = self.heap.pop()?;
        let mut postings = Vec::new();
        let term = first.term.clone();

        let mut pending = vec![first];
        // Pull every other shard currently at the same term off the heap
        // too, so the merged entry for `term` is emitted exactly once.
        while let Some(top) = self.heap.peek() {
            if top.term == term {
                pending.push(self.heap.pop().unwrap());
            } else {
                break;
            }
        }

        for entry in pending {
            postings.extend(
                entry
                    .postings
                    .into_iter()
                    .map(|(local, wdf)| (join_docid(entry.source_idx, local, self.shard_count), wdf)),
            );
            match self.iters[entry.source_idx].next() {
                Some(Ok((next_term, next_postings))) => self.heap.push(MergeEntry {
                    term: next_term,
                    postings: next_postings,
                    source_idx: entry.source_idx,
                }),
                Some(Err(e)) => self.pending_err = Some(e),
                None => {}
            }
        }

        let collection_frequency = postings.iter().map(|&(_, wdf)| u64::from(wdf)).sum();
        Some(Ok(MergedPosting {
            term,
            postings,
            collection_frequency,
        }))
    }
}
