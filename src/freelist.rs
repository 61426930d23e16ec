//! Persistent, copy-on-write freelist of reusable block numbers (§3, §4.1).
//!
//! Grounded on `examples/original_source/xapian-core/backends/honey/honey_freelist.cc`:
//! the freelist is itself a chain of blocks inside the same table file, each
//! holding a run of freed block numbers followed by a pointer to the next
//! freelist block (or a sentinel when the chain ends). The sentinel is
//! modeled as `Option<u32>` here rather than the source's `(uint32)-1`, per
//! the redesign note in `SPEC_FULL.md` §9.
//!
//! A block freed during the pending-commit window is not immediately
//! available for reuse — it becomes available starting with the *next*
//! revision, so readers of the current revision never see it recycled out
//! from under them. `Freelist::commit` is the point where pending frees join
//! the pool of blocks `next_free_block` may hand out.
//!
//! The source also defers freeing a freelist block that itself becomes empty
//! or superseded, via a one-slot pending variable, to avoid a recursive
//! "freeing a block requires freelist space which requires freeing a block"
//! loop. [`Freelist::queue_free`] reproduces that one-slot deferral.

use std::collections::VecDeque;

use crate::block::{Block, BlockStore, HEADER_SIZE, LEVEL_FREELIST};
use crate::error::{Error, Result};

/// Bytes reserved at the end of a freelist block for the next-block pointer.
const NEXT_PTR_SIZE: usize = 4;

/// Sentinel written on disk for "no next block" / "slot unused" — kept only
/// at the wire-format boundary; the in-memory API always uses `Option<u32>`.
const UNUSED: u32 = u32::MAX;

/// Bytes reserved at the start of the payload for an explicit entry count,
/// so an under-full chunk's zero-padded tail is never mistaken for the
/// valid block number 0.
const COUNT_SIZE: usize = 2;

fn encode_freelist_block(block_size: u32, revision: u32, numbers: &[u32], next: Option<u32>) -> Block {
    let mut block = Block::new_empty(block_size, LEVEL_FREELIST, revision);
    // Freelist blocks don't use the item/directory abstraction; write the
    // raw payload directly after the header.
    let mut raw = block.as_bytes().to_vec();
    raw[HEADER_SIZE..HEADER_SIZE + COUNT_SIZE].copy_from_slice(&(numbers.len() as u16).to_be_bytes());
    let mut pos = HEADER_SIZE + COUNT_SIZE;
    for n in numbers {
        raw[pos..pos + 4].copy_from_slice(&n.to_be_bytes());
        pos += 4;
    }
    let tail = raw.len() - NEXT_PTR_SIZE;
    raw[tail..].copy_from_slice(&next.unwrap_or(UNUSED).to_be_bytes());
    block = Block::from_bytes(raw).expect("freelist block re-encodes to a valid header");
    block
}

fn decode_freelist_block(block: &Block) -> Result<(Vec<u32>, Option<u32>)> {
    let raw = block.as_bytes();
    if raw.len() < HEADER_SIZE + COUNT_SIZE + NEXT_PTR_SIZE {
        return Err(Error::DatabaseCorrupt("freelist block too small".into()));
    }
    let tail = raw.len() - NEXT_PTR_SIZE;
    let next_raw = u32::from_be_bytes(raw[tail..].try_into().expect("4 bytes"));
    let next = if next_raw == UNUSED { None } else { Some(next_raw) };

    let count = u16::from_be_bytes(
        raw[HEADER_SIZE..HEADER_SIZE + COUNT_SIZE]
            .try_into()
            .expect("2 bytes"),
    ) as usize;
    let mut numbers = Vec::with_capacity(count);
    let mut pos = HEADER_SIZE + COUNT_SIZE;
    for _ in 0..count {
        if pos + 4 > tail {
            return Err(Error::DatabaseCorrupt(
                "freelist block entry count overruns payload".into(),
            ));
        }
        numbers.push(u32::from_be_bytes(raw[pos..pos + 4].try_into().expect("4 bytes")));
        pos += 4;
    }
    Ok((numbers, next))
}

/// Capacity (in block numbers) of one freelist block's payload.
fn capacity(block_size: u32) -> usize {
    (block_size as usize - HEADER_SIZE - COUNT_SIZE - NEXT_PTR_SIZE) / 4
}

/// Read every block number reachable from `head`, returning them alongside
/// the block numbers making up the chain itself (so callers can recycle the
/// chain's own blocks once it's superseded).
fn walk_chain(store: &mut BlockStore, head: Option<u32>) -> Result<(Vec<u32>, Vec<u32>)> {
    let mut numbers = Vec::new();
    let mut chain_blocks = Vec::new();
    let mut cursor = head;
    while let Some(block_no) = cursor {
        let block = store.read_block(block_no)?;
        if !block.is_freelist() {
            return Err(Error::DatabaseCorrupt(format!(
                "block {block_no} referenced by freelist chain is not a freelist block"
            )));
        }
        let (nums, next) = decode_freelist_block(&block)?;
        numbers.extend(nums);
        chain_blocks.push(block_no);
        cursor = next;
    }
    Ok((numbers, chain_blocks))
}

/// The freelist for one table, as of a particular revision.
#[derive(Debug)]
pub struct Freelist {
    /// Free block numbers available for immediate reuse this revision.
    available: VecDeque<u32>,
    /// Blocks that made up the chain this freelist was loaded from; they are
    /// superseded (and thus themselves freeable) once a new chain is
    /// committed.
    stale_chain_blocks: Vec<u32>,
    /// Blocks freed during the current pending-commit window; not reusable
    /// until the *next* commit.
    pending_frees: Vec<u32>,
    /// One-slot deferred free, used when freeing a freelist block would
    /// otherwise recursively require freelist space.
    pending_slot: Option<u32>,
}

impl Freelist {
    /// Load the freelist chain rooted at `head` (as recorded in the
    /// table's `RootInfo` for the currently-open revision).
    pub fn open(store: &mut BlockStore, head: Option<u32>) -> Result<Self> {
        let (numbers, chain_blocks) = walk_chain(store, head)?;
        Ok(Freelist {
            available: numbers.into(),
            stale_chain_blocks: chain_blocks,
            pending_frees: Vec::new(),
            pending_slot: None,
        })
    }

    /// An empty freelist, for a brand-new table.
    pub fn empty() -> Self {
        Freelist {
            available: VecDeque::new(),
            stale_chain_blocks: Vec::new(),
            pending_frees: Vec::new(),
            pending_slot: None,
        }
    }

    /// Return a block number to use for a new write: first from the
    /// freelist's read pointer, else by growing the file.
    pub fn next_free_block(&mut self, store: &mut BlockStore) -> Result<u32> {
        if let Some(n) = self.available.pop_front() {
            return Ok(n);
        }
        let placeholder = Block::new_empty(store.block_size(), 0, 0);
        store.append_block(&placeholder)
    }

    /// Record that `n` is no longer needed after the current revision
    /// commits.
    pub fn free_block(&mut self, n: u32) {
        self.pending_frees.push(n);
    }

    /// Defer freeing a freelist block itself, via the one-slot pending
    /// variable described in the module docs.
    fn queue_free(&mut self, n: u32) {
        if let Some(previous) = self.pending_slot.replace(n) {
            self.pending_frees.push(previous);
        }
    }

    /// All block numbers this freelist currently considers free (available
    /// for reuse plus pending from this revision), for diagnostics and the
    /// P5 disjointness property test.
    pub fn all_free_blocks(&self) -> Vec<u32> {
        let mut all: Vec<u32> = self.available.iter().copied().collect();
        all.extend(self.pending_frees.iter().copied());
        all.extend(self.pending_slot);
        all
    }

    /// Seal the freelist for `revision`: fold still-available blocks and
    /// this revision's pending frees (including the stale chain blocks
    /// themselves) into a freshly written chain, and return its head block
    /// number (`None` if the freelist is now empty).
    pub fn commit(&mut self, store: &mut BlockStore, revision: u32) -> Result<Option<u32>> {
        for stale in std::mem::take(&mut self.stale_chain_blocks) {
            self.queue_free(stale);
        }
        if let Some(last) = self.pending_slot.take() {
            self.pending_frees.push(last);
        }

        let mut content: Vec<u32> = self.available.drain(..).collect();
        content.append(&mut self.pending_frees);

        if content.is_empty() {
            return Ok(None);
        }

        let cap = capacity(store.block_size());
        let chunks: Vec<Vec<u32>> = content.chunks(cap.max(1)).map(|c| c.to_vec()).collect();

        let mut chunk_block_nos = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let placeholder = Block::new_empty(store.block_size(), LEVEL_FREELIST, revision);
            chunk_block_nos.push(store.append_block(&placeholder)?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = chunk_block_nos.get(i + 1).copied();
            let block = encode_freelist_block(store.block_size(), revision, chunk, next);
            store.write_block(chunk_block_nos[i], &block)?;
        }

        let head = chunk_block_nos.first().copied();
        self.stale_chain_blocks = chunk_block_nos;
        Ok(head)
    }
}
