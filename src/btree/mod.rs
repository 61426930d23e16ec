//! Ordered key→value B-tree table (§4.2).
//!
//! A `BTree` is a single persistent map backed by [`crate::block::BlockStore`]
//! and [`crate::freelist::Freelist`]. Keys are compared byte-wise; values
//! ("tags") longer than one item are split into a run of leaf items sharing
//! the same key, ordered by an incrementing `component_of` counter.
//!
//! Grounded on the block/item/split mechanics described in
//! `examples/original_source/xapian-core/backends/chert/chert_table.cc`'s
//! header comment, with the CRC-framed-block/thiserror-propagation style of
//! the teacher's `sstable/mod.rs` and `sstable/builder.rs`.
//!
//! Mutating methods (`add`/`del`/`commit`/`cancel`/`set_full_compaction`) take
//! `&mut self`, matching the single-writer concurrency model (§5). Read paths
//! (`get_exact_entry`/`key_exists`/cursors) take `&self`; the block cache and
//! on-disk handle live behind a `RefCell` so a cursor can share read access to
//! the same in-memory working set the writer is building up before commit.

pub mod cursor;

pub use cursor::{Cursor, CursorState};

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use crate::block::{Block, BlockStore, Item};
use crate::compression::{Codec, DeflateCodec};
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::freelist::Freelist;

/// Maximum key length in bytes (§3: "1..MAX_KEY bytes").
pub const MAX_KEY: usize = 255;

/// Large negative sentinel `seq_count` resets to on a non-sequential insert
/// (§4.2.3).
const SEQ_START_POINT: i64 = i64::MIN / 2;

/// Fixed overhead (length prefix + key length byte + component fields) that
/// bounds how much tag payload fits in one leaf item.
const LEAF_ITEM_OVERHEAD: usize = 2 + 1 + 2 + 2;

/// A table's root pointer and bookkeeping as of its last commit, the shape
/// persisted in a table's entry of the version file (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub revision: u32,
    pub root: u32,
    pub level: u8,
    pub block_count: u32,
    pub freelist_head: Option<u32>,
}

struct Inner {
    store: BlockStore,
    freelist: Freelist,
    dirty: HashMap<u32, Block>,
    freed: Vec<u32>,
    root: u32,
    level: u8,
    /// `root`/`level` as of the last commit, so `cancel` can roll back a
    /// root split that hasn't been committed yet.
    base_root: u32,
    base_level: u8,
    /// The freelist chain head as of the last commit, so `cancel` can
    /// reread it from disk — otherwise block numbers popped from the
    /// freelist by an aborted transaction's allocations would leak.
    base_freelist_head: Option<u32>,
    base_revision: u32,
    working_revision: u32,
    seq_count: i64,
    full_compaction: bool,
    cursor_version: u64,
    last_insert_block: Option<u32>,
    last_insert_slot: Option<usize>,
}

/// An ordered, persistent key→value table.
pub struct BTree {
    config: TableConfig,
    codec: DeflateCodec,
    inner: RefCell<Inner>,
}

impl BTree {
    /// Create a brand-new, empty table at `path`.
    pub fn create<P: AsRef<Path>>(path: P, config: TableConfig) -> Result<Self> {
        let mut store = BlockStore::open(path, config.block_size)?;
        // Stamped at the not-yet-committed revision (0), matching `base_revision`
        // below, so `read_block_ro`'s staleness check doesn't trip on this
        // handle's own still-uncommitted root.
        let root_block = Block::new_empty(config.block_size, 0, 0);
        let root = store.append_block(&root_block)?;
        Ok(BTree {
            config,
            codec: DeflateCodec,
            inner: RefCell::new(Inner {
                store,
                freelist: Freelist::empty(),
                dirty: HashMap::new(),
                freed: Vec::new(),
                root,
                level: 0,
                base_root: root,
                base_level: 0,
                base_freelist_head: None,
                base_revision: 0,
                working_revision: 1,
                seq_count: SEQ_START_POINT,
                full_compaction: false,
                cursor_version: 0,
                last_insert_block: None,
                last_insert_slot: None,
            }),
        })
    }

    /// Reopen an existing table at the revision described by `info`.
    pub fn open<P: AsRef<Path>>(path: P, config: TableConfig, info: RootInfo) -> Result<Self> {
        let mut store = BlockStore::open(path, config.block_size)?;
        let freelist = Freelist::open(&mut store, info.freelist_head)?;
        Ok(BTree {
            config,
            codec: DeflateCodec,
            inner: RefCell::new(Inner {
                store,
                freelist,
                dirty: HashMap::new(),
                freed: Vec::new(),
                root: info.root,
                level: info.level,
                base_root: info.root,
                base_level: info.level,
                base_freelist_head: info.freelist_head,
                base_revision: info.revision,
                working_revision: info.revision + 1,
                seq_count: SEQ_START_POINT,
                full_compaction: false,
                cursor_version: 0,
                last_insert_block: None,
                last_insert_slot: None,
            }),
        })
    }

    /// Switch to sequential split mode (§4.2.2, §4.2.3).
    pub fn set_full_compaction(&mut self, enabled: bool) {
        self.inner.borrow_mut().full_compaction = enabled;
    }

    pub fn revision(&self) -> u32 {
        self.inner.borrow().base_revision
    }

    pub(crate) fn root_block_no(&self) -> u32 {
        self.inner.borrow().root
    }

    pub(crate) fn cursor_version(&self) -> u64 {
        self.inner.borrow().cursor_version
    }

    pub(crate) fn read_block_ro(&self, n: u32) -> Result<Block> {
        let mut inner = self.inner.borrow_mut();
        if let Some(b) = inner.dirty.get(&n) {
            return Ok(b.clone());
        }
        let block = inner.store.read_block(n)?;
        // A block stamped with a revision newer than the last one this
        // handle has confirmed can only mean some other writer committed
        // and recycled a block number this handle's snapshot still
        // references (§5, P8) — never this same handle's own doing, since
        // every block it writes itself passes through `dirty` above first.
        if block.revision() > inner.base_revision {
            return Err(Error::DatabaseModified);
        }
        Ok(block)
    }

    fn stage(&self, n: u32, block: Block) {
        let mut inner = self.inner.borrow_mut();
        inner.dirty.insert(n, block);
        inner.cursor_version += 1;
    }

    fn alloc_block(&self, level: u8) -> Result<u32> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.freelist.next_free_block(&mut inner.store)?;
        let revision = inner.working_revision;
        let block = Block::new_empty(inner.store.block_size(), level, revision);
        inner.dirty.insert(n, block);
        Ok(n)
    }

    fn free_block(&self, n: u32) {
        let mut inner = self.inner.borrow_mut();
        inner.dirty.remove(&n);
        inner.freed.push(n);
        inner.cursor_version += 1;
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY {
            return Err(Error::InvalidArgument(format!(
                "key length {} is outside 1..={MAX_KEY}",
                key.len()
            )));
        }
        Ok(())
    }

    /// Open a cursor positioned `Before-start`.
    pub fn open_cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// Point lookup. Returns the fully reassembled (and decompressed, if
    /// applicable) tag, or `None` if `key` is absent.
    pub fn get_exact_entry(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut cursor = self.open_cursor();
        cursor.find_entry_ge(key)?;
        if cursor.key().as_deref() == Some(key) {
            cursor.read_tag()
        } else {
            Ok(None)
        }
    }

    /// As [`BTree::get_exact_entry`] without materializing the tag.
    pub fn key_exists(&self, key: &[u8]) -> Result<bool> {
        let mut cursor = self.open_cursor();
        cursor.find_entry_ge(key)?;
        Ok(cursor.key().as_deref() == Some(key))
    }

    /// Reassemble and decompress the tag starting at `(block, slot)`, whose
    /// item is `first`, continuing into the block's later slots. Splits
    /// never divide a run of items sharing one key (see
    /// `avoid_splitting_a_key_run`), so all of a tag's chunks are always
    /// found within `block`.
    pub(crate) fn assemble_tag(&self, block: &Block, slot: usize, first: &Item) -> Result<Option<Vec<u8>>> {
        let key = &first.key;
        let total = first.total_components.max(1);
        let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(total as usize);
        chunks.push(first.tag().expect("leaf item carries a tag").to_vec());

        let mut cur_block = block.clone();
        let mut cur_slot = slot + 1;
        while (chunks.len() as u16) < total {
            if cur_slot >= cur_block.item_count() {
                return Err(Error::DatabaseCorrupt(format!(
                    "tag for key {key:?} truncated: expected {total} chunks, found {}",
                    chunks.len()
                )));
            }
            let item = cur_block.get_item(cur_slot)?;
            if item.key != *key {
                return Err(Error::DatabaseCorrupt(format!(
                    "tag for key {key:?} truncated before all chunks were read"
                )));
            }
            chunks.push(item.tag().expect("leaf item carries a tag").to_vec());
            cur_slot += 1;
        }

        let mut combined = Vec::new();
        for c in chunks {
            combined.extend_from_slice(&c);
        }

        if first.compressed {
            // The original (pre-compression) length isn't stored separately;
            // the codec streams until the deflate trailer regardless of the
            // declared capacity, so an estimate is sufficient here.
            let estimate = combined.len() * 4 + 64;
            let mut decompressed = self.codec.decompress(&combined, estimate);
            if decompressed.is_err() {
                // Retry once with a larger estimate in case the ratio was
                // higher than assumed; the codec validates the true length
                // against what it actually produced.
                decompressed = self.codec.decompress(&combined, estimate * 4);
            }
            Ok(Some(decompressed?))
        } else {
            Ok(Some(combined))
        }
    }

    /// Insert or replace `key`'s value. Existing chunks for `key` (if any)
    /// are fully removed and the new chunk set inserted fresh — behaviorally
    /// equivalent to the source's tail delete/add diff, simpler to reason
    /// about (see `DESIGN.md`).
    pub fn add(&mut self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<()> {
        Self::validate_key(key)?;

        self.del(key)?;

        let (payload, compressed) = if already_compressed {
            (tag.to_vec(), true)
        } else if tag.len() as u32 >= self.config.compress_min {
            let (out, smaller) = self.codec.compress(tag)?;
            if smaller {
                (out, true)
            } else {
                (tag.to_vec(), false)
            }
        } else {
            (tag.to_vec(), false)
        };

        let max_chunk = self
            .config
            .max_item_size()
            .saturating_sub(LEAF_ITEM_OVERHEAD + key.len())
            .max(1);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&payload[..]]
        } else {
            payload.chunks(max_chunk).collect()
        };
        let total_components = chunks.len() as u16;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let item = Item {
                key: key.to_vec(),
                component_of: (i + 1) as u16,
                total_components,
                compressed,
                payload: crate::block::ItemPayload::Tag(chunk.to_vec()),
            };
            self.insert_leaf_item(item)?;
        }
        Ok(())
    }

    /// Remove all chunks for `key`. Returns `false` if absent.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        Self::validate_key(key)?;

        let (mut stack, leaf_block_no, mut leaf) = self.descend_mut(key)?;
        let slot = match leaf.find_slot(key, 0)? {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };

        // The binary chop may land on any chunk sharing this key; walk back
        // to the first chunk before removing the whole run.
        let mut start = slot;
        while start > 0 && leaf.get_item(start - 1)?.key == key {
            start -= 1;
        }
        let mut end = start;
        while end < leaf.item_count() && leaf.get_item(end)?.key == key {
            end += 1;
        }
        for s in (start..end).rev() {
            leaf.remove_item(s)?;
        }

        if leaf.item_count() == 0 && !stack.is_empty() {
            self.free_block(leaf_block_no);
            self.remove_child_pointer(&mut stack, leaf_block_no)?;
        } else {
            self.stage(leaf_block_no, leaf);
        }
        Ok(true)
    }

    /// Descend from the root to the leaf that would hold `key`, returning the
    /// ancestor stack (root-to-parent, each entry `(block_no, slot_followed)`)
    /// plus the leaf's block number and decoded contents.
    fn descend_mut(&self, key: &[u8]) -> Result<(Vec<(u32, usize)>, u32, Block)> {
        let mut stack = Vec::new();
        let mut block_no = self.root_block_no();
        loop {
            let block = self.read_block_ro(block_no)?;
            if block.is_leaf() {
                return Ok((stack, block_no, block));
            }
            let n = block.item_count();
            let slot = match block.find_slot(key, 0)? {
                Ok(s) => s,
                Err(s) => s.saturating_sub(1).min(n.saturating_sub(1)),
            };
            let child = block
                .get_item(slot)?
                .child()
                .ok_or_else(|| Error::DatabaseCorrupt("internal item missing child pointer".into()))?;
            stack.push((block_no, slot));
            block_no = child;
        }
    }

    /// Remove the item pointing at `child_block_no` from its parent (the top
    /// of `stack`), freeing/collapsing upward as needed (§4.2.4).
    fn remove_child_pointer(&self, stack: &mut Vec<(u32, usize)>, child_block_no: u32) -> Result<()> {
        let Some((parent_no, _hint_slot)) = stack.pop() else {
            return Ok(());
        };
        let mut parent = self.read_block_ro(parent_no)?;
        let slot = (0..parent.item_count())
            .find(|&s| parent.get_item(s).map(|i| i.child()) == Ok(Some(child_block_no)))
            .ok_or_else(|| Error::DatabaseCorrupt("parent missing separator for freed child".into()))?;
        parent.remove_item(slot)?;

        let is_root = stack.is_empty();
        if is_root {
            let mut inner = self.inner.borrow_mut();
            if parent.item_count() == 1 && inner.level > 0 {
                let only_child = parent.get_item(0)?.child().expect("internal item has a child");
                inner.level -= 1;
                inner.root = only_child;
                drop(inner);
                self.free_block(parent_no);
                return Ok(());
            }
            drop(inner);
            self.stage(parent_no, parent);
            return Ok(());
        }

        if parent.item_count() == 0 {
            self.free_block(parent_no);
            self.remove_child_pointer(stack, parent_no)
        } else {
            self.stage(parent_no, parent);
            Ok(())
        }
    }

    /// Insert one (already chunk-sized) leaf item, splitting blocks up the
    /// tree as needed (§4.2.2).
    fn insert_leaf_item(&mut self, item: Item) -> Result<()> {
        let key = item.key.clone();
        let (mut stack, leaf_block_no, leaf) = self.descend_mut(&key)?;
        let pos = leaf_insert_position(&leaf, &key)?;

        self.update_seq_count(leaf_block_no, pos);
        self.insert_into_level(leaf_block_no, leaf, pos, item, &mut stack, 0)
    }

    fn update_seq_count(&self, block_no: u32, pos: usize) {
        let mut inner = self.inner.borrow_mut();
        let sequential = inner.last_insert_block == Some(block_no) && inner.last_insert_slot == Some(pos.wrapping_sub(1));
        if sequential {
            inner.seq_count += 1;
        } else {
            inner.seq_count = SEQ_START_POINT;
        }
        inner.last_insert_block = Some(block_no);
        inner.last_insert_slot = Some(pos);
    }

    fn full_compaction(&self) -> bool {
        let inner = self.inner.borrow();
        inner.full_compaction || inner.seq_count >= 0
    }

    /// Insert `item` at `pos` in `block` (currently block number
    /// `block_no`), splitting and propagating a separator into `stack` as
    /// necessary. `level` is the block's tree level (0 = leaf).
    fn insert_into_level(
        &self,
        block_no: u32,
        mut block: Block,
        pos: usize,
        item: Item,
        stack: &mut Vec<(u32, usize)>,
        level: u8,
    ) -> Result<()> {
        if block.fits(&item) {
            block.insert_item(pos, item)?;
            self.stage(block_no, block);
            return Ok(());
        }

        let mut items = block.items()?;
        items.insert(pos.min(items.len()), item);

        if items.len() < 2 {
            return Err(Error::DatabaseCorrupt(
                "item too large to fit even an empty block (exceeds configured max_item_size)".into(),
            ));
        }

        let split_at = if self.full_compaction() {
            pos + 1
        } else {
            median_split_point(&items)
        }
        .clamp(1, items.len() - 1);
        // Never split inside a run of items sharing one key (a multi-chunk
        // tag): chunks of one key must stay in a single leaf block, since
        // tag reassembly does not search across block boundaries.
        let split_at = avoid_splitting_a_key_run(&items, split_at);

        let lower: Vec<Item> = items[..split_at].to_vec();
        let upper: Vec<Item> = items[split_at..].to_vec();

        let new_block_no = self.alloc_block(level)?;
        let mut new_block = Block::new_empty(block.block_size(), level, self.working_revision());
        for it in &lower {
            let slot = new_block.find_slot(&it.key, 0)?.unwrap_or_else(|s| s);
            new_block.insert_item(slot, it.clone())?;
        }
        self.stage(new_block_no, new_block);

        let mut rebuilt = Block::new_empty(block.block_size(), level, self.working_revision());
        for it in &upper {
            let slot = rebuilt.find_slot(&it.key, 0)?.unwrap_or_else(|s| s);
            rebuilt.insert_item(slot, it.clone())?;
        }
        self.stage(block_no, rebuilt);

        let separator_key = if level == 0 {
            shortest_separator(&lower.last().expect("lower half non-empty").key, &upper[0].key)
        } else {
            upper[0].key.clone()
        };
        let separator = Item::internal(separator_key, new_block_no);

        match stack.pop() {
            Some((parent_no, hint_slot)) => {
                let parent = self.read_block_ro(parent_no)?;
                let parent_pos = parent
                    .find_slot(&separator.key, hint_slot)?
                    .unwrap_or_else(|s| s);
                self.insert_into_level(parent_no, parent, parent_pos, separator, stack, level + 1)
            }
            None => self.split_root(separator, level),
        }
    }

    /// The ancestor stack was exhausted while propagating a split: the root
    /// itself split. Allocate a new root one level higher.
    fn split_root(&self, separator: Item, child_level: u8) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let new_level = child_level + 1;
        if new_level as u32 > self.config.max_tree_depth {
            return Err(Error::DatabaseCorrupt(format!(
                "tree depth would exceed configured maximum of {}",
                self.config.max_tree_depth
            )));
        }
        let old_root = inner.root;
        let block_size = inner.store.block_size();
        let revision = inner.working_revision;
        drop(inner);

        let new_root_no = self.alloc_block(new_level)?;
        let mut root_block = Block::new_empty(block_size, new_level, revision);
        // Leftmost item carries an empty structural lower bound, not a real
        // key, so it always sorts before every real key.
        root_block.insert_item(0, Item::internal(Vec::new(), old_root))?;
        let pos = root_block.find_slot(&separator.key, 0)?.unwrap_or_else(|s| s);
        root_block.insert_item(pos, separator)?;
        self.stage(new_root_no, root_block);

        let mut inner = self.inner.borrow_mut();
        inner.root = new_root_no;
        inner.level = new_level;
        Ok(())
    }

    fn working_revision(&self) -> u32 {
        self.inner.borrow().working_revision
    }

    /// Snapshot the blocks this transaction has modified so far, as
    /// `(block number, raw bytes)` pairs stamped with the revision the next
    /// [`BTree::commit`] will assign them. Intended for the optional changes
    /// log (§4.4), which records a commit's blocks alongside the commit
    /// itself rather than re-deriving them from the tree after the fact.
    /// Must be called before [`BTree::commit`], which drains the dirty set.
    pub fn dirty_blocks(&self) -> Vec<(u32, Vec<u8>)> {
        let revision = self.working_revision();
        let mut inner = self.inner.borrow_mut();
        inner
            .dirty
            .values_mut()
            .for_each(|block| block.set_revision(revision));
        inner
            .dirty
            .iter()
            .map(|(n, block)| (*n, block.as_bytes().to_vec()))
            .collect()
    }

    /// Write out modified blocks, seal the freelist, and advance the
    /// committed revision. On success returns the new [`RootInfo`].
    pub fn commit(&mut self) -> Result<RootInfo> {
        let mut inner = self.inner.borrow_mut();
        let revision = inner.working_revision;

        let dirty: Vec<(u32, Block)> = inner.dirty.drain().collect();
        for (n, mut block) in dirty {
            block.set_revision(revision);
            inner.store.write_block(n, &block)?;
        }
        for n in inner.freed.drain(..) {
            inner.freelist.free_block(n);
        }
        let freelist_head = inner.freelist.commit(&mut inner.store, revision)?;
        inner.store.sync()?;

        let info = RootInfo {
            revision,
            root: inner.root,
            level: inner.level,
            block_count: inner.store.block_count()?,
            freelist_head,
        };
        inner.base_revision = revision;
        inner.base_root = inner.root;
        inner.base_level = inner.level;
        inner.base_freelist_head = freelist_head;
        inner.working_revision = revision + 1;
        inner.seq_count = SEQ_START_POINT;
        inner.last_insert_block = None;
        inner.last_insert_slot = None;
        Ok(info)
    }

    /// Discard uncommitted modifications: drop the in-memory working set,
    /// roll `root`/`level` back to the last committed values (an
    /// uncommitted root split must not be left in effect once its new root
    /// block has been dropped from the dirty cache), and reread the
    /// freelist from its last-committed head so block numbers this
    /// transaction allocated are returned to the pool rather than leaked.
    pub fn cancel(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.dirty.clear();
        inner.freed.clear();
        inner.root = inner.base_root;
        inner.level = inner.base_level;
        inner.working_revision = inner.base_revision + 1;
        inner.seq_count = SEQ_START_POINT;
        inner.cursor_version += 1;
        let head = inner.base_freelist_head;
        inner.freelist = Freelist::open(&mut inner.store, head)?;
        Ok(())
    }
}

/// Find the insertion position for a new item with `key`: the end of any
/// existing run of items already sharing `key` (so new chunks append after
/// the last one), or the normal sorted insertion point otherwise.
fn leaf_insert_position(block: &Block, key: &[u8]) -> Result<usize> {
    match block.find_slot(key, 0)? {
        Err(pos) => Ok(pos),
        Ok(mut pos) => {
            while pos < block.item_count() && block.get_item(pos)?.key == key {
                pos += 1;
            }
            Ok(pos)
        }
    }
}

/// Median-by-item-count split point (a reasonable proxy for "median by
/// bytes" given items are packed contiguously in directory order).
fn median_split_point(items: &[Item]) -> usize {
    items.len() / 2
}

/// Nudge `split_at` to the nearest key boundary so a run of items sharing
/// one key (a multi-chunk tag) is never divided across both halves. Prefers
/// moving forward, then backward. If every item in `items` shares one key —
/// a single tag's chunks alone fill the block — no boundary exists and the
/// original point is returned unchanged; that pathological case is not
/// handled and is recorded as a known limitation in `DESIGN.md`.
fn avoid_splitting_a_key_run(items: &[Item], split_at: usize) -> usize {
    if split_at == 0 || split_at >= items.len() {
        return split_at;
    }
    if items[split_at - 1].key != items[split_at].key {
        return split_at;
    }
    let mut forward = split_at;
    while forward < items.len() && items[forward - 1].key == items[forward].key {
        forward += 1;
    }
    if forward < items.len() {
        return forward;
    }
    let mut backward = split_at;
    while backward > 1 && items[backward - 1].key == items[backward - 2].key {
        backward -= 1;
    }
    if backward > 1 {
        backward
    } else {
        split_at
    }
}

/// Shortest prefix of `next` that still sorts strictly after `prev`,
/// truncating a leaf-level separator key (§4.2.2).
fn shortest_separator(prev: &[u8], next: &[u8]) -> Vec<u8> {
    let common = prev.iter().zip(next).take_while(|(a, b)| a == b).count();
    let len = (common + 1).min(next.len());
    next[..len].to_vec()
}
