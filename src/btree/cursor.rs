//! Ordered cursor over a [`super::BTree`] (§4.2.6).
//!
//! A cursor carries per-level state: the block number, an owned decoded copy
//! of that block, and the current directory slot. `next`/`prev` walk the
//! classic iterative B-tree path: advance the leaf slot; if exhausted, pop up
//! the stack until a level has a next/previous sibling slot, then redescend
//! via the leftmost/rightmost child at each level below.
//!
//! Grounded on `sstable/iterator.rs`'s `BlockIterator` (decode-one-block,
//! linear positioning) generalized to a multi-level tree instead of one flat
//! block, plus `chert_table.cc`'s cursor-level-array design named in the
//! block-format header comment.

use super::BTree;
use crate::block::Block;
use crate::error::{Error, Result};

/// One level of cursor state, leaf (0) to root.
struct Level {
    block_no: u32,
    block: Block,
    slot: usize,
}

/// Cursor position relative to the key sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    BeforeStart,
    Positioned,
    AtEnd,
}

/// An ordered, read-only cursor over a table's keys.
pub struct Cursor<'a> {
    btree: &'a BTree,
    levels: Vec<Level>,
    state: CursorState,
    seen_cursor_version: u64,
}

impl<'a> Cursor<'a> {
    pub(super) fn new(btree: &'a BTree) -> Self {
        Cursor {
            btree,
            levels: Vec::new(),
            state: CursorState::BeforeStart,
            seen_cursor_version: btree.cursor_version(),
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Reposition to `Before-start`, discarding any held block state.
    pub fn rewind(&mut self) {
        self.levels.clear();
        self.state = CursorState::BeforeStart;
        self.seen_cursor_version = self.btree.cursor_version();
    }

    /// Reposition to `At-end`.
    pub fn to_end(&mut self) {
        self.levels.clear();
        self.state = CursorState::AtEnd;
        self.seen_cursor_version = self.btree.cursor_version();
    }

    fn refresh_if_stale(&mut self) -> Result<()> {
        if self.seen_cursor_version != self.btree.cursor_version() {
            // The tree was mutated since this cursor was positioned; reread
            // from the root on the next navigation rather than trusting the
            // held block snapshots.
            let key = self.current_key();
            self.levels.clear();
            self.seen_cursor_version = self.btree.cursor_version();
            if let Some(key) = key {
                self.find_entry_ge(&key)?;
            }
        }
        Ok(())
    }

    fn current_key(&self) -> Option<Vec<u8>> {
        let leaf = self.levels.first()?;
        leaf.block.get_item(leaf.slot).ok().map(|i| i.key)
    }

    /// Descend from the root, pushing the path taken onto `levels`. `compare`
    /// picks which child/slot to follow at each internal level and where to
    /// land at the leaf.
    fn descend(&mut self, target: &[u8]) -> Result<()> {
        self.levels.clear();
        let mut block_no = self.btree.root_block_no();
        let mut path = Vec::new();
        loop {
            let block = self.btree.read_block_ro(block_no)?;
            let is_leaf = block.is_leaf();
            let n = block.item_count();
            let slot = if n == 0 {
                0
            } else {
                match block.find_slot(target, 0)? {
                    Ok(s) => s,
                    Err(s) if is_leaf => s,
                    Err(s) => s.saturating_sub(1).min(n - 1),
                }
            };
            path.push(Level { block_no, block, slot });
            if is_leaf {
                break;
            }
            let child = path
                .last()
                .unwrap()
                .block
                .get_item(slot)?
                .child()
                .ok_or_else(|| Error::DatabaseCorrupt("internal item missing child pointer".into()))?;
            block_no = child;
        }
        path.reverse(); // leaf first, root last
        self.levels = path;
        Ok(())
    }

    /// Position at the smallest key ≥ `key`, or `At-end` if none exists.
    pub fn find_entry_ge(&mut self, key: &[u8]) -> Result<()> {
        self.descend(key)?;
        let leaf = self.levels.first().expect("descend always reaches a leaf");
        if leaf.slot >= leaf.block.item_count() {
            // target is past every key in this leaf; advance to the next one.
            self.state = CursorState::Positioned;
            self.advance()?;
        } else {
            self.state = CursorState::Positioned;
        }
        Ok(())
    }

    /// Advance to the next key, handling leaf exhaustion by walking back up
    /// the tree and redescending down the next sibling's leftmost path.
    fn advance(&mut self) -> Result<()> {
        loop {
            let leaf_exhausted = {
                let leaf = self.levels.first().expect("positioned cursor has a leaf level");
                leaf.slot >= leaf.block.item_count()
            };
            if !leaf_exhausted {
                return Ok(());
            }
            // Pop upward looking for a level with a next sibling slot.
            let mut idx = 1;
            loop {
                if idx >= self.levels.len() {
                    self.levels.clear();
                    self.state = CursorState::AtEnd;
                    return Ok(());
                }
                self.levels[idx].slot += 1;
                if self.levels[idx].slot < self.levels[idx].block.item_count() {
                    break;
                }
                idx += 1;
            }
            // Redescend from `idx` down to the leaf via leftmost children.
            let mut level = idx;
            loop {
                let child = self.levels[level].block.get_item(self.levels[level].slot)?;
                if level == 0 {
                    break;
                }
                let child_no = child
                    .child()
                    .ok_or_else(|| Error::DatabaseCorrupt("internal item missing child pointer".into()))?;
                let child_block = self.btree.read_block_ro(child_no)?;
                self.levels[level - 1] = Level {
                    block_no: child_no,
                    block: child_block,
                    slot: 0,
                };
                level -= 1;
            }
            let leaf = self.levels.first().expect("redescend produces a leaf level");
            if leaf.block.item_count() > 0 {
                return Ok(());
            }
            // An empty leaf (shouldn't normally persist, but tolerate it):
            // loop again to skip past it.
        }
    }

    /// Move to the next key in order.
    pub fn next(&mut self) -> Result<()> {
        self.refresh_if_stale()?;
        match self.state {
            CursorState::AtEnd => Ok(()),
            CursorState::BeforeStart => {
                self.descend(&[])?;
                let leaf = self.levels.first().expect("descend always reaches a leaf");
                if leaf.block.item_count() == 0 {
                    self.levels.clear();
                    self.state = CursorState::AtEnd;
                } else {
                    self.state = CursorState::Positioned;
                }
                Ok(())
            }
            CursorState::Positioned => {
                self.levels[0].slot += 1;
                self.advance()
            }
        }
    }

    /// Move to the previous key in order.
    pub fn prev(&mut self) -> Result<()> {
        self.refresh_if_stale()?;
        match self.state {
            CursorState::BeforeStart => Ok(()),
            CursorState::AtEnd => {
                self.descend_rightmost()?;
                Ok(())
            }
            CursorState::Positioned => {
                if self.levels[0].slot == 0 {
                    self.retreat()
                } else {
                    self.levels[0].slot -= 1;
                    Ok(())
                }
            }
        }
    }

    fn descend_rightmost(&mut self) -> Result<()> {
        let mut block_no = self.btree.root_block_no();
        let mut path = Vec::new();
        loop {
            let block = self.btree.read_block_ro(block_no)?;
            let n = block.item_count();
            let is_leaf = block.is_leaf();
            let slot = n.saturating_sub(1);
            path.push(Level { block_no, block, slot });
            if is_leaf {
                break;
            }
            let child = path
                .last()
                .unwrap()
                .block
                .get_item(slot)?
                .child()
                .ok_or_else(|| Error::DatabaseCorrupt("internal item missing child pointer".into()))?;
            block_no = child;
        }
        path.reverse();
        self.levels = path;
        self.state = if self.levels.first().map(|l| l.block.item_count()).unwrap_or(0) == 0 {
            CursorState::BeforeStart
        } else {
            CursorState::Positioned
        };
        Ok(())
    }

    fn retreat(&mut self) -> Result<()> {
        let mut idx = 1;
        loop {
            if idx >= self.levels.len() {
                self.levels.clear();
                self.state = CursorState::BeforeStart;
                return Ok(());
            }
            if self.levels[idx].slot > 0 {
                self.levels[idx].slot -= 1;
                break;
            }
            idx += 1;
        }
        let mut level = idx;
        loop {
            let item = self.levels[level].block.get_item(self.levels[level].slot)?;
            if level == 0 {
                break;
            }
            let child_no = item
                .child()
                .ok_or_else(|| Error::DatabaseCorrupt("internal item missing child pointer".into()))?;
            let child_block = self.btree.read_block_ro(child_no)?;
            let slot = child_block.item_count().saturating_sub(1);
            self.levels[level - 1] = Level {
                block_no: child_no,
                block: child_block,
                slot,
            };
            level -= 1;
        }
        self.state = CursorState::Positioned;
        Ok(())
    }

    /// The key at the current position, if `Positioned`.
    pub fn key(&self) -> Option<Vec<u8>> {
        if self.state != CursorState::Positioned {
            return None;
        }
        self.current_key()
    }

    /// Read and (if necessary) reassemble and decompress the tag at the
    /// current position.
    pub fn read_tag(&self) -> Result<Option<Vec<u8>>> {
        if self.state != CursorState::Positioned {
            return Ok(None);
        }
        let leaf = self.levels.first().expect("positioned cursor has a leaf level");
        let current = leaf.block.get_item(leaf.slot)?;
        // The slot the cursor happens to sit on may be any component of a
        // multi-chunk tag's run of same-key items, not just the first;
        // `assemble_tag` reads forward from component 1, so walk back to the
        // run's start first (mirrors `BTree::del`'s backward walk).
        let mut start = leaf.slot;
        while start > 0 && leaf.block.get_item(start - 1)?.key == current.key {
            start -= 1;
        }
        let first = leaf.block.get_item(start)?;
        self.btree.assemble_tag(&leaf.block, start, &first)
    }
}
