//! B-tree cursor.
//!
//! A cursor is positioned on a `(leaf page, slot)` pair or nil. Movement
//! walks the slot array and follows the persisted leaf sibling links;
//! `seek` descends for a probe key and adjusts per the match mode. The
//! cursor pins its current page against purging and releases the pin on
//! every reposition.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::storage::NO_PAGE;

use super::tree::Btree;
use super::MatchMode;

#[derive(Debug, Default)]
pub struct BtreeCursor {
    position: Option<(u64, usize)>,
}

impl BtreeCursor {
    pub fn new() -> Self {
        Self { position: None }
    }

    pub fn is_nil(&self) -> bool {
        self.position.is_none()
    }

    pub fn position(&self) -> Option<(u64, usize)> {
        self.position
    }

    pub fn clear(&mut self, tree: &Btree) {
        if let Some((page, _)) = self.position.take() {
            tree.unpin_page(page);
        }
    }

    /// Forgets the position without touching pins. Used when the caller
    /// has already released the pin through the pager.
    pub fn reset(&mut self) {
        self.position = None;
    }

    fn set(&mut self, tree: &Btree, page: u64, slot: usize) -> Result<()> {
        tree.pin_page(page)?;
        if let Some((old, _)) = self.position.replace((page, slot)) {
            tree.unpin_page(old);
        }
        Ok(())
    }

    /// First slot of the first non-empty leaf.
    pub fn move_first(&mut self, tree: &Btree) -> Result<bool> {
        let mut page = tree.edge_leaf(false)?;
        loop {
            if tree.node_count(page)? > 0 {
                self.set(tree, page, 0)?;
                return Ok(true);
            }
            let (_, right) = tree.leaf_siblings(page)?;
            if right == NO_PAGE {
                self.clear(tree);
                return Ok(false);
            }
            page = right;
        }
    }

    /// Last slot of the last non-empty leaf.
    pub fn move_last(&mut self, tree: &Btree) -> Result<bool> {
        let mut page = tree.edge_leaf(true)?;
        loop {
            let count = tree.node_count(page)?;
            if count > 0 {
                self.set(tree, page, count - 1)?;
                return Ok(true);
            }
            let (left, _) = tree.leaf_siblings(page)?;
            if left == NO_PAGE {
                self.clear(tree);
                return Ok(false);
            }
            page = left;
        }
    }

    fn next_position(tree: &Btree, page: u64, slot: usize) -> Result<Option<(u64, usize)>> {
        if slot + 1 < tree.node_count(page)? {
            return Ok(Some((page, slot + 1)));
        }
        let (_, mut right) = tree.leaf_siblings(page)?;
        while right != NO_PAGE {
            if tree.node_count(right)? > 0 {
                return Ok(Some((right, 0)));
            }
            right = tree.leaf_siblings(right)?.1;
        }
        Ok(None)
    }

    fn prev_position(tree: &Btree, page: u64, slot: usize) -> Result<Option<(u64, usize)>> {
        if slot > 0 {
            return Ok(Some((page, slot - 1)));
        }
        let (mut left, _) = tree.leaf_siblings(page)?;
        while left != NO_PAGE {
            let count = tree.node_count(left)?;
            if count > 0 {
                return Ok(Some((left, count - 1)));
            }
            left = tree.leaf_siblings(left)?.0;
        }
        Ok(None)
    }

    /// Advances to the next key; the position is unchanged when the end of
    /// the tree is reached.
    pub fn move_next(&mut self, tree: &Btree) -> Result<bool> {
        let (page, slot) = self.position.ok_or(Error::CursorIsNil)?;
        match Self::next_position(tree, page, slot)? {
            Some((p, s)) => {
                self.set(tree, p, s)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves to the previous key; the position is unchanged at the start
    /// of the tree.
    pub fn move_prev(&mut self, tree: &Btree) -> Result<bool> {
        let (page, slot) = self.position.ok_or(Error::CursorIsNil)?;
        match Self::prev_position(tree, page, slot)? {
            Some((p, s)) => {
                self.set(tree, p, s)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Positions the cursor per the match mode. On failure the cursor
    /// becomes nil and false is returned.
    pub fn seek(&mut self, tree: &Btree, key: &[u8], mode: MatchMode) -> Result<bool> {
        let (leaf, slot, ord) = tree.probe_leaf(key)?;

        let target = if ord == Ordering::Equal {
            let slot = slot as usize;
            match mode {
                MatchMode::Exact | MatchMode::Leq | MatchMode::Geq => Some((leaf, slot)),
                MatchMode::Lt => Self::prev_position(tree, leaf, slot)?,
                MatchMode::Gt => Self::next_position(tree, leaf, slot)?,
            }
        } else {
            // `slot` is the greatest key below the probe, or -1
            match mode {
                MatchMode::Exact => None,
                MatchMode::Lt | MatchMode::Leq => {
                    if slot >= 0 {
                        Some((leaf, slot as usize))
                    } else {
                        Self::prev_position(tree, leaf, 0)?
                    }
                }
                MatchMode::Gt | MatchMode::Geq => {
                    let next = (slot + 1) as usize;
                    if next < tree.node_count(leaf)? {
                        Some((leaf, next))
                    } else {
                        // past the last slot of this leaf
                        let count = tree.node_count(leaf)?;
                        Self::next_position(tree, leaf, count.saturating_sub(1))?
                    }
                }
            }
        };

        match target {
            Some((page, slot)) => {
                self.set(tree, page, slot)?;
                Ok(true)
            }
            None => {
                self.clear(tree);
                Ok(false)
            }
        }
    }

    pub fn key(&self, tree: &Btree) -> Result<Vec<u8>> {
        let (page, slot) = self.position.ok_or(Error::CursorIsNil)?;
        tree.read_key(page, slot)
    }

    pub fn record(&self, tree: &Btree) -> Result<Vec<u8>> {
        let (page, slot) = self.position.ok_or(Error::CursorIsNil)?;
        tree.read_record(page, slot)
    }
}
