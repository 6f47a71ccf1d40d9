//! B-tree traversal and structural modification.
//!
//! The tree descends from a root page through internal nodes to leaves,
//! remembering the path. Inserts split bottom-up: a full leaf moves its
//! upper half to a fresh sibling and propagates the separator; a full
//! parent splits in turn; a split root grows a new root. Erases repair
//! underfull nodes (slot count at or below [`MERGE_THRESHOLD`]) by
//! borrowing from a sibling when it can spare slots, merging otherwise,
//! and collapse a childless internal root.
//!
//! Leaf pages are chained through their persisted sibling links for cursor
//! traversal; internal pages need no chaining.

use std::cmp::Ordering;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::config::{DbConfig, RecordKind, MERGE_THRESHOLD};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, Pager, PageType, PersistedPageHeader, NO_PAGE};

use super::node::{
    decode_record, encode_blob_record, encode_inline_record, InlineRecord, NodeHeader,
};
use super::pax::{PaxNode, PaxNodeMut};
use super::slotted::{SlottedNode, SlottedNodeMut};
use super::Comparator;

/// How leaf records are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafRecords {
    /// Fixed-size record bytes directly in the record region (PAX only).
    Fixed(usize),
    /// 8-byte record slots with the inline codec / blob ids.
    Slot8,
}

/// Descent path entry: the parent page and the slot whose child we took
/// (`-1` means `ptr_down`).
type Path = SmallVec<[(u64, i64); 8]>;

pub struct Btree<'a> {
    pager: &'a Pager,
    blobs: &'a BlobStore,
    cmp: Comparator,
    key_size: Option<usize>,
    leaf_records: LeafRecords,
    root: u64,
}

pub(crate) enum NodeRef<'b> {
    Pax(PaxNode<'b>),
    Slotted(SlottedNode<'b>),
}

pub(crate) enum NodeMut<'b> {
    Pax(PaxNodeMut<'b>),
    Slotted(SlottedNodeMut<'b>),
}

impl<'a> Btree<'a> {
    pub fn new(
        pager: &'a Pager,
        blobs: &'a BlobStore,
        config: &DbConfig,
        root: u64,
    ) -> Self {
        let key_size = config.fixed_key_size().map(|s| s as usize);
        let leaf_records = match config.records {
            RecordKind::Fixed(size) => LeafRecords::Fixed(size as usize),
            RecordKind::Variable => LeafRecords::Slot8,
        };
        let cmp = match config.keys {
            crate::config::KeyKind::Recno => Comparator::RecnoU64,
            _ => Comparator::Bytes,
        };
        Self {
            pager,
            blobs,
            cmp,
            key_size,
            leaf_records,
            root,
        }
    }

    /// Allocates and initializes an empty root leaf; returns its page id.
    pub fn create_root(pager: &Pager, config: &DbConfig) -> Result<u64> {
        let key_size = config.fixed_key_size().map(|s| s as usize);
        let page = pager.alloc()?;
        pager.with_page_mut(page, |data| {
            init_node_page(data, page, true, key_size.is_some());
            Ok(())
        })?;
        Ok(page)
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn comparator(&self) -> Comparator {
        self.cmp
    }

    fn leaf_record_size(&self) -> usize {
        match self.leaf_records {
            LeafRecords::Fixed(size) => size,
            LeafRecords::Slot8 => 8,
        }
    }

    pub(crate) fn open<'b>(&self, data: &'b [u8]) -> Result<NodeRef<'b>> {
        let header = NodeHeader::from_page(data)?;
        match self.key_size {
            Some(key_size) => {
                let record_size = if header.is_leaf() {
                    self.leaf_record_size()
                } else {
                    8
                };
                Ok(NodeRef::Pax(PaxNode::new(data, key_size, record_size)))
            }
            None => Ok(NodeRef::Slotted(SlottedNode::new(data))),
        }
    }

    pub(crate) fn open_mut<'b>(&self, data: &'b mut [u8]) -> Result<NodeMut<'b>> {
        let header = NodeHeader::from_page(data)?;
        match self.key_size {
            Some(key_size) => {
                let record_size = if header.is_leaf() {
                    self.leaf_record_size()
                } else {
                    8
                };
                Ok(NodeMut::Pax(PaxNodeMut::new(data, key_size, record_size)))
            }
            None => Ok(NodeMut::Slotted(SlottedNodeMut::new(data))),
        }
    }

    // -- descent ----------------------------------------------------------

    /// Walks from the root to the leaf that covers `key`, recording the
    /// path. Returns the leaf page and its `(slot, cmp)` probe result.
    fn descend(&self, key: &[u8], mut path: Option<&mut Path>) -> Result<(u64, i64, Ordering)> {
        let mut page = self.root;
        loop {
            let (is_leaf, slot, ord, child) = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                let (slot, ord) = node.find(key, &self.cmp, self.blobs)?;
                if node.is_leaf() {
                    Ok((true, slot, ord, 0))
                } else {
                    let child = if slot < 0 {
                        node.ptr_down()
                    } else {
                        node.child(slot as usize)
                    };
                    Ok((false, slot, ord, child))
                }
            })?;

            if is_leaf {
                return Ok((page, slot, ord));
            }
            if let Some(p) = path.as_mut() {
                p.push((page, slot));
            }
            if child == NO_PAGE {
                return Err(Error::Corrupt(format!("page {page} has a nil child")));
            }
            page = child;
        }
    }

    /// Leftmost or rightmost leaf of the tree.
    pub(crate) fn edge_leaf(&self, last: bool) -> Result<u64> {
        let mut page = self.root;
        loop {
            let (is_leaf, child) = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                if node.is_leaf() {
                    Ok((true, 0))
                } else if last {
                    let count = node.count();
                    let child = if count == 0 {
                        node.ptr_down()
                    } else {
                        node.child(count - 1)
                    };
                    Ok((false, child))
                } else {
                    Ok((false, node.ptr_down()))
                }
            })?;
            if is_leaf {
                return Ok(page);
            }
            page = child;
        }
    }

    // -- reads ------------------------------------------------------------

    /// Exact lookup of a record.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (leaf, slot, ord) = self.descend(key, None)?;
        if ord != Ordering::Equal {
            return Ok(None);
        }
        Ok(Some(self.read_record(leaf, slot as usize)?))
    }

    /// Reads the key at `(page, slot)`, resolving extended keys.
    pub(crate) fn read_key(&self, page: u64, slot: usize) -> Result<Vec<u8>> {
        self.pager.with_page(page, |data| {
            let node = self.open(data)?;
            node.key(slot, self.blobs)
        })
    }

    /// Reads the record at `(page, slot)`, resolving blob records.
    pub(crate) fn read_record(&self, page: u64, slot: usize) -> Result<Vec<u8>> {
        self.pager.with_page(page, |data| {
            let node = self.open(data)?;
            node.record(slot, self.leaf_records, self.blobs)
        })
    }

    pub(crate) fn node_count(&self, page: u64) -> Result<usize> {
        self.pager
            .with_page(page, |data| Ok(NodeHeader::from_page(data)?.count() as usize))
    }

    pub(crate) fn leaf_siblings(&self, page: u64) -> Result<(u64, u64)> {
        self.pager.with_page(page, |data| {
            let header = PersistedPageHeader::from_bytes(data)?;
            Ok((header.left_sibling(), header.right_sibling()))
        })
    }

    /// Probes the leaf that covers `key`. Used by cursors.
    pub(crate) fn probe_leaf(&self, key: &[u8]) -> Result<(u64, i64, Ordering)> {
        self.descend(key, None)
    }

    pub(crate) fn pin_page(&self, page: u64) -> Result<()> {
        self.pager.pin(page)
    }

    pub(crate) fn unpin_page(&self, page: u64) {
        self.pager.unpin(page)
    }

    // -- insert -----------------------------------------------------------

    /// Inserts `(key, record)`. An existing key fails with `DuplicateKey`
    /// unless `overwrite` is set, in which case its record is replaced.
    pub fn insert(&mut self, key: &[u8], record: &[u8], overwrite: bool) -> Result<()> {
        if let Some(size) = self.key_size {
            if key.len() != size {
                return Err(Error::InvParameter("key length"));
            }
        }
        if let LeafRecords::Fixed(size) = self.leaf_records {
            if record.len() != size {
                return Err(Error::InvParameter("record length"));
            }
        }

        let mut path = Path::new();
        let (leaf, slot, ord) = self.descend(key, Some(&mut path))?;

        if ord == Ordering::Equal {
            if !overwrite {
                return Err(Error::DuplicateKey);
            }
            let records = self.leaf_records;
            let blobs = self.blobs;
            return self.pager.with_page_mut(leaf, |data| {
                let mut node = self.open_mut(data)?;
                node.set_record(slot as usize, record, records, blobs, true)
            });
        }

        let pos = (slot + 1) as usize;
        let fits = self.pager.with_page(leaf, |data| {
            let node = self.open(data)?;
            Ok(node.has_room(key))
        })?;

        if fits {
            let records = self.leaf_records;
            let blobs = self.blobs;
            return self.pager.with_page_mut(leaf, |data| {
                let mut node = self.open_mut(data)?;
                node.insert_key(pos, key, blobs)?;
                node.set_record(pos, record, records, blobs, false)
            });
        }

        self.split_leaf_and_insert(leaf, key, record, path)
    }

    fn split_leaf_and_insert(
        &mut self,
        leaf: u64,
        key: &[u8],
        record: &[u8],
        path: Path,
    ) -> Result<()> {
        let sibling = self.pager.alloc()?;
        debug!(leaf, sibling, "splitting leaf");

        let records = self.leaf_records;
        let blobs = self.blobs;
        let pax = self.key_size.is_some();

        let (separator, old_right) = self.pager.with_page_pair_mut(leaf, sibling, |a, b| {
            init_node_page(b, sibling, true, pax);

            let mut left = self.open_mut(a)?;
            let mut right = self.open_mut(b)?;
            let pivot = left.count() / 2;
            left.split_leaf_into(&mut right, pivot)?;
            let separator = right.key(0, blobs)?;

            // chain the new sibling between the split leaf and its old
            // right neighbor
            let old_right = {
                let header = PersistedPageHeader::from_bytes_mut(a)?;
                let old_right = header.right_sibling();
                header.set_right_sibling(sibling);
                old_right
            };
            {
                let header = PersistedPageHeader::from_bytes_mut(b)?;
                header.set_left_sibling(leaf);
                header.set_right_sibling(old_right);
            }
            Ok((separator, old_right))
        })?;

        if old_right != NO_PAGE {
            self.pager.with_page_mut(old_right, |data| {
                PersistedPageHeader::from_bytes_mut(data)?.set_left_sibling(sibling);
                Ok(())
            })?;
        }

        // place the pending pair on the correct side of the separator
        let target = if self.cmp.cmp(key, &separator) == Ordering::Less {
            leaf
        } else {
            sibling
        };
        self.pager.with_page_mut(target, |data| {
            let mut node = self.open_mut(data)?;
            let (slot, ord) = node.as_node_ref().find(key, &self.cmp, blobs)?;
            debug_assert_ne!(ord, Ordering::Equal);
            let pos = (slot + 1) as usize;
            node.insert_key(pos, key, blobs)?;
            node.set_record(pos, record, records, blobs, false)
        })?;

        self.propagate_split(path, separator, leaf, sibling)
    }

    fn propagate_split(
        &mut self,
        mut path: Path,
        mut separator: Vec<u8>,
        mut left: u64,
        mut right: u64,
    ) -> Result<()> {
        let blobs = self.blobs;
        let pax = self.key_size.is_some();

        while let Some((parent, _)) = path.pop() {
            let fits = self.pager.with_page(parent, |data| {
                let node = self.open(data)?;
                Ok(node.has_room(&separator))
            })?;

            if fits {
                let sep = separator;
                return self.pager.with_page_mut(parent, |data| {
                    let mut node = self.open_mut(data)?;
                    let (slot, ord) = node.as_node_ref().find(&sep, &self.cmp, blobs)?;
                    debug_assert_ne!(ord, Ordering::Equal);
                    let pos = (slot + 1) as usize;
                    node.insert_key(pos, &sep, blobs)?;
                    node.set_child(pos, right);
                    Ok(())
                });
            }

            // split the parent and keep propagating
            let sibling = self.pager.alloc()?;
            debug!(parent, sibling, "splitting internal node");
            let promoted = self.pager.with_page_pair_mut(parent, sibling, |a, b| {
                init_node_page(b, sibling, false, pax);
                let mut node = self.open_mut(a)?;
                let mut new_node = self.open_mut(b)?;
                let pivot = node.count() / 2;
                node.split_internal_into(&mut new_node, pivot, blobs)
            })?;

            let target = if self.cmp.cmp(&separator, &promoted) == Ordering::Less {
                parent
            } else {
                sibling
            };
            let sep = separator;
            self.pager.with_page_mut(target, |data| {
                let mut node = self.open_mut(data)?;
                let (slot, ord) = node.as_node_ref().find(&sep, &self.cmp, blobs)?;
                debug_assert_ne!(ord, Ordering::Equal);
                let pos = (slot + 1) as usize;
                node.insert_key(pos, &sep, blobs)?;
                node.set_child(pos, right);
                Ok(())
            })?;

            separator = promoted;
            left = parent;
            right = sibling;
        }

        // the root itself split: grow a new root
        let new_root = self.pager.alloc()?;
        debug!(old_root = left, new_root, "growing new root");
        self.pager.with_page_mut(new_root, |data| {
            init_node_page(data, new_root, false, pax);
            let mut node = self.open_mut(data)?;
            node.set_ptr_down(left);
            node.insert_key(0, &separator, blobs)?;
            node.set_child(0, right);
            Ok(())
        })?;
        self.root = new_root;
        Ok(())
    }

    // -- erase ------------------------------------------------------------

    /// Erases `key`. Returns false if the key is absent.
    pub fn erase(&mut self, key: &[u8]) -> Result<bool> {
        let mut path = Path::new();
        let (leaf, slot, ord) = self.descend(key, Some(&mut path))?;
        if ord != Ordering::Equal {
            return Ok(false);
        }

        let records = self.leaf_records;
        let blobs = self.blobs;
        self.pager.with_page_mut(leaf, |data| {
            let mut node = self.open_mut(data)?;
            node.erase_slot(slot as usize, records, blobs, true)
        })?;

        self.rebalance(leaf, path)?;
        Ok(true)
    }

    /// Repairs underfull nodes from `page` upward along `path`.
    fn rebalance(&mut self, mut page: u64, mut path: Path) -> Result<()> {
        loop {
            let (count, is_leaf, ptr_down) = self.pager.with_page(page, |data| {
                let header = NodeHeader::from_page(data)?;
                Ok((header.count() as usize, header.is_leaf(), header.ptr_down()))
            })?;

            let Some((parent, child_slot)) = path.pop() else {
                // at the root: collapse an emptied internal root
                if !is_leaf && count == 0 {
                    debug!(old_root = page, new_root = ptr_down, "collapsing root");
                    self.root = ptr_down;
                    self.pager.free(page);
                }
                return Ok(());
            };

            if count > MERGE_THRESHOLD as usize {
                return Ok(());
            }

            let child_index = (child_slot + 1) as usize;
            let parent_count = self.node_count(parent)?;

            let left_sibling = if child_index > 0 {
                Some(self.child_of(parent, child_index - 1)?)
            } else {
                None
            };
            let right_sibling = if child_index < parent_count {
                Some(self.child_of(parent, child_index + 1)?)
            } else {
                None
            };

            let mut repaired = false;

            if let Some(right) = right_sibling {
                if self.node_count(right)? > MERGE_THRESHOLD as usize + 1 {
                    repaired = self.try_borrow_from_right(page, right, parent, child_index, is_leaf)?;
                }
            }
            if !repaired {
                if let Some(left) = left_sibling {
                    if self.node_count(left)? > MERGE_THRESHOLD as usize + 1 {
                        repaired =
                            self.try_borrow_from_left(left, page, parent, child_index, is_leaf)?;
                    }
                }
            }
            if repaired {
                return Ok(());
            }

            // borrowing was not possible; merge with a sibling
            if let Some(right) = right_sibling {
                if self.try_merge(page, right, parent, child_index, is_leaf)? {
                    page = parent;
                    continue;
                }
            }
            if let Some(left) = left_sibling {
                if self.try_merge(left, page, parent, child_index - 1, is_leaf)? {
                    page = parent;
                    continue;
                }
            }

            // neither sibling can help right now; leave the node underfull
            return Ok(());
        }
    }

    /// Child page id at `child_index` (0 = `ptr_down`).
    fn child_of(&self, parent: u64, child_index: usize) -> Result<u64> {
        self.pager.with_page(parent, |data| {
            let node = self.open(data)?;
            if child_index == 0 {
                Ok(node.ptr_down())
            } else {
                Ok(node.child(child_index - 1))
            }
        })
    }

    /// Moves one slot from the right sibling into `page` and refreshes the
    /// separator. The parent slot between them is `child_index`.
    fn try_borrow_from_right(
        &mut self,
        page: u64,
        right: u64,
        parent: u64,
        child_index: usize,
        is_leaf: bool,
    ) -> Result<bool> {
        let blobs = self.blobs;
        let sep_slot = child_index;

        // the separator after the shift is the sibling's second key (leaf)
        // or its first key pulled up through the rotation (internal);
        // refresh the parent first so a too-long replacement aborts the
        // borrow before anything has moved
        let new_separator = self.read_key(right, if is_leaf { 1 } else { 0 })?;

        if is_leaf {
            let incoming = self.read_key(right, 0)?;
            let fits = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                Ok(node.has_room(&incoming))
            })?;
            if !fits || !self.replace_separator(parent, sep_slot, &new_separator)? {
                return Ok(false);
            }
            self.pager.with_page_pair_mut(page, right, |a, b| {
                let mut node = self.open_mut(a)?;
                let mut sibling = self.open_mut(b)?;
                node.shift_from_right(&mut sibling, 1)
            })?;
        } else {
            // rotate through the old parent separator
            let old_separator = self.read_key(parent, sep_slot)?;
            let fits = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                Ok(node.has_room(&old_separator))
            })?;
            if !fits || !self.replace_separator(parent, sep_slot, &new_separator)? {
                return Ok(false);
            }
            self.pager.with_page_pair_mut(page, right, |a, b| {
                let mut node = self.open_mut(a)?;
                let mut sibling = self.open_mut(b)?;

                let pos = node.count();
                node.insert_key(pos, &old_separator, blobs)?;
                node.set_child(pos, sibling.ptr_down());

                let new_ptr_down = sibling.child(0);
                sibling.set_ptr_down(new_ptr_down);
                sibling.erase_slot(0, LeafRecords::Slot8, blobs, false)?;
                Ok(())
            })?;
        }

        trace!(page, right, "borrowed slot from right sibling");
        Ok(true)
    }

    fn try_borrow_from_left(
        &mut self,
        left: u64,
        page: u64,
        parent: u64,
        child_index: usize,
        is_leaf: bool,
    ) -> Result<bool> {
        let blobs = self.blobs;
        let sep_slot = child_index - 1;

        let last = self.node_count(left)? - 1;
        // the donated key becomes the new separator in both cases
        let new_separator = self.read_key(left, last)?;

        if is_leaf {
            let fits = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                Ok(node.has_room(&new_separator))
            })?;
            if !fits || !self.replace_separator(parent, sep_slot, &new_separator)? {
                return Ok(false);
            }
            self.pager.with_page_pair_mut(left, page, |a, b| {
                let mut donor = self.open_mut(a)?;
                let mut node = self.open_mut(b)?;
                donor.shift_to_right(&mut node, 1)
            })?;
        } else {
            let separator = self.read_key(parent, sep_slot)?;
            let fits = self.pager.with_page(page, |data| {
                let node = self.open(data)?;
                Ok(node.has_room(&separator))
            })?;
            if !fits || !self.replace_separator(parent, sep_slot, &new_separator)? {
                return Ok(false);
            }
            self.pager.with_page_pair_mut(left, page, |a, b| {
                let mut donor = self.open_mut(a)?;
                let mut node = self.open_mut(b)?;

                let last = donor.count() - 1;
                let donated_child = donor.child(last);
                let old_ptr_down = node.ptr_down();

                node.insert_key(0, &separator, blobs)?;
                node.set_child(0, old_ptr_down);
                node.set_ptr_down(donated_child);

                donor.erase_slot(last, LeafRecords::Slot8, blobs, false)?;
                Ok(())
            })?;
        }

        trace!(left, page, "borrowed slot from left sibling");
        Ok(true)
    }

    /// Merges `right` into `left` and drops the separator at `sep_slot`
    /// from the parent. Returns false when the combined node would not fit.
    fn try_merge(
        &mut self,
        left: u64,
        right: u64,
        parent: u64,
        sep_slot: usize,
        is_leaf: bool,
    ) -> Result<bool> {
        let blobs = self.blobs;
        let separator = if is_leaf {
            None
        } else {
            Some(self.read_key(parent, sep_slot)?)
        };

        let merged = self.pager.with_page_pair_mut(left, right, |a, b| {
            let mut node = self.open_mut(a)?;
            let mut other = self.open_mut(b)?;

            if !node.can_merge(&other, separator.as_deref()) {
                return Ok(false);
            }

            if let Some(sep) = separator.as_deref() {
                // pull the separator down between the two internal nodes
                let pos = node.count();
                node.insert_key(pos, sep, blobs)?;
                node.set_child(pos, other.ptr_down());
            }
            node.merge_from(&mut other)?;

            if is_leaf {
                // unchain the right leaf
                let right_right = PersistedPageHeader::from_bytes(b)?.right_sibling();
                PersistedPageHeader::from_bytes_mut(a)?.set_right_sibling(right_right);
            }
            Ok(true)
        })?;

        if !merged {
            return Ok(false);
        }

        if is_leaf {
            let (_, right_right) = self.leaf_siblings(left)?;
            if right_right != NO_PAGE {
                self.pager.with_page_mut(right_right, |data| {
                    PersistedPageHeader::from_bytes_mut(data)?.set_left_sibling(left);
                    Ok(())
                })?;
            }
        }

        // drop the separator and the right child from the parent
        self.pager.with_page_mut(parent, |data| {
            let mut node = self.open_mut(data)?;
            node.erase_slot(sep_slot, LeafRecords::Slot8, blobs, false)
        })?;
        self.pager.free(right);
        debug!(left, right, "merged sibling nodes");
        Ok(true)
    }

    /// Replaces the parent separator at `sep_slot`, keeping its child.
    fn replace_separator(&mut self, parent: u64, sep_slot: usize, key: &[u8]) -> Result<bool> {
        let blobs = self.blobs;
        self.pager.with_page_mut(parent, |data| {
            let mut node = self.open_mut(data)?;
            if !node.can_replace_key(sep_slot, key) {
                return Ok(false);
            }
            node.replace_key(sep_slot, key, blobs)?;
            Ok(true)
        })
    }

    // -- integrity --------------------------------------------------------

    /// Validates ordering and separator invariants over the whole tree.
    pub fn check_integrity(&self) -> Result<()> {
        self.check_node(self.root, None, None)
    }

    fn check_node(&self, page: u64, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Result<()> {
        let (is_leaf, count) = self.pager.with_page(page, |data| {
            let header = NodeHeader::from_page(data)?;
            Ok((header.is_leaf(), header.count() as usize))
        })?;

        let mut keys = Vec::with_capacity(count);
        for slot in 0..count {
            keys.push(self.read_key(page, slot)?);
        }

        for pair in keys.windows(2) {
            if self.cmp.cmp(&pair[0], &pair[1]) != Ordering::Less {
                return Err(Error::Corrupt(format!("page {page}: slots out of order")));
            }
        }
        if let Some(lower) = &lower {
            if let Some(first) = keys.first() {
                if self.cmp.cmp(first, lower) == Ordering::Less {
                    return Err(Error::Corrupt(format!("page {page}: key below bound")));
                }
            }
        }
        if let Some(upper) = &upper {
            if let Some(last) = keys.last() {
                if self.cmp.cmp(last, upper) != Ordering::Less {
                    return Err(Error::Corrupt(format!("page {page}: key above bound")));
                }
            }
        }

        if !is_leaf {
            let ptr_down = self.pager.with_page(page, |data| {
                Ok(NodeHeader::from_page(data)?.ptr_down())
            })?;
            // child 0 under (lower, key_0)
            self.check_node(ptr_down, lower.clone(), keys.first().cloned())?;
            for slot in 0..count {
                let child = self.child_of(page, slot + 1)?;
                let child_upper = keys.get(slot + 1).cloned().or_else(|| upper.clone());
                self.check_node(child, Some(keys[slot].clone()), child_upper)?;
            }
        }
        Ok(())
    }
}

/// Writes the persisted page header and node header of a fresh node page.
pub(crate) fn init_node_page(data: &mut [u8], page_id: u64, leaf: bool, pax: bool) {
    let page_type = if leaf {
        PageType::BtreeLeaf
    } else {
        PageType::BtreeInternal
    };
    let header = PersistedPageHeader::new(page_type, page_id);
    data[..crate::config::PAGE_HEADER_SIZE].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
    if pax {
        NodeHeader::from_page_mut(data)
            .expect("node header")
            .init(leaf);
    } else {
        SlottedNodeMut::init(data, leaf);
    }
}

// ---------------------------------------------------------------------------
// layout dispatch
// ---------------------------------------------------------------------------

impl<'b> NodeRef<'b> {
    pub fn count(&self) -> usize {
        match self {
            NodeRef::Pax(n) => n.count(),
            NodeRef::Slotted(n) => n.count(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        match self {
            NodeRef::Pax(n) => n.is_leaf(),
            NodeRef::Slotted(n) => n.is_leaf(),
        }
    }

    pub fn ptr_down(&self) -> u64 {
        match self {
            NodeRef::Pax(n) => n.ptr_down(),
            NodeRef::Slotted(n) => n.ptr_down(),
        }
    }

    pub fn child(&self, slot: usize) -> u64 {
        match self {
            NodeRef::Pax(n) => n.child_at(slot),
            NodeRef::Slotted(n) => n.child_at(slot),
        }
    }

    pub fn find(
        &self,
        probe: &[u8],
        cmp: &Comparator,
        blobs: &BlobStore,
    ) -> Result<(i64, Ordering)> {
        match self {
            NodeRef::Pax(n) => n.find(probe, cmp),
            NodeRef::Slotted(n) => n.find(probe, cmp, blobs),
        }
    }

    pub fn key(&self, slot: usize, blobs: &BlobStore) -> Result<Vec<u8>> {
        match self {
            NodeRef::Pax(n) => Ok(n.key_at(slot).to_vec()),
            NodeRef::Slotted(n) => n.load_key(slot, blobs),
        }
    }

    pub fn has_room(&self, key: &[u8]) -> bool {
        match self {
            NodeRef::Pax(n) => n.count() < n.max_count(),
            NodeRef::Slotted(n) => n.has_room_for(key),
        }
    }

    pub fn record(&self, slot: usize, kind: LeafRecords, blobs: &BlobStore) -> Result<Vec<u8>> {
        match kind {
            LeafRecords::Fixed(_) => match self {
                NodeRef::Pax(n) => Ok(n.record_slot(slot).to_vec()),
                NodeRef::Slotted(_) => Err(Error::Corrupt("fixed records in slotted node".into())),
            },
            LeafRecords::Slot8 => {
                let (slot_bytes, flags) = match self {
                    NodeRef::Pax(n) => (n.record_slot(slot), n.flags_at(slot)),
                    NodeRef::Slotted(n) => (n.record_slot(slot), n.flags_at(slot)),
                };
                match decode_record(slot_bytes, flags)? {
                    InlineRecord::Empty => Ok(Vec::new()),
                    InlineRecord::Inline(bytes) => Ok(bytes.to_vec()),
                    InlineRecord::Blob(id) => blobs.get(id),
                }
            }
        }
    }
}

impl<'b> NodeMut<'b> {
    pub fn as_node_ref(&self) -> NodeRef<'_> {
        match self {
            NodeMut::Pax(n) => NodeRef::Pax(n.as_ref()),
            NodeMut::Slotted(n) => NodeRef::Slotted(n.as_ref()),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            NodeMut::Pax(n) => n.count(),
            NodeMut::Slotted(n) => n.count(),
        }
    }

    pub fn ptr_down(&self) -> u64 {
        match self {
            NodeMut::Pax(n) => n.ptr_down(),
            NodeMut::Slotted(n) => n.ptr_down(),
        }
    }

    pub fn set_ptr_down(&mut self, page: u64) {
        match self {
            NodeMut::Pax(n) => n.set_ptr_down(page),
            NodeMut::Slotted(n) => n.set_ptr_down(page),
        }
    }

    pub fn child(&self, slot: usize) -> u64 {
        match self {
            NodeMut::Pax(n) => n.child_at(slot),
            NodeMut::Slotted(n) => n.child_at(slot),
        }
    }

    pub fn set_child(&mut self, slot: usize, page: u64) {
        match self {
            NodeMut::Pax(n) => n.set_child(slot, page),
            NodeMut::Slotted(n) => n.set_child(slot, page),
        }
    }

    pub fn key(&self, slot: usize, blobs: &BlobStore) -> Result<Vec<u8>> {
        match self {
            NodeMut::Pax(n) => Ok(n.key_at(slot).to_vec()),
            NodeMut::Slotted(n) => n.load_key(slot, blobs),
        }
    }

    pub fn insert_key(&mut self, slot: usize, key: &[u8], blobs: &BlobStore) -> Result<()> {
        match self {
            NodeMut::Pax(n) => {
                n.insert(slot, key);
                Ok(())
            }
            NodeMut::Slotted(n) => n.insert(slot, key, blobs),
        }
    }

    /// Erases a slot; for `Slot8` leaves, `free_record` also releases a
    /// blob record.
    pub fn erase_slot(
        &mut self,
        slot: usize,
        kind: LeafRecords,
        blobs: &BlobStore,
        free_record: bool,
    ) -> Result<()> {
        if free_record && kind == LeafRecords::Slot8 {
            let (slot_bytes, flags) = match self {
                NodeMut::Pax(n) => (n.record_slot(slot).to_vec(), n.flags_at(slot)),
                NodeMut::Slotted(n) => (n.record_slot(slot).to_vec(), n.flags_at(slot)),
            };
            if let InlineRecord::Blob(id) = decode_record(&slot_bytes, flags)? {
                if id != 0 {
                    blobs.free(id)?;
                }
            }
        }
        match self {
            NodeMut::Pax(n) => {
                n.erase(slot);
                Ok(())
            }
            NodeMut::Slotted(n) => n.erase(slot, blobs),
        }
    }

    /// Writes a record into an occupied slot, freeing a replaced blob
    /// record when `free_old` is set.
    pub fn set_record(
        &mut self,
        slot: usize,
        record: &[u8],
        kind: LeafRecords,
        blobs: &BlobStore,
        free_old: bool,
    ) -> Result<()> {
        match kind {
            LeafRecords::Fixed(size) => {
                debug_assert_eq!(record.len(), size);
                match self {
                    NodeMut::Pax(n) => {
                        n.record_slot_mut(slot).copy_from_slice(record);
                        Ok(())
                    }
                    NodeMut::Slotted(_) => {
                        Err(Error::Corrupt("fixed records in slotted node".into()))
                    }
                }
            }
            LeafRecords::Slot8 => {
                if free_old {
                    let (slot_bytes, flags) = match self {
                        NodeMut::Pax(n) => (n.record_slot(slot).to_vec(), n.flags_at(slot)),
                        NodeMut::Slotted(n) => (n.record_slot(slot).to_vec(), n.flags_at(slot)),
                    };
                    if let InlineRecord::Blob(id) = decode_record(&slot_bytes, flags)? {
                        if id != 0 {
                            blobs.free(id)?;
                        }
                    }
                }

                let flags = match self {
                    NodeMut::Pax(n) => n.flags_at(slot),
                    NodeMut::Slotted(n) => n.flags_at(slot),
                };
                let mut slot8 = [0u8; 8];
                let new_flags = match encode_inline_record(&mut slot8, flags, record) {
                    Some(new_flags) => new_flags,
                    None => {
                        let blob_id = blobs.put(record)?;
                        encode_blob_record(&mut slot8, flags, blob_id)
                    }
                };
                match self {
                    NodeMut::Pax(n) => {
                        n.record_slot_mut(slot).copy_from_slice(&slot8);
                        n.set_flags(slot, new_flags);
                    }
                    NodeMut::Slotted(n) => {
                        n.record_slot_mut(slot).copy_from_slice(&slot8);
                        n.set_flags(slot, new_flags);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn split_leaf_into(&mut self, other: &mut NodeMut<'_>, pivot: usize) -> Result<()> {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => {
                a.split_leaf_into(b, pivot);
                Ok(())
            }
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => a.split_leaf_into(b, pivot),
            _ => Err(Error::Corrupt("layout mismatch in split".into())),
        }
    }

    pub fn split_internal_into(
        &mut self,
        other: &mut NodeMut<'_>,
        pivot: usize,
        blobs: &BlobStore,
    ) -> Result<Vec<u8>> {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => Ok(a.split_internal_into(b, pivot)),
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => a.split_internal_into(b, pivot, blobs),
            _ => Err(Error::Corrupt("layout mismatch in split".into())),
        }
    }

    pub fn merge_from(&mut self, other: &mut NodeMut<'_>) -> Result<()> {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => {
                a.merge_from(b);
                Ok(())
            }
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => a.merge_from(b),
            _ => Err(Error::Corrupt("layout mismatch in merge".into())),
        }
    }

    pub fn shift_from_right(&mut self, other: &mut NodeMut<'_>, n: usize) -> Result<()> {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => {
                a.shift_from_right(b, n);
                Ok(())
            }
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => a.shift_from_right(b, n),
            _ => Err(Error::Corrupt("layout mismatch in shift".into())),
        }
    }

    pub fn shift_to_right(&mut self, other: &mut NodeMut<'_>, n: usize) -> Result<()> {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => {
                a.shift_to_right(b, n);
                Ok(())
            }
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => a.shift_to_right(b, n),
            _ => Err(Error::Corrupt("layout mismatch in shift".into())),
        }
    }

    /// Can this node absorb `other` (plus a pulled-down separator for
    /// internal merges)?
    pub fn can_merge(&self, other: &NodeMut<'_>, separator: Option<&[u8]>) -> bool {
        match (self, other) {
            (NodeMut::Pax(a), NodeMut::Pax(b)) => {
                let extra = if separator.is_some() { 1 } else { 0 };
                a.count() + b.count() + extra <= a.max_count()
            }
            (NodeMut::Slotted(a), NodeMut::Slotted(b)) => match separator {
                None => a.can_absorb(b),
                Some(sep) => a.can_absorb_with_separator(b, sep),
            },
            _ => false,
        }
    }

    pub fn replace_key(&mut self, slot: usize, key: &[u8], blobs: &BlobStore) -> Result<()> {
        match self {
            NodeMut::Pax(n) => {
                n.replace_key(slot, key);
                Ok(())
            }
            NodeMut::Slotted(n) => n.replace_key(slot, key, blobs),
        }
    }

    pub fn can_replace_key(&self, slot: usize, key: &[u8]) -> bool {
        match self {
            NodeMut::Pax(n) => key.len() == n.key_at(slot).len(),
            NodeMut::Slotted(n) => n.has_room_for_replace(slot, key),
        }
    }

    pub fn has_room(&self, key: &[u8]) -> bool {
        match self {
            NodeMut::Pax(n) => n.has_room(),
            NodeMut::Slotted(n) => n.has_room_for(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::cursor::BtreeCursor;
    use crate::btree::MatchMode;
    use crate::config::{DbConfig, MAX_INLINE_KEY};
    use tempfile::tempdir;

    const PS: usize = 2048;

    fn setup() -> (tempfile::TempDir, Pager, BlobStore) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("t.db"), PS, None).unwrap();
        let blobs = BlobStore::new(pager.file(), PS);
        (dir, pager, blobs)
    }

    fn variable_tree<'a>(pager: &'a Pager, blobs: &'a BlobStore) -> Btree<'a> {
        let config = DbConfig::default();
        let root = Btree::create_root(pager, &config).unwrap();
        Btree::new(pager, blobs, &config, root)
    }

    #[test]
    fn insert_and_lookup_single_pair() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        tree.insert(b"hello world", b"hello chris", false).unwrap();

        assert_eq!(
            tree.lookup(b"hello world").unwrap(),
            Some(b"hello chris".to_vec())
        );
        assert_eq!(tree.lookup(b"absent").unwrap(), None);
    }

    #[test]
    fn duplicate_insert_needs_overwrite() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        tree.insert(b"key", b"first", false).unwrap();
        assert!(matches!(
            tree.insert(b"key", b"second", false),
            Err(Error::DuplicateKey)
        ));

        tree.insert(b"key", b"second", true).unwrap();
        assert_eq!(tree.lookup(b"key").unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn record_size_classes_roundtrip() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        let sizes = [0usize, 1, 7, 8, 9, 200];
        for (i, size) in sizes.iter().enumerate() {
            let key = format!("size{i}");
            let record = vec![0xA0 | i as u8; *size];
            tree.insert(key.as_bytes(), &record, false).unwrap();
        }
        for (i, size) in sizes.iter().enumerate() {
            let key = format!("size{i}");
            let record = tree.lookup(key.as_bytes()).unwrap().unwrap();
            assert_eq!(record.len(), *size);
            assert!(record.iter().all(|&b| b == 0xA0 | i as u8));
        }
    }

    #[test]
    fn many_inserts_split_and_stay_sorted() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        for i in 0..400u32 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}");
            tree.insert(key.as_bytes(), value.as_bytes(), false).unwrap();
        }
        tree.check_integrity().unwrap();

        for i in 0..400u32 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}");
            assert_eq!(
                tree.lookup(key.as_bytes()).unwrap(),
                Some(value.into_bytes()),
                "missing {key}"
            );
        }
    }

    #[test]
    fn reverse_insert_order() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        for i in (0..200u32).rev() {
            let key = format!("key{i:05}");
            tree.insert(key.as_bytes(), b"v", false).unwrap();
        }
        tree.check_integrity().unwrap();

        let mut cursor = BtreeCursor::new();
        assert!(cursor.move_first(&tree).unwrap());
        let mut seen = vec![cursor.key(&tree).unwrap()];
        while cursor.move_next(&tree).unwrap() {
            seen.push(cursor.key(&tree).unwrap());
        }
        assert_eq!(seen.len(), 200);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn erase_with_rebalance() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        for i in 0..300u32 {
            let key = format!("key{i:05}");
            let value = format!("value{i:05}");
            tree.insert(key.as_bytes(), value.as_bytes(), false).unwrap();
        }

        for i in (0..300u32).step_by(2) {
            let key = format!("key{i:05}");
            assert!(tree.erase(key.as_bytes()).unwrap(), "failed erasing {key}");
        }
        tree.check_integrity().unwrap();

        for i in 0..300u32 {
            let key = format!("key{i:05}");
            let found = tree.lookup(key.as_bytes()).unwrap();
            if i % 2 == 0 {
                assert!(found.is_none(), "{key} should be gone");
            } else {
                assert!(found.is_some(), "{key} should remain");
            }
        }
    }

    #[test]
    fn erase_everything_leaves_empty_root() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        for i in 0..150u32 {
            let key = format!("key{i:04}");
            tree.insert(key.as_bytes(), b"x", false).unwrap();
        }
        for i in 0..150u32 {
            let key = format!("key{i:04}");
            assert!(tree.erase(key.as_bytes()).unwrap());
        }
        tree.check_integrity().unwrap();

        assert_eq!(tree.lookup(b"key0000").unwrap(), None);
        let mut cursor = BtreeCursor::new();
        assert!(!cursor.move_first(&tree).unwrap());
    }

    #[test]
    fn erase_missing_key_returns_false() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);
        tree.insert(b"present", b"v", false).unwrap();
        assert!(!tree.erase(b"missing").unwrap());
    }

    #[test]
    fn pax_fixed_records_tree() {
        let (_dir, pager, blobs) = setup();
        let config = DbConfig::fixed(8, 16);
        let root = Btree::create_root(&pager, &config).unwrap();
        let mut tree = Btree::new(&pager, &blobs, &config, root);

        for i in 0..500u64 {
            let key = i.to_be_bytes();
            let mut record = [0u8; 16];
            record[..8].copy_from_slice(&i.to_le_bytes());
            tree.insert(&key, &record, false).unwrap();
        }
        tree.check_integrity().unwrap();

        for i in 0..500u64 {
            let record = tree.lookup(&i.to_be_bytes()).unwrap().unwrap();
            assert_eq!(&record[..8], &i.to_le_bytes());
        }

        for i in (0..500u64).step_by(3) {
            assert!(tree.erase(&i.to_be_bytes()).unwrap());
        }
        tree.check_integrity().unwrap();
        assert_eq!(tree.lookup(&3u64.to_be_bytes()).unwrap(), None);
        assert!(tree.lookup(&4u64.to_be_bytes()).unwrap().is_some());
    }

    #[test]
    fn pax_rejects_wrong_key_length() {
        let (_dir, pager, blobs) = setup();
        let config = DbConfig::fixed(8, 16);
        let root = Btree::create_root(&pager, &config).unwrap();
        let mut tree = Btree::new(&pager, &blobs, &config, root);

        assert!(matches!(
            tree.insert(b"short", &[0u8; 16], false),
            Err(Error::InvParameter(_))
        ));
        assert!(matches!(
            tree.insert(&[1u8; 8], &[0u8; 5], false),
            Err(Error::InvParameter(_))
        ));
    }

    #[test]
    fn recno_layout_orders_numerically() {
        let (_dir, pager, blobs) = setup();
        let config = DbConfig::recno();
        let root = Btree::create_root(&pager, &config).unwrap();
        let mut tree = Btree::new(&pager, &blobs, &config, root);

        // insert out of order; 256 vs 2 exposes LE byte-order traps
        for i in [300u64, 2, 256, 1, 77] {
            tree.insert(&i.to_le_bytes(), format!("r{i}").as_bytes(), false)
                .unwrap();
        }
        tree.check_integrity().unwrap();

        let mut cursor = BtreeCursor::new();
        let mut order = Vec::new();
        assert!(cursor.move_first(&tree).unwrap());
        loop {
            let key = cursor.key(&tree).unwrap();
            order.push(u64::from_le_bytes(key.try_into().unwrap()));
            if !cursor.move_next(&tree).unwrap() {
                break;
            }
        }
        assert_eq!(order, vec![1, 2, 77, 256, 300]);
    }

    #[test]
    fn extended_keys_through_the_tree() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        let mut long_a = vec![b'k'; MAX_INLINE_KEY + 50];
        long_a.extend_from_slice(b"-a");
        let mut long_b = vec![b'k'; MAX_INLINE_KEY + 50];
        long_b.extend_from_slice(b"-b");

        tree.insert(&long_a, b"record-a", false).unwrap();
        tree.insert(&long_b, b"record-b", false).unwrap();
        tree.insert(b"short", b"record-s", false).unwrap();

        assert_eq!(tree.lookup(&long_a).unwrap(), Some(b"record-a".to_vec()));
        assert_eq!(tree.lookup(&long_b).unwrap(), Some(b"record-b".to_vec()));
        assert!(tree.erase(&long_a).unwrap());
        assert_eq!(tree.lookup(&long_a).unwrap(), None);
        assert_eq!(tree.lookup(&long_b).unwrap(), Some(b"record-b".to_vec()));
    }

    #[test]
    fn inline_key_boundary() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        let at_limit = vec![b'x'; MAX_INLINE_KEY];
        let over_limit = vec![b'x'; MAX_INLINE_KEY + 1];
        tree.insert(&at_limit, b"inline", false).unwrap();
        tree.insert(&over_limit, b"extended", false).unwrap();

        assert_eq!(tree.lookup(&at_limit).unwrap(), Some(b"inline".to_vec()));
        assert_eq!(
            tree.lookup(&over_limit).unwrap(),
            Some(b"extended".to_vec())
        );
    }

    #[test]
    fn cursor_seek_modes() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);
        for key in [b"10".as_ref(), b"20", b"30", b"40"] {
            tree.insert(key, key, false).unwrap();
        }

        let mut cursor = BtreeCursor::new();

        assert!(cursor.seek(&tree, b"20", MatchMode::Exact).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"20");
        assert!(!cursor.seek(&tree, b"25", MatchMode::Exact).unwrap());

        assert!(cursor.seek(&tree, b"25", MatchMode::Lt).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"20");
        assert!(cursor.seek(&tree, b"20", MatchMode::Lt).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"10");
        assert!(!cursor.seek(&tree, b"10", MatchMode::Lt).unwrap());

        assert!(cursor.seek(&tree, b"20", MatchMode::Leq).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"20");
        assert!(cursor.seek(&tree, b"25", MatchMode::Leq).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"20");

        assert!(cursor.seek(&tree, b"25", MatchMode::Gt).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"30");
        assert!(cursor.seek(&tree, b"30", MatchMode::Gt).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"40");
        assert!(!cursor.seek(&tree, b"40", MatchMode::Gt).unwrap());

        assert!(cursor.seek(&tree, b"30", MatchMode::Geq).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"30");
        assert!(cursor.seek(&tree, b"35", MatchMode::Geq).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"40");
        assert!(!cursor.seek(&tree, b"45", MatchMode::Geq).unwrap());
    }

    #[test]
    fn cursor_walks_across_leaf_boundaries() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);
        for i in 0..300u32 {
            let key = format!("key{i:05}");
            tree.insert(key.as_bytes(), b"v", false).unwrap();
        }

        let mut cursor = BtreeCursor::new();
        assert!(cursor.move_last(&tree).unwrap());
        assert_eq!(cursor.key(&tree).unwrap(), b"key00299");
        let mut n = 1;
        while cursor.move_prev(&tree).unwrap() {
            n += 1;
        }
        assert_eq!(n, 300);
        assert_eq!(cursor.key(&tree).unwrap(), b"key00000");
    }

    #[test]
    fn overwrite_grows_record_into_blob() {
        let (_dir, pager, blobs) = setup();
        let mut tree = variable_tree(&pager, &blobs);

        tree.insert(b"key", b"tiny", false).unwrap();
        let big = vec![0x42u8; 500];
        tree.insert(b"key", &big, true).unwrap();
        assert_eq!(tree.lookup(b"key").unwrap(), Some(big));

        // and shrink back to inline
        tree.insert(b"key", b"small!", true).unwrap();
        assert_eq!(tree.lookup(b"key").unwrap(), Some(b"small!".to_vec()));
    }
}
