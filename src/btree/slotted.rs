//! Slotted node layout (variable-size keys).
//!
//! The payload carries a slot array growing up from the node header and a
//! key heap growing down from the page end:
//!
//! ```text
//! | node header | subheader | slot[0] slot[1] ... | free ... | cells |
//! ```
//!
//! Each 16-byte slot holds the key cell's offset and length, the per-slot
//! key flags, and an 8-byte record field (inline record codec, blob id, or
//! child page id). Keys longer than [`MAX_INLINE_KEY`] spill to blob
//! storage; their cell is the 8-byte blob id and the slot carries
//! [`KEY_EXTENDED`].
//!
//! Erasing leaves the dead cell behind as fragmentation; when fragmented
//! bytes exceed a quarter of the heap the node is compacted in place.

use std::cmp::Ordering;

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAX_INLINE_KEY, NODE_HEADER_SIZE, PAGE_HEADER_SIZE, SLOTTED_LINEAR_THRESHOLD};
use crate::error::{Error, Result};
use crate::storage::BlobStore;

use super::node::{search_slots, KeyRef, NodeHeader, KEY_EXTENDED};
use super::Comparator;

pub const SLOT_SIZE: usize = 16;
const SUBHEADER_SIZE: usize = 8;
const CONTENT_BASE: usize = PAGE_HEADER_SIZE + NODE_HEADER_SIZE + SUBHEADER_SIZE;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, PartialEq, Eq)]
pub struct Slot {
    /// Absolute byte offset of the key cell within the page.
    offset: U32,
    /// Real key length; the cell holds a blob id instead when the key is
    /// extended.
    key_len: U16,
    flags: u8,
    reserved: u8,
    record: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    fn cell_len(&self) -> usize {
        if self.flags & KEY_EXTENDED != 0 {
            8
        } else {
            self.key_len.get() as usize
        }
    }
}

/// Subheader: heap frontier and fragmentation counter.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct SubHeader {
    free_end: U32,
    frag_bytes: U32,
}

pub struct SlottedNode<'a> {
    data: &'a [u8],
}

impl<'a> SlottedNode<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_page(self.data).expect("node header")
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.header().is_leaf()
    }

    pub fn ptr_down(&self) -> u64 {
        self.header().ptr_down()
    }

    fn slot(&self, index: usize) -> Slot {
        debug_assert!(index < self.count());
        let off = CONTENT_BASE + index * SLOT_SIZE;
        *Slot::ref_from_bytes(&self.data[off..off + SLOT_SIZE]).expect("slot bytes")
    }

    pub fn flags_at(&self, index: usize) -> u8 {
        self.slot(index).flags
    }

    pub fn record_slot(&self, index: usize) -> &'a [u8] {
        let off = CONTENT_BASE + index * SLOT_SIZE + 8;
        &self.data[off..off + 8]
    }

    pub fn child_at(&self, index: usize) -> u64 {
        u64::from_le_bytes(self.slot(index).record)
    }

    pub fn key_len(&self, index: usize) -> usize {
        self.slot(index).key_len.get() as usize
    }

    pub fn key_ref(&self, index: usize) -> KeyRef<'a> {
        let slot = self.slot(index);
        let off = slot.offset.get() as usize;
        if slot.flags & KEY_EXTENDED != 0 {
            let id = u64::from_le_bytes(self.data[off..off + 8].try_into().expect("blob id cell"));
            KeyRef::Extended(id)
        } else {
            KeyRef::Inline(&self.data[off..off + slot.key_len.get() as usize])
        }
    }

    pub fn load_key(&self, index: usize, blobs: &BlobStore) -> Result<Vec<u8>> {
        match self.key_ref(index) {
            KeyRef::Inline(bytes) => Ok(bytes.to_vec()),
            KeyRef::Extended(id) => blobs.get(id),
        }
    }

    pub fn compare_key(
        &self,
        probe: &[u8],
        index: usize,
        cmp: &Comparator,
        blobs: &BlobStore,
    ) -> Result<Ordering> {
        match self.key_ref(index) {
            KeyRef::Inline(bytes) => Ok(cmp.cmp(probe, bytes)),
            KeyRef::Extended(id) => {
                let key = blobs.get(id)?;
                Ok(cmp.cmp(probe, &key))
            }
        }
    }

    pub fn find(&self, probe: &[u8], cmp: &Comparator, blobs: &BlobStore) -> Result<(i64, Ordering)> {
        search_slots(self.count(), SLOTTED_LINEAR_THRESHOLD, |i| {
            self.compare_key(probe, i, cmp, blobs)
        })
    }

    fn subheader(&self) -> &SubHeader {
        let off = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;
        SubHeader::ref_from_bytes(&self.data[off..off + SUBHEADER_SIZE]).expect("subheader")
    }

    pub fn free_space(&self) -> usize {
        let slot_area_end = CONTENT_BASE + self.count() * SLOT_SIZE;
        self.subheader().free_end.get() as usize - slot_area_end
    }

    /// Can `key` be inserted without splitting, allowing compaction?
    pub fn has_room_for(&self, key: &[u8]) -> bool {
        let cell = if key.len() > MAX_INLINE_KEY {
            8
        } else {
            key.len()
        };
        self.free_space() + self.subheader().frag_bytes.get() as usize >= SLOT_SIZE + cell
    }
}

pub struct SlottedNodeMut<'a> {
    data: &'a mut [u8],
}

impl<'a> SlottedNodeMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn init(data: &'a mut [u8], leaf: bool) -> Self {
        let page_len = data.len();
        NodeHeader::from_page_mut(data).expect("node header").init(leaf);
        let mut node = Self { data };
        node.subheader_mut().free_end = U32::new(page_len as u32);
        node.subheader_mut().frag_bytes = U32::new(0);
        node
    }

    pub fn as_ref(&self) -> SlottedNode<'_> {
        SlottedNode { data: self.data }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_page_mut(self.data).expect("node header")
    }

    fn subheader(&self) -> &SubHeader {
        let off = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;
        SubHeader::ref_from_bytes(&self.data[off..off + SUBHEADER_SIZE]).expect("subheader")
    }

    fn subheader_mut(&mut self) -> &mut SubHeader {
        let off = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;
        SubHeader::mut_from_bytes(&mut self.data[off..off + SUBHEADER_SIZE]).expect("subheader")
    }

    pub fn count(&self) -> usize {
        self.as_ref().count()
    }

    fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u32);
    }

    pub fn ptr_down(&self) -> u64 {
        self.as_ref().ptr_down()
    }

    pub fn set_ptr_down(&mut self, page: u64) {
        self.header_mut().set_ptr_down(page);
    }

    fn free_end(&self) -> usize {
        self.subheader().free_end.get() as usize
    }

    fn frag_bytes(&self) -> usize {
        self.subheader().frag_bytes.get() as usize
    }

    fn slot(&self, index: usize) -> Slot {
        let off = CONTENT_BASE + index * SLOT_SIZE;
        *Slot::ref_from_bytes(&self.data[off..off + SLOT_SIZE]).expect("slot bytes")
    }

    fn write_slot(&mut self, index: usize, slot: Slot) {
        let off = CONTENT_BASE + index * SLOT_SIZE;
        self.data[off..off + SLOT_SIZE].copy_from_slice(slot.as_bytes());
    }

    pub fn flags_at(&self, index: usize) -> u8 {
        self.slot(index).flags
    }

    pub fn set_flags(&mut self, index: usize, flags: u8) {
        let mut slot = self.slot(index);
        // the extended-key bit belongs to the key cell, not the caller
        let ext = slot.flags & KEY_EXTENDED;
        slot.flags = (flags & !KEY_EXTENDED) | ext;
        self.write_slot(index, slot);
    }

    pub fn record_slot(&self, index: usize) -> &[u8] {
        let off = CONTENT_BASE + index * SLOT_SIZE + 8;
        &self.data[off..off + 8]
    }

    pub fn record_slot_mut(&mut self, index: usize) -> &mut [u8] {
        let off = CONTENT_BASE + index * SLOT_SIZE + 8;
        &mut self.data[off..off + 8]
    }

    pub fn child_at(&self, index: usize) -> u64 {
        u64::from_le_bytes(self.slot(index).record)
    }

    pub fn set_child(&mut self, index: usize, page: u64) {
        self.record_slot_mut(index).copy_from_slice(&page.to_le_bytes());
    }

    pub fn key_len(&self, index: usize) -> usize {
        self.as_ref().key_len(index)
    }

    pub fn load_key(&self, index: usize, blobs: &BlobStore) -> Result<Vec<u8>> {
        self.as_ref().load_key(index, blobs)
    }

    fn slot_area_end(&self) -> usize {
        CONTENT_BASE + self.count() * SLOT_SIZE
    }

    pub fn free_space(&self) -> usize {
        self.free_end() - self.slot_area_end()
    }

    /// Live heap bytes (cells still referenced by a slot).
    fn live_cell_bytes(&self) -> usize {
        (self.data.len() - self.free_end()) - self.frag_bytes()
    }

    fn cell_len_for(key: &[u8]) -> usize {
        if key.len() > MAX_INLINE_KEY {
            8
        } else {
            key.len()
        }
    }

    /// Can `key` be inserted without splitting, allowing compaction?
    pub fn has_room_for(&self, key: &[u8]) -> bool {
        let need = SLOT_SIZE + Self::cell_len_for(key);
        self.free_space() + self.frag_bytes() >= need
    }

    /// Could this node absorb all of `other`'s live slots?
    pub fn can_absorb(&self, other: &SlottedNodeMut<'_>) -> bool {
        let incoming = other.count() * SLOT_SIZE + other.live_cell_bytes();
        self.free_space() + self.frag_bytes() >= incoming
    }

    /// Merge check for internal nodes: `other`'s slots plus the separator
    /// pulled down from the parent.
    pub fn can_absorb_with_separator(&self, other: &SlottedNodeMut<'_>, separator: &[u8]) -> bool {
        let incoming = other.count() * SLOT_SIZE
            + other.live_cell_bytes()
            + SLOT_SIZE
            + Self::cell_len_for(separator);
        self.free_space() + self.frag_bytes() >= incoming
    }

    fn ensure_room(&mut self, cell_len: usize) -> Result<()> {
        let need = SLOT_SIZE + cell_len;
        if self.free_space() < need {
            self.compact();
        }
        if self.free_space() < need {
            return Err(Error::Corrupt("slotted node overflow".into()));
        }
        Ok(())
    }

    /// Rewrites all cells contiguously against the page end, dropping
    /// fragmentation.
    fn compact(&mut self) {
        let count = self.count();
        let mut cells: Vec<(usize, Vec<u8>)> = Vec::with_capacity(count);
        for i in 0..count {
            let slot = self.slot(i);
            let off = slot.offset.get() as usize;
            cells.push((i, self.data[off..off + slot.cell_len()].to_vec()));
        }

        let mut free_end = self.data.len();
        for (i, cell) in cells {
            free_end -= cell.len();
            self.data[free_end..free_end + cell.len()].copy_from_slice(&cell);
            let mut slot = self.slot(i);
            slot.offset = U32::new(free_end as u32);
            self.write_slot(i, slot);
        }

        self.subheader_mut().free_end = U32::new(free_end as u32);
        self.subheader_mut().frag_bytes = U32::new(0);
    }

    fn should_compact(&self) -> bool {
        let heap = self.data.len() - self.slot_area_end();
        self.frag_bytes() > heap / 4
    }

    fn push_cell(&mut self, cell: &[u8]) -> usize {
        let free_end = self.free_end() - cell.len();
        self.data[free_end..free_end + cell.len()].copy_from_slice(cell);
        self.subheader_mut().free_end = U32::new(free_end as u32);
        free_end
    }

    /// Inserts a pre-encoded slot (cell bytes as stored, real key length,
    /// flags, record field) at `index`. Used by insert, splits, merges and
    /// sibling borrowing; blob ownership travels with the cell.
    fn insert_raw(
        &mut self,
        index: usize,
        cell: &[u8],
        key_len: usize,
        flags: u8,
        record: [u8; 8],
    ) -> Result<()> {
        self.ensure_room(cell.len())?;
        let count = self.count();
        debug_assert!(index <= count);

        let offset = self.push_cell(cell);

        let start = CONTENT_BASE + index * SLOT_SIZE;
        let end = CONTENT_BASE + count * SLOT_SIZE;
        self.data.copy_within(start..end, start + SLOT_SIZE);

        self.write_slot(
            index,
            Slot {
                offset: U32::new(offset as u32),
                key_len: U16::new(key_len as u16),
                flags,
                reserved: 0,
                record,
            },
        );
        self.set_count(count + 1);
        Ok(())
    }

    /// Inserts `key` at `index`, spilling to blob storage when the key
    /// exceeds the inline budget. The record field starts zeroed.
    pub fn insert(&mut self, index: usize, key: &[u8], blobs: &BlobStore) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvParameter("key too long"));
        }
        if key.len() > MAX_INLINE_KEY {
            let blob_id = blobs.put(key)?;
            self.insert_raw(index, &blob_id.to_le_bytes(), key.len(), KEY_EXTENDED, [0; 8])
        } else {
            self.insert_raw(index, key, key.len(), 0, [0; 8])
        }
    }

    fn remove_slot(&mut self, index: usize) {
        let count = self.count();
        let slot = self.slot(index);
        let cell_len = slot.cell_len();

        let start = CONTENT_BASE + (index + 1) * SLOT_SIZE;
        let end = CONTENT_BASE + count * SLOT_SIZE;
        self.data.copy_within(start..end, start - SLOT_SIZE);

        let frag = self.frag_bytes() + cell_len;
        self.subheader_mut().frag_bytes = U32::new(frag as u32);
        self.set_count(count - 1);

        if self.should_compact() {
            self.compact();
        }
    }

    /// Erases the slot, freeing an extended key's overflow blob.
    pub fn erase(&mut self, index: usize, blobs: &BlobStore) -> Result<()> {
        if let KeyRef::Extended(id) = self.as_ref().key_ref(index) {
            blobs.free(id)?;
        }
        self.remove_slot(index);
        Ok(())
    }

    /// Erases the slot without touching blob storage (ownership moved to
    /// another node).
    fn erase_moved(&mut self, index: usize) {
        self.remove_slot(index);
    }

    /// Replaces the key of an occupied slot, keeping flags' record bits
    /// and the record field.
    pub fn replace_key(&mut self, index: usize, key: &[u8], blobs: &BlobStore) -> Result<()> {
        let old = self.slot(index);
        let record = old.record;
        let record_flags = old.flags & !KEY_EXTENDED;
        if old.flags & KEY_EXTENDED != 0 {
            let off = old.offset.get() as usize;
            let id = u64::from_le_bytes(self.data[off..off + 8].try_into().expect("blob id cell"));
            blobs.free(id)?;
        }

        self.remove_slot(index);
        if key.len() > MAX_INLINE_KEY {
            let blob_id = blobs.put(key)?;
            self.insert_raw(
                index,
                &blob_id.to_le_bytes(),
                key.len(),
                record_flags | KEY_EXTENDED,
                record,
            )
        } else {
            self.insert_raw(index, key, key.len(), record_flags, record)
        }
    }

    /// Whether a replacement key would fit after the old cell is released.
    pub fn has_room_for_replace(&self, index: usize, key: &[u8]) -> bool {
        let released = SLOT_SIZE + self.slot(index).cell_len();
        let need = SLOT_SIZE + Self::cell_len_for(key);
        self.free_space() + self.frag_bytes() + released >= need
    }

    fn move_slot_to(&self, index: usize, other: &mut SlottedNodeMut<'_>, to: usize) -> Result<()> {
        let slot = self.slot(index);
        let off = slot.offset.get() as usize;
        let cell = &self.data[off..off + slot.cell_len()];
        other.insert_raw(to, cell, slot.key_len.get() as usize, slot.flags, slot.record)
    }

    /// Leaf split: slots `[pivot, count)` move to `other`.
    pub fn split_leaf_into(&mut self, other: &mut SlottedNodeMut<'_>, pivot: usize) -> Result<()> {
        let count = self.count();
        debug_assert_eq!(other.count(), 0);

        for i in pivot..count {
            self.move_slot_to(i, other, i - pivot)?;
        }
        for _ in pivot..count {
            self.erase_moved(pivot);
        }
        Ok(())
    }

    /// Internal split: slots `[pivot+1, count)` move to `other`, the
    /// pivot's right child becomes `other.ptr_down`, and the pivot key is
    /// removed and returned for the parent.
    pub fn split_internal_into(
        &mut self,
        other: &mut SlottedNodeMut<'_>,
        pivot: usize,
        blobs: &BlobStore,
    ) -> Result<Vec<u8>> {
        let count = self.count();
        debug_assert_eq!(other.count(), 0);

        let separator = self.load_key(pivot, blobs)?;
        other.set_ptr_down(self.child_at(pivot));

        for i in pivot + 1..count {
            self.move_slot_to(i, other, i - pivot - 1)?;
        }
        for _ in pivot + 1..count {
            self.erase_moved(pivot + 1);
        }
        // the pivot leaves the tree level entirely; its overflow blob goes
        // with it (the parent stores its own copy)
        self.erase(pivot, blobs)?;
        Ok(separator)
    }

    /// Appends all of `other`'s slots to the end of this node.
    pub fn merge_from(&mut self, other: &mut SlottedNodeMut<'_>) -> Result<()> {
        let other_count = other.count();
        let mut to = self.count();
        for i in 0..other_count {
            other.move_slot_to(i, self, to)?;
            to += 1;
        }
        for _ in 0..other_count {
            other.erase_moved(0);
        }
        Ok(())
    }

    /// Moves the first `n` slots of the right sibling to the end of this
    /// node.
    pub fn shift_from_right(&mut self, other: &mut SlottedNodeMut<'_>, n: usize) -> Result<()> {
        for _ in 0..n {
            let to = self.count();
            other.move_slot_to(0, self, to)?;
            other.erase_moved(0);
        }
        Ok(())
    }

    /// Moves the last `n` slots of this node to the front of the right
    /// sibling.
    pub fn shift_to_right(&mut self, other: &mut SlottedNodeMut<'_>, n: usize) -> Result<()> {
        for _ in 0..n {
            let from = self.count() - 1;
            self.move_slot_to(from, other, 0)?;
            self.erase_moved(from);
        }
        Ok(())
    }
}
