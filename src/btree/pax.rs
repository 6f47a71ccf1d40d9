//! PAX node layout (fixed-size keys).
//!
//! The payload after the node header is partitioned into three parallel
//! fixed-offset regions sized by a precomputed `max_count`:
//!
//! ```text
//! +------------------------+-----------------+------------------------+
//! | keys                   | flags           | records                |
//! | max_count * key_size   | max_count * 1   | max_count * record_size|
//! +------------------------+-----------------+------------------------+
//! ```
//!
//! `record_size` is 8 for internal nodes (child page ids) and for leaves
//! with variable records (inline codec or blob id); leaves with fixed-size
//! records store the record bytes directly. Every structural operation is
//! three parallel memory moves, and `max_count` is constant for the life
//! of the node.

use std::cmp::Ordering;

use crate::config::{NODE_HEADER_SIZE, PAGE_HEADER_SIZE, PAX_LINEAR_THRESHOLD};
use crate::error::Result;

use super::node::{search_slots, NodeHeader};
use super::Comparator;

/// Region geometry for one PAX node.
#[derive(Debug, Clone, Copy)]
pub struct PaxGeom {
    pub key_size: usize,
    pub record_size: usize,
    pub max_count: usize,
    base: usize,
}

impl PaxGeom {
    pub fn new(page_len: usize, key_size: usize, record_size: usize) -> Self {
        let base = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;
        let usable = page_len - base;
        // one flag byte rides along with every key
        let max_count = usable / (key_size + 1 + record_size);
        Self {
            key_size,
            record_size,
            max_count,
            base,
        }
    }

    fn key_off(&self, slot: usize) -> usize {
        self.base + slot * self.key_size
    }

    fn flag_off(&self, slot: usize) -> usize {
        self.base + self.max_count * self.key_size + slot
    }

    fn rec_off(&self, slot: usize) -> usize {
        self.base + self.max_count * (self.key_size + 1) + slot * self.record_size
    }
}

pub struct PaxNode<'a> {
    data: &'a [u8],
    geom: PaxGeom,
}

impl<'a> PaxNode<'a> {
    pub fn new(data: &'a [u8], key_size: usize, record_size: usize) -> Self {
        let geom = PaxGeom::new(data.len(), key_size, record_size);
        Self { data, geom }
    }

    pub fn count(&self) -> usize {
        NodeHeader::from_page(self.data).expect("node header").count() as usize
    }

    pub fn is_leaf(&self) -> bool {
        NodeHeader::from_page(self.data).expect("node header").is_leaf()
    }

    pub fn ptr_down(&self) -> u64 {
        NodeHeader::from_page(self.data).expect("node header").ptr_down()
    }

    pub fn max_count(&self) -> usize {
        self.geom.max_count
    }

    pub fn key_at(&self, slot: usize) -> &'a [u8] {
        debug_assert!(slot < self.count());
        let off = self.geom.key_off(slot);
        &self.data[off..off + self.geom.key_size]
    }

    pub fn flags_at(&self, slot: usize) -> u8 {
        self.data[self.geom.flag_off(slot)]
    }

    pub fn record_slot(&self, slot: usize) -> &'a [u8] {
        let off = self.geom.rec_off(slot);
        &self.data[off..off + self.geom.record_size]
    }

    pub fn child_at(&self, slot: usize) -> u64 {
        debug_assert_eq!(self.geom.record_size, 8);
        u64::from_le_bytes(self.record_slot(slot).try_into().expect("child slot"))
    }

    pub fn find(&self, probe: &[u8], cmp: &Comparator) -> Result<(i64, Ordering)> {
        search_slots(self.count(), PAX_LINEAR_THRESHOLD, |i| {
            Ok(cmp.cmp(probe, self.key_at(i)))
        })
    }
}

pub struct PaxNodeMut<'a> {
    data: &'a mut [u8],
    geom: PaxGeom,
}

impl<'a> PaxNodeMut<'a> {
    pub fn new(data: &'a mut [u8], key_size: usize, record_size: usize) -> Self {
        let geom = PaxGeom::new(data.len(), key_size, record_size);
        Self { data, geom }
    }

    pub fn as_ref(&self) -> PaxNode<'_> {
        PaxNode {
            data: self.data,
            geom: self.geom,
        }
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::from_page(self.data).expect("node header")
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::from_page_mut(self.data).expect("node header")
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u32);
    }

    pub fn ptr_down(&self) -> u64 {
        self.header().ptr_down()
    }

    pub fn set_ptr_down(&mut self, page: u64) {
        self.header_mut().set_ptr_down(page);
    }

    pub fn max_count(&self) -> usize {
        self.geom.max_count
    }

    pub fn has_room(&self) -> bool {
        self.count() < self.geom.max_count
    }

    pub fn key_at(&self, slot: usize) -> &[u8] {
        let off = self.geom.key_off(slot);
        &self.data[off..off + self.geom.key_size]
    }

    pub fn flags_at(&self, slot: usize) -> u8 {
        self.data[self.geom.flag_off(slot)]
    }

    pub fn set_flags(&mut self, slot: usize, flags: u8) {
        let off = self.geom.flag_off(slot);
        self.data[off] = flags;
    }

    pub fn record_slot(&self, slot: usize) -> &[u8] {
        let off = self.geom.rec_off(slot);
        &self.data[off..off + self.geom.record_size]
    }

    pub fn record_slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let off = self.geom.rec_off(slot);
        &mut self.data[off..off + self.geom.record_size]
    }

    pub fn child_at(&self, slot: usize) -> u64 {
        u64::from_le_bytes(self.record_slot(slot).try_into().expect("child slot"))
    }

    pub fn set_child(&mut self, slot: usize, page: u64) {
        debug_assert_eq!(self.geom.record_size, 8);
        self.record_slot_mut(slot).copy_from_slice(&page.to_le_bytes());
    }

    /// Shifts slots `[slot, count)` right by one and writes the key at
    /// `slot`. The flag byte and record slot are zeroed for the caller to
    /// fill in.
    pub fn insert(&mut self, slot: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.geom.key_size);
        debug_assert!(self.has_room());
        let count = self.count();
        debug_assert!(slot <= count);

        if count > slot {
            let (ks, fs, rs) = (self.geom.key_size, 1, self.geom.record_size);
            let key_src = self.geom.key_off(slot);
            self.data
                .copy_within(key_src..key_src + (count - slot) * ks, key_src + ks);
            let flag_src = self.geom.flag_off(slot);
            self.data
                .copy_within(flag_src..flag_src + (count - slot) * fs, flag_src + fs);
            let rec_src = self.geom.rec_off(slot);
            self.data
                .copy_within(rec_src..rec_src + (count - slot) * rs, rec_src + rs);
        }

        let key_off = self.geom.key_off(slot);
        self.data[key_off..key_off + key.len()].copy_from_slice(key);
        let flag_off = self.geom.flag_off(slot);
        self.data[flag_off] = 0;
        let rec_off = self.geom.rec_off(slot);
        self.data[rec_off..rec_off + self.geom.record_size].fill(0);

        self.set_count(count + 1);
    }

    /// Shifts slots `(slot, count)` left by one and decrements the count.
    pub fn erase(&mut self, slot: usize) {
        let count = self.count();
        debug_assert!(slot < count);

        if slot != count - 1 {
            let (ks, rs) = (self.geom.key_size, self.geom.record_size);
            let tail = count - slot - 1;
            let key_src = self.geom.key_off(slot + 1);
            self.data
                .copy_within(key_src..key_src + tail * ks, key_src - ks);
            let flag_src = self.geom.flag_off(slot + 1);
            self.data.copy_within(flag_src..flag_src + tail, flag_src - 1);
            let rec_src = self.geom.rec_off(slot + 1);
            self.data
                .copy_within(rec_src..rec_src + tail * rs, rec_src - rs);
        }

        self.set_count(count - 1);
    }

    /// Overwrites the key bytes of an occupied slot.
    pub fn replace_key(&mut self, slot: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.geom.key_size);
        let off = self.geom.key_off(slot);
        self.data[off..off + key.len()].copy_from_slice(key);
    }

    fn copy_region_to(&self, other: &mut PaxNodeMut<'_>, from: usize, n: usize, to: usize) {
        let (ks, rs) = (self.geom.key_size, self.geom.record_size);

        let src = self.geom.key_off(from);
        let dst = other.geom.key_off(to);
        other.data[dst..dst + n * ks].copy_from_slice(&self.data[src..src + n * ks]);

        let src = self.geom.flag_off(from);
        let dst = other.geom.flag_off(to);
        other.data[dst..dst + n].copy_from_slice(&self.data[src..src + n]);

        let src = self.geom.rec_off(from);
        let dst = other.geom.rec_off(to);
        other.data[dst..dst + n * rs].copy_from_slice(&self.data[src..src + n * rs]);
    }

    /// Leaf split: slots `[pivot, count)` move to `other` at offset 0. The
    /// pivot key stays the first key of `other`; the caller copies it into
    /// the parent as the separator.
    pub fn split_leaf_into(&mut self, other: &mut PaxNodeMut<'_>, pivot: usize) {
        let count = self.count();
        debug_assert!(pivot < count);
        debug_assert_eq!(other.count(), 0);

        self.copy_region_to(other, pivot, count - pivot, 0);
        other.set_count(count - pivot);
        self.set_count(pivot);
    }

    /// Internal split: slots `[pivot+1, count)` move to `other`, the pivot
    /// key is removed from this node and returned for the parent, and the
    /// pivot's right child becomes `other.ptr_down`.
    pub fn split_internal_into(&mut self, other: &mut PaxNodeMut<'_>, pivot: usize) -> Vec<u8> {
        let count = self.count();
        debug_assert!(pivot < count);
        debug_assert_eq!(other.count(), 0);

        let separator = self.key_at(pivot).to_vec();
        other.set_ptr_down(self.child_at(pivot));

        self.copy_region_to(other, pivot + 1, count - pivot - 1, 0);
        other.set_count(count - pivot - 1);
        self.set_count(pivot);

        separator
    }

    /// Appends all of `other`'s slots to the end of this node. The caller
    /// removes the separator from the parent.
    pub fn merge_from(&mut self, other: &mut PaxNodeMut<'_>) {
        let count = self.count();
        let other_count = other.count();
        debug_assert!(count + other_count <= self.geom.max_count);

        if other_count > 0 {
            other.copy_region_to(self, 0, other_count, count);
        }
        self.set_count(count + other_count);
        other.set_count(0);
    }

    /// Moves the first `n` slots of `other` (the right sibling) to the end
    /// of this node.
    pub fn shift_from_right(&mut self, other: &mut PaxNodeMut<'_>, n: usize) {
        let count = self.count();
        let other_count = other.count();
        debug_assert!(n <= other_count);

        other.copy_region_to(self, 0, n, count);
        self.set_count(count + n);

        // close the gap in the right sibling
        let (ks, rs) = (other.geom.key_size, other.geom.record_size);
        let tail = other_count - n;
        let key_src = other.geom.key_off(n);
        other
            .data
            .copy_within(key_src..key_src + tail * ks, other.geom.key_off(0));
        let flag_src = other.geom.flag_off(n);
        other
            .data
            .copy_within(flag_src..flag_src + tail, other.geom.flag_off(0));
        let rec_src = other.geom.rec_off(n);
        other
            .data
            .copy_within(rec_src..rec_src + tail * rs, other.geom.rec_off(0));
        other.set_count(tail);
    }

    /// Moves the last `n` slots of this node to the front of `other` (the
    /// right sibling).
    pub fn shift_to_right(&mut self, other: &mut PaxNodeMut<'_>, n: usize) {
        let count = self.count();
        let other_count = other.count();
        debug_assert!(n <= count);
        debug_assert!(other_count + n <= other.geom.max_count);

        // make room at the front of the right sibling
        let (ks, rs) = (other.geom.key_size, other.geom.record_size);
        let key_src = other.geom.key_off(0);
        other
            .data
            .copy_within(key_src..key_src + other_count * ks, other.geom.key_off(n));
        let flag_src = other.geom.flag_off(0);
        other
            .data
            .copy_within(flag_src..flag_src + other_count, other.geom.flag_off(n));
        let rec_src = other.geom.rec_off(0);
        other
            .data
            .copy_within(rec_src..rec_src + other_count * rs, other.geom.rec_off(n));

        self.copy_region_to(other, count - n, n, 0);
        other.set_count(other_count + n);
        self.set_count(count - n);
    }
}
