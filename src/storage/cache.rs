//! Page cache.
//!
//! The cache owns every resident page. Lookup goes through a hash-bucketed
//! structure: `page_id % CACHE_BUCKETS` selects a bucket, each bucket is an
//! intrusive chain, and lookup walks the chain linearly with head-insert so
//! recently cached pages are found first. A separate total list keeps all
//! resident pages in recency order (head = MRU, tail = LRU).
//!
//! Purge runs whenever resident bytes exceed the configured capacity. It
//! walks from the LRU tail, skips pages that are pinned by a cursor or are
//! members of the current changeset, and evicts at least [`PURGE_AT_LEAST`]
//! pages per pass. In unlimited mode purge is a no-op.
//!
//! The cache state carries no lock of its own; the pager wraps it in the
//! engine's cache mutex.

use tracing::trace;

use super::collection::{PageCollection, PageSlab};
use super::page::{ListRole, Page};
use crate::config::{CACHE_BUCKETS, PURGE_AT_LEAST};
use crate::error::Result;

#[derive(Debug)]
pub struct CacheState {
    page_size: usize,
    /// Capacity in bytes; `u64::MAX` in unlimited mode.
    capacity_bytes: u64,
    slab: PageSlab,
    free_slots: Vec<u32>,
    totallist: PageCollection,
    buckets: Vec<PageCollection>,
    changeset: PageCollection,
    hits: u64,
    misses: u64,
}

impl CacheState {
    pub fn new(page_size: usize, capacity_bytes: Option<u64>) -> Self {
        Self {
            page_size,
            capacity_bytes: capacity_bytes.unwrap_or(u64::MAX),
            slab: Vec::new(),
            free_slots: Vec::new(),
            totallist: PageCollection::new(ListRole::CacheTotal),
            buckets: (0..CACHE_BUCKETS)
                .map(|_| PageCollection::new(ListRole::CacheBucket))
                .collect(),
            changeset: PageCollection::new(ListRole::Changeset),
            hits: 0,
            misses: 0,
        }
    }

    fn bucket_of(page_id: u64) -> usize {
        (page_id % CACHE_BUCKETS as u64) as usize
    }

    pub fn page(&self, slot: u32) -> &Page {
        self.slab[slot as usize].as_ref().expect("vacant cache slot")
    }

    pub fn page_mut(&mut self, slot: u32) -> &mut Page {
        self.slab[slot as usize].as_mut().expect("vacant cache slot")
    }

    /// Two distinct pages mutably at once (split borrow on the slab).
    pub fn page_pair_mut(&mut self, a: u32, b: u32) -> (&mut Page, &mut Page) {
        assert_ne!(a, b, "page pair must be distinct");
        let (a, b) = (a as usize, b as usize);
        if a < b {
            let (left, right) = self.slab.split_at_mut(b);
            (
                left[a].as_mut().expect("vacant cache slot"),
                right[0].as_mut().expect("vacant cache slot"),
            )
        } else {
            let (left, right) = self.slab.split_at_mut(a);
            let second = right[0].as_mut().expect("vacant cache slot");
            (second, left[b].as_mut().expect("vacant cache slot"))
        }
    }

    /// Finds a resident page, updating hit/miss counters and LRU order.
    pub fn lookup(&mut self, page_id: u64) -> Option<u32> {
        let bucket = Self::bucket_of(page_id);
        let mut cursor = self.buckets[bucket].head();
        while let Some(slot) = cursor {
            if self.page(slot).id() == page_id {
                self.hits += 1;
                self.totallist.move_to_head(&mut self.slab, slot);
                return Some(slot);
            }
            cursor = self.buckets[bucket].next(&self.slab, slot);
        }
        self.misses += 1;
        None
    }

    /// Resident check without touching counters or recency.
    pub fn peek(&self, page_id: u64) -> Option<u32> {
        let bucket = Self::bucket_of(page_id);
        let mut cursor = self.buckets[bucket].head();
        while let Some(slot) = cursor {
            if self.page(slot).id() == page_id {
                return Some(slot);
            }
            cursor = self.buckets[bucket].next(&self.slab, slot);
        }
        None
    }

    /// Inserts a page, placing it at the bucket head and the MRU end.
    pub fn insert(&mut self, page: Page) -> u32 {
        let page_id = page.id();
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slab[slot as usize] = Some(page);
                slot
            }
            None => {
                self.slab.push(Some(page));
                (self.slab.len() - 1) as u32
            }
        };
        self.buckets[Self::bucket_of(page_id)].push_head(&mut self.slab, slot);
        self.totallist.push_head(&mut self.slab, slot);
        slot
    }

    /// Unlinks a page from every list and releases its slot.
    pub fn remove(&mut self, slot: u32) -> Page {
        if self.changeset.contains(&self.slab, slot) {
            self.changeset.unlink(&mut self.slab, slot);
        }
        let page_id = self.page(slot).id();
        self.buckets[Self::bucket_of(page_id)].unlink(&mut self.slab, slot);
        self.totallist.unlink(&mut self.slab, slot);
        let page = self.slab[slot as usize].take().expect("vacant cache slot");
        self.free_slots.push(slot);
        page
    }

    pub fn mark_changeset(&mut self, slot: u32) {
        if !self.changeset.contains(&self.slab, slot) {
            self.changeset.push_head(&mut self.slab, slot);
        }
    }

    /// Removes every page from the changeset list and returns their slots.
    pub fn take_changeset(&mut self) -> Vec<u32> {
        let slots = self.changeset.slots(&self.slab);
        let mut list = std::mem::replace(&mut self.changeset, PageCollection::new(ListRole::Changeset));
        list.drain(&mut self.slab, |_, _| {});
        self.changeset = list;
        slots
    }

    pub fn changeset_len(&self) -> usize {
        self.changeset.len()
    }

    pub fn resident_pages(&self) -> usize {
        self.totallist.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.totallist.len() as u64 * self.page_size as u64
    }

    pub fn is_over_capacity(&self) -> bool {
        self.resident_bytes() > self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Evicts pages from the LRU tail until residency is back under
    /// capacity, removing at least [`PURGE_AT_LEAST`] pages per call when
    /// that many are evictable. Pinned pages and changeset members are
    /// skipped. Dirty evictees are handed to `write_back` first.
    pub fn purge<F>(&mut self, mut write_back: F) -> Result<usize>
    where
        F: FnMut(&Page) -> Result<()>,
    {
        if self.capacity_bytes == u64::MAX || !self.is_over_capacity() {
            return Ok(0);
        }

        let over = self.resident_bytes().saturating_sub(self.capacity_bytes);
        let over_pages = over.div_ceil(self.page_size as u64) as usize;
        let target = over_pages.max(PURGE_AT_LEAST);

        let mut evicted = 0;
        let mut cursor = self.totallist.tail();
        while let Some(slot) = cursor {
            if evicted >= target {
                break;
            }
            let prev = self.totallist.prev(&self.slab, slot);
            let page = self.page(slot);
            if page.is_pinned() || self.changeset.contains(&self.slab, slot) {
                cursor = prev;
                continue;
            }
            if page.is_dirty() {
                write_back(page)?;
            }
            let page = self.remove(slot);
            trace!(page_id = page.id(), "purged page");
            evicted += 1;
            cursor = prev;
        }
        Ok(evicted)
    }

    /// Page ids in recency order, MRU first.
    #[cfg(test)]
    pub fn lru_order(&self) -> Vec<u64> {
        self.totallist
            .slots(&self.slab)
            .into_iter()
            .map(|slot| self.page(slot).id())
            .collect()
    }

    /// Internal consistency: the total list and the union of the buckets
    /// must contain exactly the same pages.
    #[cfg(test)]
    pub fn check_integrity(&self) {
        let total: std::collections::BTreeSet<u32> =
            self.totallist.slots(&self.slab).into_iter().collect();
        let mut bucketed = std::collections::BTreeSet::new();
        for bucket in &self.buckets {
            for slot in bucket.slots(&self.slab) {
                assert!(bucketed.insert(slot), "page on two buckets");
            }
        }
        assert_eq!(total, bucketed, "total list and buckets diverge");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: usize = 256;

    fn cache(capacity_pages: u64) -> CacheState {
        CacheState::new(PS, Some(capacity_pages * PS as u64))
    }

    #[test]
    fn lookup_hit_and_miss_counting() {
        let mut cache = cache(16);
        cache.insert(Page::new(7, PS));

        assert!(cache.lookup(7).is_some());
        assert!(cache.lookup(8).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn lookup_moves_page_to_mru() {
        let mut cache = cache(16);
        cache.insert(Page::new(1, PS));
        cache.insert(Page::new(2, PS));
        assert_eq!(cache.lru_order(), vec![2, 1]);

        cache.lookup(1);
        assert_eq!(cache.lru_order(), vec![1, 2]);
        cache.check_integrity();
    }

    #[test]
    fn bucket_collisions_resolve_linearly() {
        let mut cache = cache(16);
        let id_a = 3;
        let id_b = 3 + CACHE_BUCKETS as u64; // same bucket
        cache.insert(Page::new(id_a, PS));
        cache.insert(Page::new(id_b, PS));

        assert_eq!(cache.page(cache.peek(id_a).unwrap()).id(), id_a);
        assert_eq!(cache.page(cache.peek(id_b).unwrap()).id(), id_b);
        cache.check_integrity();
    }

    #[test]
    fn remove_releases_slot_for_reuse() {
        let mut cache = cache(16);
        let slot = cache.insert(Page::new(1, PS));
        cache.remove(slot);

        let slot2 = cache.insert(Page::new(2, PS));
        assert_eq!(slot, slot2);
        assert!(cache.peek(1).is_none());
        cache.check_integrity();
    }

    #[test]
    fn purge_obeys_capacity_and_minimum() {
        let mut cache = cache(4);
        for id in 1..=40u64 {
            cache.insert(Page::new(id, PS));
        }
        assert!(cache.is_over_capacity());

        let evicted = cache.purge(|_| Ok(())).unwrap();
        assert!(evicted >= PURGE_AT_LEAST);
        assert!(cache.resident_pages() <= 40 - PURGE_AT_LEAST);
        cache.check_integrity();
    }

    #[test]
    fn purge_skips_pinned_and_changeset_pages() {
        let mut cache = cache(1);
        let pinned = cache.insert(Page::new(1, PS));
        cache.page_mut(pinned).pin();
        let in_changeset = cache.insert(Page::new(2, PS));
        cache.mark_changeset(in_changeset);
        for id in 3..=30u64 {
            cache.insert(Page::new(id, PS));
        }

        cache.purge(|_| Ok(())).unwrap();

        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_some());
        cache.check_integrity();
    }

    #[test]
    fn purge_evicts_from_lru_tail() {
        let mut cache = cache(1);
        for id in 1..=25u64 {
            cache.insert(Page::new(id, PS));
        }
        // touch the oldest page so it survives
        cache.lookup(1);

        cache.purge(|_| Ok(())).unwrap();

        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_none());
    }

    #[test]
    fn unlimited_mode_never_purges() {
        let mut cache = CacheState::new(PS, None);
        for id in 1..=100u64 {
            cache.insert(Page::new(id, PS));
        }
        assert_eq!(cache.purge(|_| Ok(())).unwrap(), 0);
        assert_eq!(cache.resident_pages(), 100);
    }

    #[test]
    fn purge_writes_back_dirty_pages() {
        let mut cache = cache(1);
        for id in 1..=25u64 {
            let slot = cache.insert(Page::new(id, PS));
            cache.page_mut(slot).set_dirty(true);
        }

        let mut written = Vec::new();
        cache
            .purge(|page| {
                written.push(page.id());
                Ok(())
            })
            .unwrap();
        assert!(!written.is_empty());
    }

    #[test]
    fn changeset_take_clears_membership() {
        let mut cache = cache(16);
        let a = cache.insert(Page::new(1, PS));
        let b = cache.insert(Page::new(2, PS));
        cache.mark_changeset(a);
        cache.mark_changeset(b);
        cache.mark_changeset(a); // idempotent

        let slots = cache.take_changeset();
        assert_eq!(slots.len(), 2);
        assert_eq!(cache.changeset_len(), 0);
        // pages stay resident
        assert!(cache.peek(1).is_some());
        assert!(cache.peek(2).is_some());
    }
}
