//! Pager: the cache-fronted view of the database file.
//!
//! All page access funnels through [`Pager::with_page`] /
//! [`Pager::with_page_mut`]; the closure style keeps page borrows scoped to
//! one cache-lock acquisition and lets the pager mark dirty pages and
//! changeset membership on the way out. Structural operations that touch
//! two nodes at once use [`Pager::with_page_pair_mut`] (split borrow on the
//! cache slab).
//!
//! Lock order is cache, then file. The blob store takes the file lock only.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::cache::CacheState;
use super::disk::DiskFile;
use super::page::Page;
use crate::error::{Error, Result};

/// The file plus its allocation state. Shared between the pager and the
/// blob store.
#[derive(Debug)]
pub(crate) struct FileState {
    pub disk: DiskFile,
    /// Bump allocator frontier; page ids below it are either live or on
    /// the free list.
    pub next_page_id: u64,
    /// Freed single pages awaiting reuse.
    pub free_pages: Vec<u64>,
}

impl FileState {
    pub fn alloc_page(&mut self) -> u64 {
        if let Some(id) = self.free_pages.pop() {
            return id;
        }
        let id = self.next_page_id;
        self.next_page_id += 1;
        id
    }

    /// Allocates `count` contiguous pages (blob spans). Always carves from
    /// the frontier; the free list holds only single pages.
    pub fn alloc_span(&mut self, count: u64) -> u64 {
        let first = self.next_page_id;
        self.next_page_id += count;
        first
    }

    pub fn free_page(&mut self, id: u64) {
        debug_assert!(id != 0, "header page cannot be freed");
        self.free_pages.push(id);
    }
}

pub struct Pager {
    page_size: usize,
    cache: Mutex<CacheState>,
    file: Arc<Mutex<FileState>>,
}

impl Pager {
    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cache_capacity: Option<u64>,
    ) -> Result<Self> {
        let disk = DiskFile::create(path, page_size, 1)?;
        Ok(Self {
            page_size,
            cache: Mutex::new(CacheState::new(page_size, cache_capacity)),
            file: Arc::new(Mutex::new(FileState {
                disk,
                next_page_id: 1,
                free_pages: Vec::new(),
            })),
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cache_capacity: Option<u64>,
        next_page_id: u64,
    ) -> Result<Self> {
        let disk = DiskFile::open(path, page_size)?;
        Ok(Self {
            page_size,
            cache: Mutex::new(CacheState::new(page_size, cache_capacity)),
            file: Arc::new(Mutex::new(FileState {
                disk,
                next_page_id,
                free_pages: Vec::new(),
            })),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn file(&self) -> Arc<Mutex<FileState>> {
        Arc::clone(&self.file)
    }

    pub fn next_page_id(&self) -> u64 {
        self.file.lock().next_page_id
    }

    /// Makes `page_id` resident and returns its slot. Caller holds the
    /// cache lock. The returned slot is pinned; the caller must unpin.
    fn fetch_pinned(&self, cache: &mut CacheState, page_id: u64) -> Result<u32> {
        if let Some(slot) = cache.lookup(page_id) {
            cache.page_mut(slot).pin();
            return Ok(slot);
        }

        let mut page = Page::new(page_id, self.page_size);
        {
            let file = self.file.lock();
            file.disk.read_page(page_id, page.data_mut())?;
        }
        let slot = cache.insert(page);
        cache.page_mut(slot).pin();

        if cache.is_over_capacity() {
            let file = &self.file;
            cache.purge(|page| {
                let mut file = file.lock();
                file.disk.write_page(page.id(), page.data())
            })?;
        }

        Ok(slot)
    }

    /// Read access to one page.
    pub fn with_page<R>(&self, page_id: u64, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let mut cache = self.cache.lock();
        let slot = self.fetch_pinned(&mut cache, page_id)?;
        let result = f(cache.page(slot).data());
        cache.page_mut(slot).unpin();
        result
    }

    /// Write access to one page. Marks the page dirty and a member of the
    /// current changeset.
    pub fn with_page_mut<R>(
        &self,
        page_id: u64,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let mut cache = self.cache.lock();
        let slot = self.fetch_pinned(&mut cache, page_id)?;
        let result = f(cache.page_mut(slot).data_mut());
        {
            let page = cache.page_mut(slot);
            page.set_dirty(true);
            page.unpin();
        }
        cache.mark_changeset(slot);
        result
    }

    /// Write access to two distinct pages at once (splits, merges, sibling
    /// borrowing). Both pages join the changeset.
    pub fn with_page_pair_mut<R>(
        &self,
        a: u64,
        b: u64,
        f: impl FnOnce(&mut [u8], &mut [u8]) -> Result<R>,
    ) -> Result<R> {
        if a == b {
            return Err(Error::InvParameter("page pair must be distinct"));
        }
        let mut cache = self.cache.lock();
        let slot_a = self.fetch_pinned(&mut cache, a)?;
        let slot_b = match self.fetch_pinned(&mut cache, b) {
            Ok(slot) => slot,
            Err(e) => {
                cache.page_mut(slot_a).unpin();
                return Err(e);
            }
        };

        let result = {
            let (page_a, page_b) = cache.page_pair_mut(slot_a, slot_b);
            f(page_a.data_mut(), page_b.data_mut())
        };

        for slot in [slot_a, slot_b] {
            let page = cache.page_mut(slot);
            page.set_dirty(true);
            page.unpin();
            cache.mark_changeset(slot);
        }
        result
    }

    /// Allocates a page and makes it resident, zeroed, dirty, and part of
    /// the changeset.
    pub fn alloc(&self) -> Result<u64> {
        let page_id = self.file.lock().alloc_page();

        let mut cache = self.cache.lock();
        // a freed page may still be resident under its old identity
        if let Some(slot) = cache.peek(page_id) {
            cache.remove(slot);
        }
        let slot = cache.insert(Page::new(page_id, self.page_size));
        {
            let page = cache.page_mut(slot);
            page.set_dirty(true);
            page.pin();
        }
        cache.mark_changeset(slot);

        if cache.is_over_capacity() {
            let file = &self.file;
            cache.purge(|page| {
                let mut file = file.lock();
                file.disk.write_page(page.id(), page.data())
            })?;
        }
        cache.page_mut(slot).unpin();

        Ok(page_id)
    }

    /// Returns a page to the allocator and drops it from the cache.
    pub fn free(&self, page_id: u64) {
        let mut cache = self.cache.lock();
        if let Some(slot) = cache.peek(page_id) {
            cache.remove(slot);
        }
        drop(cache);
        self.file.lock().free_page(page_id);
    }

    /// Pins a page against purging (cursor reference).
    pub fn pin(&self, page_id: u64) -> Result<()> {
        let mut cache = self.cache.lock();
        let slot = self.fetch_pinned(&mut cache, page_id)?;
        // fetch_pinned already took the cursor's pin
        let _ = slot;
        Ok(())
    }

    pub fn unpin(&self, page_id: u64) {
        let mut cache = self.cache.lock();
        if let Some(slot) = cache.peek(page_id) {
            cache.page_mut(slot).unpin();
        }
    }

    /// Writes every changeset page to the file, clears dirty marks and the
    /// changeset list, then syncs. This is the crash-atomicity unit: a
    /// structural operation's pages all reach the file together.
    pub fn flush_changeset(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let slots = cache.take_changeset();
        if slots.is_empty() {
            return Ok(());
        }
        debug!(pages = slots.len(), "flushing changeset");

        let mut file = self.file.lock();
        for slot in &slots {
            let page = cache.page(*slot);
            if page.is_dirty() {
                file.disk.write_page(page.id(), page.data())?;
            }
        }
        for slot in slots {
            cache.page_mut(slot).set_dirty(false);
        }
        file.disk.sync()?;
        drop(file);

        if cache.is_over_capacity() {
            let file = &self.file;
            cache.purge(|page| {
                let mut file = file.lock();
                file.disk.write_page(page.id(), page.data())
            })?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.flush_changeset()?;
        self.file.lock().disk.sync()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache.lock().hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache.lock().misses()
    }

    pub fn resident_pages(&self) -> usize {
        self.cache.lock().resident_pages()
    }
}
