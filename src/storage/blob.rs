//! Blob storage.
//!
//! Records too large for an inline slot and extended keys live in blob
//! spans: one or more contiguous pages holding a small persisted header
//! followed by the payload. A blob id is the byte offset of its header in
//! the file. Blobs bypass the page cache: they are written once, read by
//! copy, and freed page-wise.

use std::sync::Arc;

use parking_lot::Mutex;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::pager::FileState;
use crate::error::{Error, Result};

const BLOB_MAGIC: [u8; 4] = *b"blob";

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlobHeader {
    magic: [u8; 4],
    reserved: [u8; 4],
    size: U64,
}

const BLOB_HEADER_SIZE: usize = std::mem::size_of::<BlobHeader>();

const _: () = assert!(BLOB_HEADER_SIZE == 16);

#[derive(Clone)]
pub struct BlobStore {
    file: Arc<Mutex<FileState>>,
    page_size: usize,
}

impl BlobStore {
    pub(crate) fn new(file: Arc<Mutex<FileState>>, page_size: usize) -> Self {
        Self { file, page_size }
    }

    /// Stores `bytes` and returns the blob id.
    pub fn put(&self, bytes: &[u8]) -> Result<u64> {
        let total = BLOB_HEADER_SIZE + bytes.len();
        let pages = (total as u64).div_ceil(self.page_size as u64);

        let mut file = self.file.lock();
        let first_page = file.alloc_span(pages);
        file.disk.grow(first_page + pages)?;

        let offset = first_page * self.page_size as u64;
        let header = BlobHeader {
            magic: BLOB_MAGIC,
            reserved: [0; 4],
            size: U64::new(bytes.len() as u64),
        };
        file.disk.write_bytes(offset, header.as_bytes())?;
        file.disk
            .write_bytes(offset + BLOB_HEADER_SIZE as u64, bytes)?;

        Ok(offset)
    }

    /// Reads a blob's payload.
    pub fn get(&self, blob_id: u64) -> Result<Vec<u8>> {
        let file = self.file.lock();

        let mut header_bytes = [0u8; BLOB_HEADER_SIZE];
        file.disk.read_bytes(blob_id, &mut header_bytes)?;
        let header = BlobHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| Error::Corrupt(format!("bad blob header: {e:?}")))?;
        if header.magic != BLOB_MAGIC {
            return Err(Error::Corrupt(format!("no blob at offset {blob_id}")));
        }

        let mut payload = vec![0u8; header.size.get() as usize];
        file.disk
            .read_bytes(blob_id + BLOB_HEADER_SIZE as u64, &mut payload)?;
        Ok(payload)
    }

    /// Payload size without reading the payload.
    pub fn size(&self, blob_id: u64) -> Result<u64> {
        let file = self.file.lock();
        let mut header_bytes = [0u8; BLOB_HEADER_SIZE];
        file.disk.read_bytes(blob_id, &mut header_bytes)?;
        let header = BlobHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| Error::Corrupt(format!("bad blob header: {e:?}")))?;
        if header.magic != BLOB_MAGIC {
            return Err(Error::Corrupt(format!("no blob at offset {blob_id}")));
        }
        Ok(header.size.get())
    }

    /// Releases a blob's pages back to the allocator.
    pub fn free(&self, blob_id: u64) -> Result<()> {
        let mut file = self.file.lock();

        let mut header_bytes = [0u8; BLOB_HEADER_SIZE];
        file.disk.read_bytes(blob_id, &mut header_bytes)?;
        let header = BlobHeader::ref_from_bytes(&header_bytes)
            .map_err(|e| Error::Corrupt(format!("bad blob header: {e:?}")))?;
        if header.magic != BLOB_MAGIC {
            return Err(Error::Corrupt(format!("no blob at offset {blob_id}")));
        }
        let total = BLOB_HEADER_SIZE as u64 + header.size.get();
        let pages = total.div_ceil(self.page_size as u64);

        // deface the magic so a dangling id fails loudly
        file.disk.write_bytes(blob_id, &[0u8; 4])?;

        let first_page = blob_id / self.page_size as u64;
        for page in first_page..first_page + pages {
            file.free_page(page);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Pager;
    use tempfile::tempdir;

    const PS: usize = 4096;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(dir.path().join("t.db"), PS, None).unwrap();
        let store = BlobStore::new(pager.file(), PS);
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = store();
        let id = store.put(b"some record payload").unwrap();
        assert_eq!(store.get(id).unwrap(), b"some record payload");
        assert_eq!(store.size(id).unwrap(), 19);
    }

    #[test]
    fn blob_spanning_multiple_pages() {
        let (_dir, store) = store();
        let big: Vec<u8> = (0..3 * PS).map(|i| (i % 251) as u8).collect();
        let id = store.put(&big).unwrap();
        assert_eq!(store.get(id).unwrap(), big);
    }

    #[test]
    fn distinct_blobs_do_not_overlap() {
        let (_dir, store) = store();
        let a = store.put(&vec![1u8; 100]).unwrap();
        let b = store.put(&vec![2u8; 100]).unwrap();
        assert_ne!(a, b);
        assert!(store.get(a).unwrap().iter().all(|&x| x == 1));
        assert!(store.get(b).unwrap().iter().all(|&x| x == 2));
    }

    #[test]
    fn freed_blob_is_unreadable() {
        let (_dir, store) = store();
        let id = store.put(b"temporary").unwrap();
        store.free(id).unwrap();
        assert!(store.get(id).is_err());
    }

    #[test]
    fn empty_blob() {
        let (_dir, store) = store();
        let id = store.put(b"").unwrap();
        assert_eq!(store.get(id).unwrap(), Vec::<u8>::new());
    }
}
