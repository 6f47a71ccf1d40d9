//! Memory-mapped single-file storage.
//!
//! The engine keeps its whole state in one file of fixed-size pages. The
//! file is memory-mapped; all page access is copy-in/copy-out against the
//! cache's own buffers, so mapped slices never escape this module and a
//! remap during `grow()` cannot invalidate an outstanding reference.
//!
//! Blob storage reads and writes raw byte ranges through the same mapping
//! (blobs bypass the page cache).

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct DiskFile {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u64,
}

impl DiskFile {
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize, initial_pages: u64) -> Result<Self> {
        if initial_pages == 0 {
            return Err(Error::InvParameter("initial_pages"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.set_len(initial_pages * page_size as u64)?;

        // SAFETY: the file was just created with exclusive read+write access
        // and sized to a whole number of pages. The mapping's lifetime is
        // tied to this struct and every access below is bounds-checked.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: initial_pages,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let file_size = file.metadata()?.len();
        if file_size == 0 {
            return Err(Error::Corrupt("empty database file".into()));
        }
        if file_size % page_size as u64 != 0 {
            return Err(Error::Corrupt(format!(
                "file size {file_size} is not a multiple of page size {page_size}"
            )));
        }

        // SAFETY: same argument as in `create`; database files are not
        // shared with external writers while the environment holds them.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: file_size / page_size as u64,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    fn page_range(&self, page_id: u64) -> Result<std::ops::Range<usize>> {
        if page_id >= self.page_count {
            return Err(Error::Corrupt(format!(
                "page {page_id} out of bounds (page_count={})",
                self.page_count
            )));
        }
        let offset = page_id as usize * self.page_size;
        Ok(offset..offset + self.page_size)
    }

    /// Copies a page's bytes into `buf`. `buf.len()` must equal the page size.
    pub fn read_page(&self, page_id: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let range = self.page_range(page_id)?;
        buf.copy_from_slice(&self.mmap[range]);
        Ok(())
    }

    /// Writes a page's bytes from `buf`, growing the file if needed.
    pub fn write_page(&mut self, page_id: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if page_id >= self.page_count {
            self.grow(page_id + 1)?;
        }
        let range = self.page_range(page_id)?;
        self.mmap[range].copy_from_slice(buf);
        Ok(())
    }

    /// Reads an arbitrary byte range (blob access).
    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.page_count * self.page_size as u64 {
            return Err(Error::Corrupt(format!(
                "byte range {offset}..{end} out of bounds"
            )));
        }
        buf.copy_from_slice(&self.mmap[offset as usize..end as usize]);
        Ok(())
    }

    /// Writes an arbitrary byte range (blob access). The range must lie
    /// within already-allocated pages.
    pub fn write_bytes(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        if end > self.page_count * self.page_size as u64 {
            return Err(Error::Corrupt(format!(
                "byte range {offset}..{end} out of bounds"
            )));
        }
        self.mmap[offset as usize..end as usize].copy_from_slice(buf);
        Ok(())
    }

    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap.flush_async()?;
        self.file.set_len(new_page_count * self.page_size as u64)?;

        // SAFETY: no slices of the old mapping escape this module, so
        // dropping it on reassignment cannot invalidate live references.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PS: usize = 4096;

    #[test]
    fn create_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut disk = DiskFile::create(dir.path().join("t.db"), PS, 2).unwrap();

        let mut page = vec![0u8; PS];
        page[0] = 0xAB;
        page[PS - 1] = 0xCD;
        disk.write_page(1, &page).unwrap();

        let mut out = vec![0u8; PS];
        disk.read_page(1, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn write_past_end_grows_file() {
        let dir = tempdir().unwrap();
        let mut disk = DiskFile::create(dir.path().join("t.db"), PS, 1).unwrap();

        let page = vec![7u8; PS];
        disk.write_page(5, &page).unwrap();
        assert_eq!(disk.page_count(), 6);

        let mut out = vec![0u8; PS];
        disk.read_page(5, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn read_out_of_bounds_fails() {
        let dir = tempdir().unwrap();
        let disk = DiskFile::create(dir.path().join("t.db"), PS, 1).unwrap();

        let mut out = vec![0u8; PS];
        assert!(disk.read_page(3, &mut out).is_err());
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");

        {
            let mut disk = DiskFile::create(&path, PS, 2).unwrap();
            disk.write_page(1, &vec![0x42u8; PS]).unwrap();
            disk.sync().unwrap();
        }

        let disk = DiskFile::open(&path, PS).unwrap();
        assert_eq!(disk.page_count(), 2);
        let mut out = vec![0u8; PS];
        disk.read_page(1, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        std::fs::write(&path, [0u8; 100]).unwrap();

        assert!(matches!(DiskFile::open(&path, PS), Err(Error::Corrupt(_))));
    }

    #[test]
    fn byte_range_access() {
        let dir = tempdir().unwrap();
        let mut disk = DiskFile::create(dir.path().join("t.db"), PS, 2).unwrap();

        disk.write_bytes(PS as u64 + 10, b"blobbytes").unwrap();
        let mut out = [0u8; 9];
        disk.read_bytes(PS as u64 + 10, &mut out).unwrap();
        assert_eq!(&out, b"blobbytes");
    }
}
