//! File header page.
//!
//! Page 0 carries the environment header in its payload: magic, format
//! version, page size, allocation and transaction counters, and a fixed
//! directory of database entries. All fields little-endian.

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{KeyKind, RecordKind, DbConfig, MAX_DATABASES, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::error::{Error, Result};

pub const FILE_MAGIC: &[u8; 16] = b"burrowdb file\x00\x00\x00";
pub const FORMAT_VERSION: u32 = 1;

const DB_IN_USE: u32 = 1 << 0;
const DB_RECNO: u32 = 1 << 1;
const DB_FIXED_KEY: u32 = 1 << 2;
const DB_FIXED_RECORD: u32 = 1 << 3;

/// One database directory slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DbDirEntry {
    db_id: U32,
    flags: U32,
    key_size: U32,
    record_size: U32,
    root_page: U64,
    recno_next: U64,
}

const _: () = assert!(std::mem::size_of::<DbDirEntry>() == 32);

impl DbDirEntry {
    pub fn vacant() -> Self {
        Self {
            db_id: U32::new(0),
            flags: U32::new(0),
            key_size: U32::new(0),
            record_size: U32::new(0),
            root_page: U64::new(0),
            recno_next: U64::new(0),
        }
    }

    pub fn occupy(&mut self, db_id: u32, config: &DbConfig, root_page: u64) {
        let mut flags = DB_IN_USE;
        let mut key_size = 0u32;
        match config.keys {
            KeyKind::Fixed(size) => {
                flags |= DB_FIXED_KEY;
                key_size = size as u32;
            }
            KeyKind::Recno => {
                flags |= DB_RECNO | DB_FIXED_KEY;
                key_size = 8;
            }
            KeyKind::Variable => {}
        }
        let mut record_size = 0u32;
        if let RecordKind::Fixed(size) = config.records {
            flags |= DB_FIXED_RECORD;
            record_size = size;
        }
        self.db_id = U32::new(db_id);
        self.flags = U32::new(flags);
        self.key_size = U32::new(key_size);
        self.record_size = U32::new(record_size);
        self.root_page = U64::new(root_page);
        self.recno_next = U64::new(1);
    }

    pub fn clear(&mut self) {
        *self = Self::vacant();
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.get() & DB_IN_USE != 0
    }

    pub fn db_id(&self) -> u32 {
        self.db_id.get()
    }

    pub fn config(&self) -> DbConfig {
        let flags = self.flags.get();
        let keys = if flags & DB_RECNO != 0 {
            KeyKind::Recno
        } else if flags & DB_FIXED_KEY != 0 {
            KeyKind::Fixed(self.key_size.get() as u16)
        } else {
            KeyKind::Variable
        };
        let records = if flags & DB_FIXED_RECORD != 0 {
            RecordKind::Fixed(self.record_size.get())
        } else {
            RecordKind::Variable
        };
        DbConfig { keys, records }
    }

    pub fn root_page(&self) -> u64 {
        self.root_page.get()
    }

    pub fn set_root_page(&mut self, page: u64) {
        self.root_page = U64::new(page);
    }

    pub fn recno_next(&self) -> u64 {
        self.recno_next.get()
    }

    pub fn set_recno_next(&mut self, next: u64) {
        self.recno_next = U64::new(next);
    }
}

/// Environment header, stored in page 0's payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    page_size: U32,
    next_page_id: U64,
    next_txn_id: U64,
    db_count: U32,
    reserved: [u8; 28],
    directory: [DbDirEntry; MAX_DATABASES],
}

pub const FILE_HEADER_SIZE: usize = std::mem::size_of::<FileHeader>();

const _: () = assert!(FILE_HEADER_SIZE == 72 + MAX_DATABASES * 32);
const _: () = assert!(FILE_HEADER_SIZE <= MIN_PAGE_SIZE - PAGE_HEADER_SIZE);

impl FileHeader {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            page_size: U32::new(page_size),
            // page 0 is the header page itself
            next_page_id: U64::new(1),
            next_txn_id: U64::new(1),
            db_count: U32::new(0),
            reserved: [0; 28],
            directory: [DbDirEntry::vacant(); MAX_DATABASES],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::Corrupt("page too small for file header".into()));
        }
        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| Error::Corrupt(format!("bad file header: {e:?}")))?;
        if &header.magic != FILE_MAGIC {
            return Err(Error::Corrupt("bad magic".into()));
        }
        if header.version.get() != FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported format version {}",
                header.version.get()
            )));
        }
        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::Corrupt("page too small for file header".into()));
        }
        let header = Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| Error::Corrupt(format!("bad file header: {e:?}")))?;
        if &header.magic != FILE_MAGIC {
            return Err(Error::Corrupt("bad magic".into()));
        }
        Ok(header)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn next_page_id(&self) -> u64 {
        self.next_page_id.get()
    }

    pub fn set_next_page_id(&mut self, id: u64) {
        self.next_page_id = U64::new(id);
    }

    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.get()
    }

    pub fn set_next_txn_id(&mut self, id: u64) {
        self.next_txn_id = U64::new(id);
    }

    pub fn entry(&self, db_id: u32) -> Option<&DbDirEntry> {
        self.directory
            .iter()
            .find(|entry| entry.is_in_use() && entry.db_id() == db_id)
    }

    pub fn entry_mut(&mut self, db_id: u32) -> Option<&mut DbDirEntry> {
        self.directory
            .iter_mut()
            .find(|entry| entry.is_in_use() && entry.db_id() == db_id)
    }

    pub fn allocate_entry(&mut self, db_id: u32) -> Result<&mut DbDirEntry> {
        if db_id == 0 {
            return Err(Error::InvParameter("db_id"));
        }
        if self.entry(db_id).is_some() {
            return Err(Error::InvParameter("db_id already exists"));
        }
        let slot = self
            .directory
            .iter_mut()
            .find(|entry| !entry.is_in_use())
            .ok_or(Error::InvParameter("database directory full"))?;
        self.db_count = U32::new(self.db_count.get() + 1);
        Ok(slot)
    }

    pub fn database_ids(&self) -> Vec<u32> {
        self.directory
            .iter()
            .filter(|entry| entry.is_in_use())
            .map(|entry| entry.db_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PAGE_SIZE;

    #[test]
    fn header_size_pins() {
        assert_eq!(std::mem::size_of::<DbDirEntry>(), 32);
        assert_eq!(FILE_HEADER_SIZE, 72 + MAX_DATABASES * 32);
    }

    #[test]
    fn roundtrip_with_directory() {
        let mut header = FileHeader::new(DEFAULT_PAGE_SIZE as u32);
        header.set_next_page_id(17);
        header.set_next_txn_id(5);
        {
            let entry = header.allocate_entry(3).unwrap();
            entry.occupy(3, &DbConfig::recno(), 12);
        }

        let bytes = header.as_bytes().to_vec();
        let parsed = FileHeader::from_bytes(&bytes).unwrap();

        assert_eq!(parsed.page_size(), DEFAULT_PAGE_SIZE as u32);
        assert_eq!(parsed.next_page_id(), 17);
        assert_eq!(parsed.next_txn_id(), 5);
        let entry = parsed.entry(3).unwrap();
        assert_eq!(entry.root_page(), 12);
        assert_eq!(entry.recno_next(), 1);
        assert_eq!(entry.config().keys, KeyKind::Recno);
    }

    #[test]
    fn duplicate_db_id_rejected() {
        let mut header = FileHeader::new(DEFAULT_PAGE_SIZE as u32);
        header.allocate_entry(1).unwrap().occupy(1, &DbConfig::default(), 2);
        assert!(header.allocate_entry(1).is_err());
    }

    #[test]
    fn directory_fills_up() {
        let mut header = FileHeader::new(DEFAULT_PAGE_SIZE as u32);
        for id in 1..=MAX_DATABASES as u32 {
            header
                .allocate_entry(id)
                .unwrap()
                .occupy(id, &DbConfig::default(), id as u64 + 1);
        }
        assert!(header.allocate_entry(99).is_err());
        assert_eq!(header.database_ids().len(), MAX_DATABASES);
    }

    #[test]
    fn bad_magic_rejected() {
        let bytes = vec![0u8; FILE_HEADER_SIZE];
        assert!(matches!(
            FileHeader::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn fixed_config_roundtrip() {
        let mut entry = DbDirEntry::vacant();
        entry.occupy(7, &DbConfig::fixed(16, 32), 3);
        let config = entry.config();
        assert_eq!(config.keys, KeyKind::Fixed(16));
        assert_eq!(config.records, RecordKind::Fixed(32));
    }
}
