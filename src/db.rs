//! Database operations through the transactional overlay.
//!
//! All reads and writes act on the merged view: the B-tree base state
//! plus the acting transaction's uncommitted ops plus every
//! committed-but-unflushed op. Writes never touch the B-tree directly;
//! they append ops to the database's op tree; the flush pass promotes
//! them after commit.

use std::sync::Arc;

use crate::btree::MatchMode;
use crate::config::{KeyKind, RecordKind};
use crate::cursor::{merged_find, merged_move, Cursor};
use crate::env::{EnvShared, Transaction};
use crate::error::{Error, Result};
use crate::txn::optree::OpKind;
use crate::txn::{TxnId, TxnState};

/// Duplicate placement modes. Parsed at the surface; duplicate keys are
/// not implemented in the op chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupPosition {
    Default,
    Before,
    After,
    First,
    Last,
}

/// Insert behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// Fail with `DuplicateKey` on an existing key.
    Insert,
    /// Replace the record of an existing key.
    Overwrite,
    /// Insert a duplicate at the given position (not implemented).
    Duplicate(DupPosition),
}

/// Handle to one database in an environment.
pub struct Database {
    shared: Arc<EnvShared>,
    id: u32,
}

impl Database {
    pub(crate) fn new(shared: Arc<EnvShared>, id: u32) -> Self {
        Self { shared, id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Inserts `(key, record)` under `txn`.
    pub fn insert(
        &self,
        txn: &Transaction,
        key: &[u8],
        record: &[u8],
        mode: InsertMode,
    ) -> Result<()> {
        let overwrite = match mode {
            InsertMode::Insert => false,
            InsertMode::Overwrite => true,
            InsertMode::Duplicate(_) => {
                return Err(Error::NotImplemented("duplicate keys"));
            }
        };
        self.shared
            .db_insert(self.id, txn.id(), key, record, overwrite)
    }

    /// Appends a record to a record-number database, returning the
    /// assigned number.
    pub fn append(&self, txn: &Transaction, record: &[u8]) -> Result<u64> {
        self.shared.db_append(self.id, txn.id(), record)
    }

    /// Erases `key` under `txn`.
    pub fn erase(&self, txn: &Transaction, key: &[u8]) -> Result<()> {
        self.shared.db_erase(self.id, txn.id(), key)
    }

    /// Finds the record for `key` in the merged view.
    pub fn find(&self, txn: &Transaction, key: &[u8], mode: MatchMode) -> Result<Vec<u8>> {
        self.find_entry(txn, key, mode).map(|(_, record)| record)
    }

    /// Finds `(key, record)` in the merged view; for approximate modes
    /// the returned key is the matched neighbor.
    pub fn find_entry(
        &self,
        txn: &Transaction,
        key: &[u8],
        mode: MatchMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.shared.db_find(self.id, txn.id(), key, mode)
    }

    /// Number of distinct visible keys in the merged view.
    pub fn key_count(&self, txn: &Transaction) -> Result<u64> {
        self.shared.db_key_count(self.id, txn.id())
    }

    /// Opens a cursor over the merged view.
    pub fn cursor(&self, txn: &Transaction) -> Result<Cursor> {
        let id = self.shared.open_cursor(self.id, txn.id())?;
        Ok(Cursor::new(Arc::clone(txn.shared()), id))
    }
}

impl EnvShared {
    fn check_writable(&self, txn_id: TxnId) -> Result<()> {
        let state = self.state.lock();
        let txn = state.txns.get(txn_id)?;
        if txn.state != TxnState::Active {
            return Err(Error::InvParameter("transaction is not active"));
        }
        if txn.read_only {
            return Err(Error::InvParameter("read-only transaction"));
        }
        Ok(())
    }

    fn validate_key_record(
        &self,
        db_id: u32,
        key: &[u8],
        record: Option<&[u8]>,
    ) -> Result<()> {
        let state = self.state.lock();
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;
        match db.config.keys {
            KeyKind::Fixed(size) => {
                if key.len() != size as usize {
                    return Err(Error::InvParameter("key length"));
                }
            }
            KeyKind::Recno => {
                if key.len() != 8 {
                    return Err(Error::InvParameter("key length"));
                }
            }
            KeyKind::Variable => {
                if key.len() > u16::MAX as usize {
                    return Err(Error::InvParameter("key too long"));
                }
            }
        }
        if let (Some(record), RecordKind::Fixed(size)) = (record, db.config.records) {
            if record.len() != size as usize {
                return Err(Error::InvParameter("record length"));
            }
        }
        Ok(())
    }

    pub(crate) fn db_insert(
        &self,
        db_id: u32,
        txn_id: TxnId,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        self.check_writable(txn_id)?;
        self.validate_key_record(db_id, key, Some(record))?;

        let mut state = self.state.lock();
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        let exists = merged_find(self, &state, db, txn_id, key, MatchMode::Exact)?.is_some();
        if exists && !overwrite {
            return Err(Error::DuplicateKey);
        }

        let kind = if overwrite {
            OpKind::InsertOw
        } else {
            OpKind::Insert
        };
        let db = state
            .databases
            .get_mut(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;
        db.optree.append_op(key, txn_id, kind, record.to_vec());
        state.txns.get_mut(txn_id)?.ops.push((db_id, key.to_vec()));
        Ok(())
    }

    pub(crate) fn db_append(&self, db_id: u32, txn_id: TxnId, record: &[u8]) -> Result<u64> {
        self.check_writable(txn_id)?;

        let mut state = self.state.lock();
        let db = state
            .databases
            .get_mut(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;
        if db.config.keys != KeyKind::Recno {
            return Err(Error::InvParameter("not a record-number database"));
        }

        let recno = db.recno_next;
        db.recno_next += 1;
        let key = recno.to_le_bytes();
        db.optree
            .append_op(&key, txn_id, OpKind::Insert, record.to_vec());
        state.txns.get_mut(txn_id)?.ops.push((db_id, key.to_vec()));
        Ok(recno)
    }

    pub(crate) fn db_erase(&self, db_id: u32, txn_id: TxnId, key: &[u8]) -> Result<()> {
        self.check_writable(txn_id)?;
        self.validate_key_record(db_id, key, None)?;

        let mut state = self.state.lock();
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        if merged_find(self, &state, db, txn_id, key, MatchMode::Exact)?.is_none() {
            return Err(Error::KeyNotFound);
        }

        let db = state
            .databases
            .get_mut(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;
        db.optree.append_op(key, txn_id, OpKind::Erase, Vec::new());
        state.txns.get_mut(txn_id)?.ops.push((db_id, key.to_vec()));
        Ok(())
    }

    pub(crate) fn db_find(
        &self,
        db_id: u32,
        txn_id: TxnId,
        key: &[u8],
        mode: MatchMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let state = self.state.lock();
        state.txns.get(txn_id)?;
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        match merged_find(self, &state, db, txn_id, key, mode)? {
            Some(hit) => Ok(hit.into_pair()),
            None => Err(Error::KeyNotFound),
        }
    }

    pub(crate) fn db_key_count(&self, db_id: u32, txn_id: TxnId) -> Result<u64> {
        let state = self.state.lock();
        state.txns.get(txn_id)?;
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        let mut count = 0u64;
        let mut anchor: Option<Vec<u8>> = None;
        loop {
            let hit = merged_move(self, &state, db, txn_id, anchor.as_deref(), true)?;
            match hit {
                Some(hit) => {
                    count += 1;
                    anchor = Some(hit.key().to_vec());
                }
                None => return Ok(count),
            }
        }
    }
}
