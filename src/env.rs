//! Environment: the single-file database container.
//!
//! An environment owns the file, the page cache, the blob store, the
//! transaction registry, and the database directory. Page 0 persists the
//! header (magic, version, page size, allocation and transaction
//! counters, and up to [`MAX_DATABASES`] directory entries).
//!
//! Commit marks a transaction COMMITTED and then promotes the committed
//! prefix of the environment transaction list into the B-tree; a
//! committed transaction behind a still-active one stays buffered in the
//! op trees until a later pass. Promoting an op uncouples every cursor
//! attached to it, leaving each a heap copy of its key.

use std::path::Path;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::btree::{Btree, BtreeCursor, Comparator};
use crate::config::{DbConfig, EnvConfig, KeyKind, MAX_DATABASES, MIN_PAGE_SIZE, PAGE_HEADER_SIZE};
use crate::cursor::{Cursor, CursorState};
use crate::error::{Error, Result};
use crate::storage::{
    BlobStore, DiskFile, FileHeader, Pager, PageType, PersistedPageHeader, FILE_HEADER_SIZE,
};
use crate::txn::optree::OpKind;
use crate::txn::{OpTree, TxnCursor, TxnId, TxnManager, TxnState};

pub(crate) fn comparator_for(config: &DbConfig) -> Comparator {
    match config.keys {
        KeyKind::Recno => Comparator::RecnoU64,
        _ => Comparator::Bytes,
    }
}

/// Per-database live state.
pub(crate) struct DbState {
    pub config: DbConfig,
    pub root: u64,
    pub recno_next: u64,
    pub optree: OpTree,
}

/// Mutable environment state behind the lock.
pub(crate) struct EnvState {
    pub next_txn_id: u64,
    pub databases: HashMap<u32, DbState>,
    pub txns: TxnManager,
    pub cursors: HashMap<u64, CursorState>,
    pub next_cursor_id: u64,
}

pub(crate) struct EnvShared {
    pub pager: Pager,
    pub blobs: BlobStore,
    pub page_size: usize,
    pub state: Mutex<EnvState>,
}

/// An open environment.
pub struct Env {
    shared: Arc<EnvShared>,
}

impl Env {
    /// Creates a new single-file environment.
    pub fn create<P: AsRef<Path>>(path: P, config: EnvConfig) -> Result<Self> {
        config.validate()?;
        let page_size = config.page_size;

        let pager = Pager::create(&path, page_size, config.cache_capacity)?;
        pager.with_page_mut(0, |data| {
            let header = PersistedPageHeader::new(PageType::Header, 0);
            data[..PAGE_HEADER_SIZE]
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
            let file_header = FileHeader::new(page_size as u32);
            data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + FILE_HEADER_SIZE]
                .copy_from_slice(zerocopy::IntoBytes::as_bytes(&file_header));
            Ok(())
        })?;
        pager.flush_changeset()?;

        let blobs = BlobStore::new(pager.file(), page_size);
        info!(path = %path.as_ref().display(), page_size, "created environment");

        Ok(Self {
            shared: Arc::new(EnvShared {
                pager,
                blobs,
                page_size,
                state: Mutex::new(EnvState {
                    next_txn_id: 1,
                    databases: HashMap::new(),
                    txns: TxnManager::new(),
                    cursors: HashMap::new(),
                    next_cursor_id: 1,
                }),
            }),
        })
    }

    /// Opens an existing environment. The page size is read from the file
    /// header; `cache_capacity` follows the supplied configuration.
    pub fn open<P: AsRef<Path>>(path: P, cache_capacity: Option<u64>) -> Result<Self> {
        // bootstrap read: the header fits the minimum page size, and any
        // valid file length is a multiple of it
        let mut page0 = vec![0u8; MIN_PAGE_SIZE];
        {
            let boot = DiskFile::open(&path, MIN_PAGE_SIZE)?;
            boot.read_page(0, &mut page0)?;
        }
        let file_header = FileHeader::from_bytes(&page0[PAGE_HEADER_SIZE..])?;
        let page_size = file_header.page_size() as usize;
        let next_page_id = file_header.next_page_id();
        let next_txn_id = file_header.next_txn_id();

        let mut databases = HashMap::new();
        for db_id in file_header.database_ids() {
            let entry = file_header.entry(db_id).expect("listed entry exists");
            let config = entry.config();
            databases.insert(
                db_id,
                DbState {
                    config,
                    root: entry.root_page(),
                    recno_next: entry.recno_next(),
                    optree: OpTree::new(comparator_for(&config)),
                },
            );
        }

        let pager = Pager::open(&path, page_size, cache_capacity, next_page_id)?;
        let blobs = BlobStore::new(pager.file(), page_size);
        info!(path = %path.as_ref().display(), page_size, databases = databases.len(), "opened environment");

        Ok(Self {
            shared: Arc::new(EnvShared {
                pager,
                blobs,
                page_size,
                state: Mutex::new(EnvState {
                    next_txn_id,
                    databases,
                    txns: TxnManager::new(),
                    cursors: HashMap::new(),
                    next_cursor_id: 1,
                }),
            }),
        })
    }

    /// Creates a database in this environment. Fails if `db_id` exists
    /// (zero is reserved) or the directory is full.
    pub fn create_db(&self, db_id: u32, config: DbConfig) -> Result<crate::db::Database> {
        if db_id == 0 {
            return Err(Error::InvParameter("db_id"));
        }
        config.validate(self.shared.page_size)?;

        let mut state = self.shared.state.lock();
        if state.databases.len() >= MAX_DATABASES || state.databases.contains_key(&db_id) {
            return Err(Error::InvParameter("db_id already exists"));
        }

        let root = Btree::create_root(&self.shared.pager, &config)?;
        state.databases.insert(
            db_id,
            DbState {
                config,
                root,
                recno_next: 1,
                optree: OpTree::new(comparator_for(&config)),
            },
        );

        self.shared.pager.with_page_mut(0, |data| {
            let header = FileHeader::from_bytes_mut(&mut data[PAGE_HEADER_SIZE..])?;
            header.allocate_entry(db_id)?.occupy(db_id, &config, root);
            Ok(())
        })?;
        self.shared.pager.flush_changeset()?;
        debug!(db_id, "created database");

        Ok(crate::db::Database::new(Arc::clone(&self.shared), db_id))
    }

    /// Opens an existing database.
    pub fn open_db(&self, db_id: u32) -> Result<crate::db::Database> {
        let state = self.shared.state.lock();
        if !state.databases.contains_key(&db_id) {
            return Err(Error::DatabaseNotFound(db_id));
        }
        Ok(crate::db::Database::new(Arc::clone(&self.shared), db_id))
    }

    /// Begins a read-write transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.begin_inner(false)
    }

    /// Begins a read-only transaction.
    pub fn begin_read_only(&self) -> Result<Transaction> {
        self.begin_inner(true)
    }

    fn begin_inner(&self, read_only: bool) -> Result<Transaction> {
        let mut state = self.shared.state.lock();
        let id = state.next_txn_id;
        state.next_txn_id += 1;
        state.txns.begin(id, read_only);
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            id,
        })
    }

    /// Promotes every flushable committed transaction into the B-tree and
    /// persists the header and changeset.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.flush_committed(&mut state)?;
        self.shared.persist_header(&state)?;
        self.shared.pager.flush_changeset()
    }

    pub fn cache_hits(&self) -> u64 {
        self.shared.pager.cache_hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.shared.pager.cache_misses()
    }

    /// Validates every database's B-tree invariants (tests and tooling).
    pub fn check_integrity(&self) -> Result<()> {
        let state = self.shared.state.lock();
        for db in state.databases.values() {
            let tree = Btree::new(&self.shared.pager, &self.shared.blobs, &db.config, db.root);
            tree.check_integrity()?;
        }
        Ok(())
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl EnvShared {
    pub(crate) fn commit_txn(&self, id: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        state.txns.commit(id)?;
        debug!(txn = id, "committed transaction");
        self.flush_committed(&mut state)?;
        self.persist_header(&state)?;
        self.pager.flush_changeset()
    }

    pub(crate) fn abort_txn(&self, id: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        state.txns.abort(id)?;

        // drop the transaction's ops immediately
        let ops = state.txns.get(id)?.ops.clone();
        for (db_id, key) in &ops {
            if let Some(db) = state.databases.get_mut(db_id) {
                db.optree.drop_txn_ops(key, id);
            }
        }
        debug!(txn = id, ops = ops.len(), "aborted transaction");

        self.flush_committed(&mut state)?;
        self.persist_header(&state)?;
        self.pager.flush_changeset()
    }

    pub(crate) fn txn_state(&self, id: TxnId) -> TxnState {
        self.state.lock().txns.state(id)
    }

    /// Pops finished transactions off the front of the environment list,
    /// promoting committed ops into the B-tree. Stops at the first
    /// still-active transaction.
    pub(crate) fn flush_committed(&self, state: &mut EnvState) -> Result<()> {
        let mut btree_cursors_reset = false;
        loop {
            let Some(front) = state.txns.oldest() else {
                return Ok(());
            };
            if state.txns.state(front) == TxnState::Active {
                return Ok(());
            }
            if !btree_cursors_reset {
                // structural modification invalidates (page, slot)
                // positions; open cursors re-resolve from their anchors
                for cursor in state.cursors.values_mut() {
                    if let Some((page, _)) = cursor.btree.position() {
                        self.pager.unpin(page);
                        cursor.btree.reset();
                    }
                }
                btree_cursors_reset = true;
            }
            let record = state.txns.pop_oldest().expect("front exists");
            if record.state == TxnState::Committed {
                debug!(txn = record.id, ops = record.ops.len(), "flushing transaction");
                for (db_id, key) in &record.ops {
                    self.flush_one_op(state, *db_id, key, record.id)?;
                }
            } else {
                // aborted records already dropped their ops; this covers
                // records aborted without explicit cleanup
                for (db_id, key) in &record.ops {
                    if let Some(db) = state.databases.get_mut(db_id) {
                        db.optree.drop_txn_ops(key, record.id);
                    }
                }
            }
        }
    }

    /// Promotes the oldest op of `txn_id` on `key` into the B-tree,
    /// uncoupling any cursors attached to it.
    fn flush_one_op(
        &self,
        state: &mut EnvState,
        db_id: u32,
        key: &[u8],
        txn_id: TxnId,
    ) -> Result<()> {
        let EnvState {
            databases, cursors, ..
        } = state;
        let Some(db) = databases.get_mut(&db_id) else {
            return Ok(());
        };
        let Some(node) = db.optree.get_mut(key) else {
            return Ok(());
        };
        let Some(pos) = node.ops.iter().position(|op| op.txn == txn_id) else {
            return Ok(());
        };
        let op = node.ops.remove(pos);
        let node_empty = node.ops.is_empty();

        let mut tree = Btree::new(&self.pager, &self.blobs, &db.config, db.root);
        match op.kind {
            OpKind::Insert | OpKind::InsertOw => tree.insert(key, &op.record, true)?,
            OpKind::Erase => {
                let _ = tree.erase(key)?;
            }
            OpKind::Nop => {}
        }
        db.root = tree.root();

        if node_empty {
            db.optree.remove(key);
        }
        for cursor_id in op.cursors {
            if let Some(cursor) = cursors.get_mut(&cursor_id) {
                cursor.txn_cursor.uncouple();
            }
        }
        Ok(())
    }

    /// Writes the allocation and transaction counters plus the database
    /// directory back into page 0.
    pub(crate) fn persist_header(&self, state: &EnvState) -> Result<()> {
        let next_page_id = self.pager.next_page_id();
        self.pager.with_page_mut(0, |data| {
            let header = FileHeader::from_bytes_mut(&mut data[PAGE_HEADER_SIZE..])?;
            header.set_next_txn_id(state.next_txn_id);
            header.set_next_page_id(next_page_id);
            for (db_id, db) in &state.databases {
                if let Some(entry) = header.entry_mut(*db_id) {
                    entry.set_root_page(db.root);
                    entry.set_recno_next(db.recno_next);
                }
            }
            Ok(())
        })
    }

    pub(crate) fn open_cursor(&self, db_id: u32, txn_id: TxnId) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.databases.contains_key(&db_id) {
            return Err(Error::DatabaseNotFound(db_id));
        }
        if state.txns.get(txn_id)?.state != TxnState::Active {
            return Err(Error::InvParameter("transaction is not active"));
        }
        state.txns.add_cursor_ref(txn_id)?;

        let id = state.next_cursor_id;
        state.next_cursor_id += 1;
        state.cursors.insert(
            id,
            CursorState {
                db_id,
                txn_id,
                btree: BtreeCursor::new(),
                txn_cursor: TxnCursor::new(id),
                last_key: None,
            },
        );
        Ok(id)
    }
}

/// A transaction handle. Commit and abort go through the environment;
/// dropping an unfinished transaction aborts it (best effort).
pub struct Transaction {
    shared: Arc<EnvShared>,
    id: TxnId,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub(crate) fn shared(&self) -> &Arc<EnvShared> {
        &self.shared
    }

    /// Commits this transaction and flushes the committed prefix of the
    /// environment list. Fails with `CursorStillOpen` while cursors are
    /// attached.
    pub fn commit(&self) -> Result<()> {
        self.shared.commit_txn(self.id)
    }

    /// Aborts this transaction, dropping its ops. Fails with
    /// `CursorStillOpen` while cursors are attached.
    pub fn abort(&self) -> Result<()> {
        self.shared.abort_txn(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.shared.txn_state(self.id) == TxnState::Active {
            let _ = self.shared.abort_txn(self.id);
        }
    }
}

// keep the Cursor type wired to the environment internals
impl Cursor {
    pub(crate) fn new(shared: Arc<EnvShared>, id: u64) -> Self {
        Self { shared, id }
    }
}
