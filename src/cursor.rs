//! Merged cursor: the visible sequence over B-tree plus transaction
//! overlay.
//!
//! Every database cursor is a pair of sub-cursors: a B-tree cursor on a
//! `(page, slot)` and a transaction cursor on an op. Movement computes the
//! candidate key from each side and takes the nearer one; on a tie the
//! transaction side wins (it carries the more recent write), and a
//! tombstone consumes the key from both sides. Approximate find is built
//! on the same walk.
//!
//! Getter control flow follows the transaction cursor's state: a coupled
//! cursor answers from its op, an uncoupled cursor signals `Internal` and
//! the B-tree is consulted with the retained key copy, a nil transaction
//! cursor defers to the B-tree cursor.

use std::cmp::Ordering;

use crate::btree::{Btree, BtreeCursor, MatchMode};
use crate::env::{DbState, EnvShared, EnvState};
use crate::error::{Error, Result};
use crate::txn::optree::{NodeAction, OpTree};
use crate::txn::{TxnCursor, TxnId};

use std::sync::Arc;

/// Cursor movement directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorDir {
    First,
    Last,
    Next,
    Previous,
}

/// Internal state of one open cursor.
pub(crate) struct CursorState {
    pub db_id: u32,
    pub txn_id: TxnId,
    pub btree: BtreeCursor,
    pub txn_cursor: TxnCursor,
    /// Key of the position last returned; anchor for NEXT/PREVIOUS.
    pub last_key: Option<Vec<u8>>,
}

/// A resolved merged-view entry.
#[derive(Debug)]
pub(crate) enum Hit {
    /// The transaction overlay supplied the record.
    Txn {
        key: Vec<u8>,
        op_id: u64,
        record: Vec<u8>,
    },
    /// The B-tree supplied the record.
    Btree { key: Vec<u8>, record: Vec<u8> },
}

impl Hit {
    pub fn key(&self) -> &[u8] {
        match self {
            Hit::Txn { key, .. } | Hit::Btree { key, .. } => key,
        }
    }

    pub fn into_pair(self) -> (Vec<u8>, Vec<u8>) {
        match self {
            Hit::Txn { key, record, .. } | Hit::Btree { key, record } => (key, record),
        }
    }
}

/// Overlay node resolution, with everything cloned out so no borrow of
/// the op tree escapes.
enum Overlay {
    Insert { key: Vec<u8>, op_id: u64, record: Vec<u8> },
    Tombstone { key: Vec<u8> },
    Undecided { key: Vec<u8> },
}

impl Overlay {
    fn key(&self) -> &[u8] {
        match self {
            Overlay::Insert { key, .. }
            | Overlay::Tombstone { key }
            | Overlay::Undecided { key } => key,
        }
    }
}

fn overlay_at(state: &EnvState, db: &DbState, reader: TxnId, key: &[u8]) -> Option<Overlay> {
    let node = db.optree.get(key)?;
    Some(resolve_overlay(state, reader, node))
}

fn resolve_overlay(state: &EnvState, reader: TxnId, node: &crate::txn::OpNode) -> Overlay {
    match OpTree::resolve(node, reader, &state.txns) {
        NodeAction::Insert(op) => Overlay::Insert {
            key: node.key.clone(),
            op_id: op.id,
            record: op.record.clone(),
        },
        NodeAction::Erased => Overlay::Tombstone {
            key: node.key.clone(),
        },
        NodeAction::None => Overlay::Undecided {
            key: node.key.clone(),
        },
    }
}

/// Overlay candidate strictly beyond `anchor` in the walk direction, or
/// the edge node when `anchor` is `None`.
fn overlay_candidate(
    state: &EnvState,
    db: &DbState,
    reader: TxnId,
    anchor: Option<&[u8]>,
    forward: bool,
) -> Option<Overlay> {
    let node = match (anchor, forward) {
        (None, true) => db.optree.first(),
        (None, false) => db.optree.last(),
        (Some(a), true) => db.optree.next_after(a),
        (Some(a), false) => db.optree.prev_before(a),
    }?;
    Some(resolve_overlay(state, reader, node))
}

/// B-tree candidate strictly beyond `anchor`, or the edge entry.
fn btree_candidate(
    shared: &EnvShared,
    db: &DbState,
    anchor: Option<&[u8]>,
    forward: bool,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let tree = Btree::new(&shared.pager, &shared.blobs, &db.config, db.root);
    let mut cursor = BtreeCursor::new();
    let positioned = match anchor {
        None => {
            if forward {
                cursor.move_first(&tree)?
            } else {
                cursor.move_last(&tree)?
            }
        }
        Some(anchor) => {
            let mode = if forward { MatchMode::Gt } else { MatchMode::Lt };
            cursor.seek(&tree, anchor, mode)?
        }
    };
    if !positioned {
        cursor.clear(&tree);
        return Ok(None);
    }
    let pair = (cursor.key(&tree)?, cursor.record(&tree)?);
    cursor.clear(&tree);
    Ok(Some(pair))
}

/// One step of the merged walk: the nearest visible key strictly beyond
/// `anchor` (or the edge for `None`). Tombstones consume their key from
/// both sides.
pub(crate) fn merged_move(
    shared: &EnvShared,
    state: &EnvState,
    db: &DbState,
    reader: TxnId,
    anchor: Option<&[u8]>,
    forward: bool,
) -> Result<Option<Hit>> {
    let cmp = crate::env::comparator_for(&db.config);
    let mut anchor: Option<Vec<u8>> = anchor.map(|a| a.to_vec());

    loop {
        let bt = btree_candidate(shared, db, anchor.as_deref(), forward)?;
        let tx = overlay_candidate(state, db, reader, anchor.as_deref(), forward);

        match (bt, tx) {
            (None, None) => return Ok(None),
            (Some((key, record)), None) => return Ok(Some(Hit::Btree { key, record })),
            (None, Some(overlay)) => match overlay {
                Overlay::Insert { key, op_id, record } => {
                    return Ok(Some(Hit::Txn { key, op_id, record }));
                }
                Overlay::Tombstone { key } | Overlay::Undecided { key } => {
                    anchor = Some(key);
                }
            },
            (Some((bt_key, bt_record)), Some(overlay)) => {
                let ord = cmp.cmp(overlay.key(), &bt_key);
                let overlay_nearer = if forward {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                };

                if ord == Ordering::Equal {
                    // same key on both sides: the overlay is authoritative
                    match overlay {
                        Overlay::Insert { key, op_id, record } => {
                            return Ok(Some(Hit::Txn { key, op_id, record }));
                        }
                        Overlay::Tombstone { key } => anchor = Some(key),
                        Overlay::Undecided { .. } => {
                            return Ok(Some(Hit::Btree {
                                key: bt_key,
                                record: bt_record,
                            }));
                        }
                    }
                } else if overlay_nearer {
                    match overlay {
                        Overlay::Insert { key, op_id, record } => {
                            return Ok(Some(Hit::Txn { key, op_id, record }));
                        }
                        Overlay::Tombstone { key } | Overlay::Undecided { key } => {
                            anchor = Some(key);
                        }
                    }
                } else {
                    return Ok(Some(Hit::Btree {
                        key: bt_key,
                        record: bt_record,
                    }));
                }
            }
        }
    }
}

/// Merged point or approximate lookup.
pub(crate) fn merged_find(
    shared: &EnvShared,
    state: &EnvState,
    db: &DbState,
    reader: TxnId,
    key: &[u8],
    mode: MatchMode,
) -> Result<Option<Hit>> {
    if mode.accepts_equal() {
        match overlay_at(state, db, reader, key) {
            Some(Overlay::Insert { key, op_id, record }) => {
                return Ok(Some(Hit::Txn { key, op_id, record }));
            }
            Some(Overlay::Tombstone { .. }) => {
                // the key is erased for this reader; fall through to the
                // approximate neighbors for LEQ/GEQ
            }
            Some(Overlay::Undecided { .. }) | None => {
                let tree = Btree::new(&shared.pager, &shared.blobs, &db.config, db.root);
                if let Some(record) = tree.lookup(key)? {
                    return Ok(Some(Hit::Btree {
                        key: key.to_vec(),
                        record,
                    }));
                }
            }
        }
    }

    match mode {
        MatchMode::Exact => Ok(None),
        MatchMode::Lt | MatchMode::Leq => merged_move(shared, state, db, reader, Some(key), false),
        MatchMode::Gt | MatchMode::Geq => merged_move(shared, state, db, reader, Some(key), true),
    }
}

// ---------------------------------------------------------------------------
// cursor operations on the environment
// ---------------------------------------------------------------------------

impl EnvShared {
    pub(crate) fn cursor_move(&self, cursor_id: u64, dir: CursorDir) -> Result<()> {
        let mut state = self.state.lock();

        let (db_id, txn_id, anchor) = {
            let cursor = state
                .cursors
                .get(&cursor_id)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            (cursor.db_id, cursor.txn_id, cursor.last_key.clone())
        };
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        let hit = match dir {
            CursorDir::First => merged_move(self, &state, db, txn_id, None, true)?,
            CursorDir::Last => merged_move(self, &state, db, txn_id, None, false)?,
            CursorDir::Next => {
                let anchor = anchor.ok_or(Error::CursorIsNil)?;
                merged_move(self, &state, db, txn_id, Some(&anchor), true)?
            }
            CursorDir::Previous => {
                let anchor = anchor.ok_or(Error::CursorIsNil)?;
                merged_move(self, &state, db, txn_id, Some(&anchor), false)?
            }
        };

        match hit {
            Some(hit) => self.apply_cursor_hit(&mut state, cursor_id, hit),
            None => Err(Error::KeyNotFound),
        }
    }

    pub(crate) fn cursor_find(&self, cursor_id: u64, key: &[u8], mode: MatchMode) -> Result<()> {
        let mut state = self.state.lock();

        let (db_id, txn_id) = {
            let cursor = state
                .cursors
                .get(&cursor_id)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            (cursor.db_id, cursor.txn_id)
        };
        let db = state
            .databases
            .get(&db_id)
            .ok_or(Error::DatabaseNotFound(db_id))?;

        let hit = merged_find(self, &state, db, txn_id, key, mode)?;
        match hit {
            Some(hit) => self.apply_cursor_hit(&mut state, cursor_id, hit),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Couples the sub-cursors to a resolved hit and records the anchor.
    fn apply_cursor_hit(&self, state: &mut EnvState, cursor_id: u64, hit: Hit) -> Result<()> {
        let EnvState {
            databases, cursors, ..
        } = state;
        let cursor = cursors
            .get_mut(&cursor_id)
            .ok_or(Error::InvParameter("unknown cursor"))?;
        let db = databases
            .get_mut(&cursor.db_id)
            .ok_or(Error::DatabaseNotFound(cursor.db_id))?;
        let tree = Btree::new(&self.pager, &self.blobs, &db.config, db.root);

        match hit {
            Hit::Txn { key, op_id, .. } => {
                cursor.btree.clear(&tree);
                cursor.txn_cursor.couple_to(&mut db.optree, &key, op_id);
                cursor.last_key = Some(key);
            }
            Hit::Btree { key, .. } => {
                cursor.txn_cursor.set_to_nil(&mut db.optree);
                if !cursor.btree.seek(&tree, &key, MatchMode::Exact)? {
                    return Err(Error::Internal);
                }
                cursor.last_key = Some(key);
            }
        }
        Ok(())
    }

    pub(crate) fn cursor_key(&self, cursor_id: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let cursor = state
            .cursors
            .get(&cursor_id)
            .ok_or(Error::InvParameter("unknown cursor"))?;
        let db = state
            .databases
            .get(&cursor.db_id)
            .ok_or(Error::DatabaseNotFound(cursor.db_id))?;
        let tree = Btree::new(&self.pager, &self.blobs, &db.config, db.root);

        match cursor.txn_cursor.key() {
            Ok(key) => Ok(key),
            Err(Error::Internal) => {
                // flushed out from under us; relocate in the B-tree
                let key = cursor
                    .txn_cursor
                    .uncoupled_key()
                    .ok_or(Error::Internal)?;
                match tree.lookup(key)? {
                    Some(_) => Ok(key.to_vec()),
                    None => Err(Error::KeyNotFound),
                }
            }
            Err(Error::CursorIsNil) => {
                if cursor.btree.position().is_some() {
                    cursor.btree.key(&tree)
                } else if let Some(anchor) = &cursor.last_key {
                    // the B-tree position was dropped by a flush; the
                    // anchor relocates the cursor
                    match tree.lookup(anchor)? {
                        Some(_) => Ok(anchor.clone()),
                        None => Err(Error::KeyNotFound),
                    }
                } else {
                    Err(Error::CursorIsNil)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn cursor_record(&self, cursor_id: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let cursor = state
            .cursors
            .get(&cursor_id)
            .ok_or(Error::InvParameter("unknown cursor"))?;
        let db = state
            .databases
            .get(&cursor.db_id)
            .ok_or(Error::DatabaseNotFound(cursor.db_id))?;
        let tree = Btree::new(&self.pager, &self.blobs, &db.config, db.root);

        match cursor.txn_cursor.record(&db.optree) {
            Ok(record) => Ok(record),
            Err(Error::Internal) => {
                let key = cursor
                    .txn_cursor
                    .uncoupled_key()
                    .ok_or(Error::Internal)?;
                tree.lookup(key)?.ok_or(Error::KeyNotFound)
            }
            Err(Error::CursorIsNil) => {
                if cursor.btree.position().is_some() {
                    cursor.btree.record(&tree)
                } else if let Some(anchor) = &cursor.last_key {
                    tree.lookup(anchor)?.ok_or(Error::KeyNotFound)
                } else {
                    Err(Error::CursorIsNil)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn close_cursor(&self, cursor_id: u64) {
        let mut state = self.state.lock();
        let Some(mut cursor) = state.cursors.remove(&cursor_id) else {
            return;
        };
        if let Some((page, _)) = cursor.btree.position() {
            self.pager.unpin(page);
        }
        if let Some(db) = state.databases.get_mut(&cursor.db_id) {
            cursor.txn_cursor.set_to_nil(&mut db.optree);
        }
        state.txns.release_cursor_ref(cursor.txn_id);
    }
}

/// An open database cursor. Closing (or dropping) it releases its pins
/// and its transaction reference.
pub struct Cursor {
    pub(crate) shared: Arc<EnvShared>,
    pub(crate) id: u64,
}

impl Cursor {
    /// Moves the cursor and returns the key it landed on.
    pub fn move_to(&mut self, dir: CursorDir) -> Result<Vec<u8>> {
        self.shared.cursor_move(self.id, dir)?;
        self.shared.cursor_key(self.id)
    }

    /// Positions the cursor per the match mode and returns the matched
    /// key.
    pub fn find(&mut self, key: &[u8], mode: MatchMode) -> Result<Vec<u8>> {
        self.shared.cursor_find(self.id, key, mode)?;
        self.shared.cursor_key(self.id)
    }

    pub fn key(&self) -> Result<Vec<u8>> {
        self.shared.cursor_key(self.id)
    }

    pub fn record(&self) -> Result<Vec<u8>> {
        self.shared.cursor_record(self.id)
    }

    pub fn close(self) {}
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.shared.close_cursor(self.id);
    }
}
