//! Transaction cursor.
//!
//! A transaction cursor is nil, coupled to an op in the op tree, or
//! uncoupled: the op it pointed at was flushed into the B-tree and only a
//! heap copy of the key remains. Getters on an uncoupled cursor return
//! [`Error::Internal`], a control-flow signal telling the caller to
//! re-resolve the position through the B-tree, not a failure.
//!
//! Movement walks op nodes in tree order. Within a node the chain is
//! examined newest-first, skipping ops of foreign uncommitted
//! transactions: a visible insert couples the cursor, a visible erase
//! stops the move with `KeyNotFound` (the key is tombstoned for this
//! reader), and a chain with no decisive op advances to the neighboring
//! node.

use crate::error::{Error, Result};

use super::optree::{NodeAction, OpTree};
use super::{TxnId, TxnManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnCursorState {
    Nil,
    /// Positioned on an op; `key` mirrors the op node's key.
    Coupled { key: Vec<u8>, op_id: u64 },
    /// The op was absorbed into the B-tree; only the key copy remains.
    Uncoupled { key: Vec<u8> },
}

#[derive(Debug)]
pub struct TxnCursor {
    /// Owning merged cursor's id; recorded in coupled ops' cursor sets.
    id: u64,
    state: TxnCursorState,
}

impl TxnCursor {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: TxnCursorState::Nil,
        }
    }

    pub fn state(&self) -> &TxnCursorState {
        &self.state
    }

    pub fn is_nil(&self) -> bool {
        self.state == TxnCursorState::Nil
    }

    /// Clears the cursor, detaching it from a coupled op.
    pub fn set_to_nil(&mut self, tree: &mut OpTree) {
        if let TxnCursorState::Coupled { key, op_id } = &self.state {
            if let Some(node) = tree.get_mut(key) {
                if let Some(op) = node.op_by_id_mut(*op_id) {
                    op.cursors.retain(|c| *c != self.id);
                }
            }
        }
        self.state = TxnCursorState::Nil;
    }

    fn couple(&mut self, tree: &mut OpTree, key: &[u8], op_id: u64) {
        self.set_to_nil(tree);
        if let Some(node) = tree.get_mut(key) {
            if let Some(op) = node.op_by_id_mut(op_id) {
                op.cursors.push(self.id);
            }
        }
        self.state = TxnCursorState::Coupled {
            key: key.to_vec(),
            op_id,
        };
    }

    /// Couples to a specific op resolved by the merged-cursor layer.
    pub(crate) fn couple_to(&mut self, tree: &mut OpTree, key: &[u8], op_id: u64) {
        self.couple(tree, key, op_id);
    }

    /// Transition used by the flush pass: the coupled op is gone, keep a
    /// key copy so a later read can relocate itself in the B-tree.
    pub fn uncouple(&mut self) {
        if let TxnCursorState::Coupled { key, .. } = &self.state {
            self.state = TxnCursorState::Uncoupled { key: key.clone() };
        }
    }

    /// Resolves `node` for `reader` and couples on a decisive insert.
    /// `Ok(true)` means positioned; `Ok(false)` means nothing decisive
    /// here (caller advances); `KeyNotFound` means tombstoned.
    fn try_couple_at(
        &mut self,
        tree: &mut OpTree,
        txns: &TxnManager,
        reader: TxnId,
        key: &[u8],
    ) -> Result<bool> {
        let Some(node) = tree.get(key) else {
            return Ok(false);
        };
        match OpTree::resolve(node, reader, txns) {
            NodeAction::Insert(op) => {
                let op_id = op.id;
                let key = node.key.clone();
                self.couple(tree, &key, op_id);
                Ok(true)
            }
            NodeAction::Erased => Err(Error::KeyNotFound),
            NodeAction::None => Ok(false),
        }
    }

    /// Positions on the key's node if it has a decisive visible insert.
    pub fn find(
        &mut self,
        tree: &mut OpTree,
        txns: &TxnManager,
        reader: TxnId,
        key: &[u8],
    ) -> Result<()> {
        self.set_to_nil(tree);
        if tree.get(key).is_none() {
            return Err(Error::KeyNotFound);
        }
        if self.try_couple_at(tree, txns, reader, key)? {
            Ok(())
        } else {
            Err(Error::KeyNotFound)
        }
    }

    /// Walks nodes starting at `start` (inclusive) in the given direction
    /// until one couples or a tombstone stops the move.
    fn walk(
        &mut self,
        tree: &mut OpTree,
        txns: &TxnManager,
        reader: TxnId,
        start: Option<Vec<u8>>,
        forward: bool,
    ) -> Result<()> {
        let mut key = match start {
            Some(key) => key,
            None => return Err(Error::KeyNotFound),
        };
        loop {
            if self.try_couple_at(tree, txns, reader, &key)? {
                return Ok(());
            }
            let next = if forward {
                tree.next_after(&key).map(|n| n.key.clone())
            } else {
                tree.prev_before(&key).map(|n| n.key.clone())
            };
            match next {
                Some(next) => key = next,
                None => return Err(Error::KeyNotFound),
            }
        }
    }

    pub fn move_first(&mut self, tree: &mut OpTree, txns: &TxnManager, reader: TxnId) -> Result<()> {
        self.set_to_nil(tree);
        let start = tree.first().map(|n| n.key.clone());
        self.walk(tree, txns, reader, start, true)
    }

    pub fn move_last(&mut self, tree: &mut OpTree, txns: &TxnManager, reader: TxnId) -> Result<()> {
        self.set_to_nil(tree);
        let start = tree.last().map(|n| n.key.clone());
        self.walk(tree, txns, reader, start, false)
    }

    pub fn move_next(&mut self, tree: &mut OpTree, txns: &TxnManager, reader: TxnId) -> Result<()> {
        let key = match &self.state {
            TxnCursorState::Nil => return Err(Error::CursorIsNil),
            TxnCursorState::Uncoupled { .. } => return Err(Error::Internal),
            TxnCursorState::Coupled { key, .. } => key.clone(),
        };
        let start = tree.next_after(&key).map(|n| n.key.clone());
        self.walk(tree, txns, reader, start, true)
    }

    pub fn move_prev(&mut self, tree: &mut OpTree, txns: &TxnManager, reader: TxnId) -> Result<()> {
        let key = match &self.state {
            TxnCursorState::Nil => return Err(Error::CursorIsNil),
            TxnCursorState::Uncoupled { .. } => return Err(Error::Internal),
            TxnCursorState::Coupled { key, .. } => key.clone(),
        };
        let start = tree.prev_before(&key).map(|n| n.key.clone());
        self.walk(tree, txns, reader, start, false)
    }

    /// The positioned key. `Internal` on an uncoupled cursor asks the
    /// caller to consult the B-tree.
    pub fn key(&self) -> Result<Vec<u8>> {
        match &self.state {
            TxnCursorState::Coupled { key, .. } => Ok(key.clone()),
            TxnCursorState::Uncoupled { .. } => Err(Error::Internal),
            TxnCursorState::Nil => Err(Error::CursorIsNil),
        }
    }

    /// The positioned op's record; same control flow as [`Self::key`].
    pub fn record(&self, tree: &OpTree) -> Result<Vec<u8>> {
        match &self.state {
            TxnCursorState::Coupled { key, op_id } => {
                let node = tree
                    .get(key)
                    .ok_or(Error::Internal)?;
                let op = node.op_by_id(*op_id).ok_or(Error::Internal)?;
                Ok(op.record.clone())
            }
            TxnCursorState::Uncoupled { .. } => Err(Error::Internal),
            TxnCursorState::Nil => Err(Error::CursorIsNil),
        }
    }

    /// Key copy held by an uncoupled cursor.
    pub fn uncoupled_key(&self) -> Option<&[u8]> {
        match &self.state {
            TxnCursorState::Uncoupled { key } => Some(key),
            _ => None,
        }
    }
}
