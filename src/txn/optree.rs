//! Per-database transaction operation tree.
//!
//! Every key a transaction touches gets an [`OpNode`] in the database's
//! ordered op tree; the node holds the key's ops in insertion order
//! (oldest first, newest last). Readers resolve a node by walking the
//! chain newest-first, skipping ops whose owning transaction is neither
//! the reader's nor committed; the first visible insert or erase decides.
//!
//! The tree is ordered by the database comparator. Record-number keys are
//! indexed by their big-endian image so that map order equals numeric
//! order.

use std::collections::BTreeMap;
use std::ops::Bound;

use smallvec::SmallVec;

use crate::btree::Comparator;

use super::{TxnId, TxnManager};

pub type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Plain insert; fails on an existing key.
    Insert,
    /// Overwriting insert.
    InsertOw,
    /// Tombstone.
    Erase,
    /// Placeholder without effect.
    Nop,
}

/// One mutation, owned by a transaction and chained into an op node.
#[derive(Debug)]
pub struct Op {
    pub id: OpId,
    pub txn: TxnId,
    pub kind: OpKind,
    pub record: Vec<u8>,
    /// Cursors currently coupled to this op; they are transitioned to
    /// uncoupled when the op is flushed into the B-tree.
    pub cursors: SmallVec<[u64; 2]>,
}

/// Per-key entry: the user key plus its time-ordered op chain.
#[derive(Debug)]
pub struct OpNode {
    pub key: Vec<u8>,
    /// Oldest first; the newest op is the last element.
    pub ops: Vec<Op>,
}

impl OpNode {
    pub fn newest(&self) -> Option<&Op> {
        self.ops.last()
    }

    pub fn oldest(&self) -> Option<&Op> {
        self.ops.first()
    }

    pub fn op_by_id(&self, id: OpId) -> Option<&Op> {
        self.ops.iter().find(|op| op.id == id)
    }

    pub fn op_by_id_mut(&mut self, id: OpId) -> Option<&mut Op> {
        self.ops.iter_mut().find(|op| op.id == id)
    }
}

/// The decisive visible state of an op node for one reader.
#[derive(Debug, Clone, Copy)]
pub enum NodeAction<'a> {
    /// A visible insert/overwrite; the key exists with this op's record.
    Insert(&'a Op),
    /// A visible erase; the key is tombstoned for this reader.
    Erased,
    /// No visible decisive op; the B-tree state stands.
    None,
}

#[derive(Debug)]
pub struct OpTree {
    cmp: Comparator,
    nodes: BTreeMap<Vec<u8>, OpNode>,
    next_op_id: OpId,
}

impl OpTree {
    pub fn new(cmp: Comparator) -> Self {
        Self {
            cmp,
            nodes: BTreeMap::new(),
            next_op_id: 1,
        }
    }

    /// Map ordering key: identity for byte keys, big-endian image for
    /// record numbers.
    fn ord_key(&self, key: &[u8]) -> Vec<u8> {
        match self.cmp {
            Comparator::Bytes => key.to_vec(),
            Comparator::RecnoU64 => {
                let n = u64::from_le_bytes(key.try_into().unwrap_or([0; 8]));
                n.to_be_bytes().to_vec()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&OpNode> {
        self.nodes.get(&self.ord_key(key))
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut OpNode> {
        let ord = self.ord_key(key);
        self.nodes.get_mut(&ord)
    }

    pub fn get_or_insert(&mut self, key: &[u8]) -> &mut OpNode {
        let ord = self.ord_key(key);
        self.nodes.entry(ord).or_insert_with(|| OpNode {
            key: key.to_vec(),
            ops: Vec::new(),
        })
    }

    pub fn remove(&mut self, key: &[u8]) {
        let ord = self.ord_key(key);
        self.nodes.remove(&ord);
    }

    /// Appends an op at the newest end of the key's chain and returns its
    /// id.
    pub fn append_op(&mut self, key: &[u8], txn: TxnId, kind: OpKind, record: Vec<u8>) -> OpId {
        let id = self.next_op_id;
        self.next_op_id += 1;
        let node = self.get_or_insert(key);
        node.ops.push(Op {
            id,
            txn,
            kind,
            record,
            cursors: SmallVec::new(),
        });
        id
    }

    pub fn first(&self) -> Option<&OpNode> {
        self.nodes.values().next()
    }

    pub fn last(&self) -> Option<&OpNode> {
        self.nodes.values().next_back()
    }

    /// Smallest node key strictly greater than `key`.
    pub fn next_after(&self, key: &[u8]) -> Option<&OpNode> {
        let ord = self.ord_key(key);
        self.nodes
            .range((Bound::Excluded(ord), Bound::Unbounded))
            .next()
            .map(|(_, node)| node)
    }

    /// Greatest node key strictly less than `key`.
    pub fn prev_before(&self, key: &[u8]) -> Option<&OpNode> {
        let ord = self.ord_key(key);
        self.nodes
            .range((Bound::Unbounded, Bound::Excluded(ord)))
            .next_back()
            .map(|(_, node)| node)
    }

    /// Resolves the node's decisive visible op for `reader`: the chain is
    /// walked newest-first, invisible ops are skipped, and the first
    /// visible insert or erase wins. Nops are passed over.
    pub fn resolve<'a>(node: &'a OpNode, reader: TxnId, txns: &TxnManager) -> NodeAction<'a> {
        for op in node.ops.iter().rev() {
            if !txns.is_visible(op.txn, reader) {
                continue;
            }
            match op.kind {
                OpKind::Insert | OpKind::InsertOw => return NodeAction::Insert(op),
                OpKind::Erase => return NodeAction::Erased,
                OpKind::Nop => {}
            }
        }
        NodeAction::None
    }

    /// Removes every op owned by `txn` from the key's chain; drops the
    /// node when the chain empties. Used by abort.
    pub fn drop_txn_ops(&mut self, key: &[u8], txn: TxnId) {
        let ord = self.ord_key(key);
        if let Some(node) = self.nodes.get_mut(&ord) {
            node.ops.retain(|op| op.txn != txn);
            if node.ops.is_empty() {
                self.nodes.remove(&ord);
            }
        }
    }

    /// All node keys in tree order (tests and counting).
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.nodes.values().map(|node| node.key.as_slice())
    }
}
