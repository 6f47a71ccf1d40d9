//! # burrowdb: embedded single-file ordered key-value storage
//!
//! burrowdb is a transactional, ordered key-value engine backed by a
//! disk-based B-tree in one file. Three subsystems carry the design:
//!
//! - a **paginated B-tree** whose node layout is chosen by the database's
//!   key regime (fixed-size keys use a PAX layout of parallel arrays,
//!   variable-size keys a slotted layout with a key heap and blob
//!   overflow),
//! - a **page cache** with hash-bucketed lookup, a global LRU list, and a
//!   byte-capacity purge policy,
//! - a **transactional overlay** of per-key op chains through which every
//!   read sees a consistent merge of the B-tree with the acting
//!   transaction's work plus all committed-but-unflushed transactions.
//!
//! ## Quick start
//!
//! ```no_run
//! use burrowdb::{DbConfig, Env, EnvConfig, InsertMode, MatchMode};
//!
//! # fn main() -> burrowdb::Result<()> {
//! let env = Env::create("data.burrow", EnvConfig::default())?;
//! let db = env.create_db(1, DbConfig::default())?;
//!
//! let txn = env.begin()?;
//! db.insert(&txn, b"hello world", b"hello chris", InsertMode::Insert)?;
//! assert_eq!(db.find(&txn, b"hello world", MatchMode::Exact)?, b"hello chris");
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │  Env / Database / Transaction / Cursor    │
//! ├───────────────────────────────────────────┤
//! │  merged cursor (B-tree ⋈ txn overlay)     │
//! ├─────────────────────┬─────────────────────┤
//! │  B-tree (PAX /      │  op trees, txn      │
//! │  slotted layouts)   │  registry, cursors  │
//! ├─────────────────────┴─────────────────────┤
//! │  pager: page cache + changeset + blobs    │
//! ├───────────────────────────────────────────┤
//! │  memory-mapped single file                │
//! └───────────────────────────────────────────┘
//! ```

pub mod btree;
pub mod config;
mod cursor;
mod db;
mod env;
pub mod error;
pub mod storage;
pub mod txn;

pub use btree::MatchMode;
pub use config::{DbConfig, EnvConfig, KeyKind, RecordKind};
pub use cursor::{Cursor, CursorDir};
pub use db::{Database, DupPosition, InsertMode};
pub use env::{Env, Transaction};
pub use error::{Error, Result};
