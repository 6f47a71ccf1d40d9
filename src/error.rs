//! Error types for burrowdb.
//!
//! The engine surfaces a closed set of error codes. Two of them double as
//! control-flow signals between the cursor layers: [`Error::CursorIsNil`]
//! (the cursor has no position) and [`Error::Internal`] (a transaction
//! cursor was uncoupled by a flush; the caller must consult the B-tree).

use thiserror::Error;

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// File I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key does not exist in the merged view.
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists and overwrite was not requested.
    #[error("duplicate key")]
    DuplicateKey,

    /// The cursor has no position.
    #[error("cursor is nil")]
    CursorIsNil,

    /// A transaction cannot commit or abort while cursors are attached.
    #[error("transaction still has {0} open cursor(s)")]
    CursorStillOpen(usize),

    /// No database with the given id exists in this environment.
    #[error("database {0} not found")]
    DatabaseNotFound(u32),

    /// Invalid caller-supplied parameter.
    #[error("invalid parameter: {0}")]
    InvParameter(&'static str),

    /// The requested capability is not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Persisted state failed validation.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// Internal signal: the transaction cursor is uncoupled and the caller
    /// must re-resolve the position through the B-tree.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// True for the logic conditions that callers handle and retry-free
    /// report upward, as opposed to structural failures.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Error::KeyNotFound
                | Error::DuplicateKey
                | Error::CursorIsNil
                | Error::CursorStillOpen(_)
                | Error::DatabaseNotFound(_)
        )
    }
}
