//! # Error Taxonomy
//!
//! Every fallible operation in the engine returns [`DbError`] through the
//! crate-wide [`Result`] alias. The executor layer dispatches on the error
//! kind, so variants are typed rather than stringly: physical errors
//! (`PageNotExist`, `Io`) abort the current operation, logical errors
//! (`RecordNotFound`, `IndexEntryNotFound`, catalog misses) leave the
//! storage structures consistent, and `TxnAbort` tells the caller to roll
//! the transaction back.
//!
//! The engine never swallows or retries internally; errors propagate with
//! enough context (file, page, slot, table, column) to be actionable at
//! the surface.

use thiserror::Error;

/// Why a transaction was aborted by the concurrency layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A lock was requested after the transaction released one (2PL).
    LockOnShrinking,
    /// A lock conflict under the no-wait policy.
    DeadlockPrevention,
    /// Explicit user rollback.
    UserAbort,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::LockOnShrinking => "lock requested in shrinking phase",
            AbortReason::DeadlockPrevention => "lock conflict (no-wait deadlock prevention)",
            AbortReason::UserAbort => "user abort",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("page {page_no} does not exist in file '{file}'")]
    PageNotExist { file: String, page_no: i32 },

    #[error("record not found at page {page_no} slot {slot_no}")]
    RecordNotFound { page_no: i32, slot_no: i32 },

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    #[error("database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("table '{0}' already exists")]
    TableExists(String),

    #[error("table '{0}' not found")]
    TableNotFound(String),

    #[error("index '{0}' already exists")]
    IndexExists(String),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("incompatible type: expected {expected}, got {got}")]
    IncompatibleType { expected: String, got: String },

    #[error("value count does not match column count")]
    InvalidValueCount,

    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("transaction {txn_id} aborted: {reason}")]
    TxnAbort { txn_id: u32, reason: AbortReason },

    #[error("device error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// True for the errors that require the caller to abort its transaction.
    pub fn is_txn_abort(&self) -> bool {
        matches!(self, DbError::TxnAbort { .. })
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        DbError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
