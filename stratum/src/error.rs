//! Error types for the storage core.

use thiserror::Error;

use crate::page::{PageId, RecordId, TableId, TransactionId};

/// Result type alias using [`StratumError`].
pub type Result<T> = std::result::Result<T, StratumError>;

/// Errors raised by the buffer pool, the lock manager and their collaborators.
#[derive(Debug, Error)]
pub enum StratumError {
    // Concurrency control
    #[error("deadlock detected: {tx_id} waiting for {page_id}")]
    DeadlockDetected {
        tx_id: TransactionId,
        page_id: PageId,
    },

    #[error("buffer pool exhausted: all {capacity} resident pages are dirty and locked")]
    CacheExhausted { capacity: usize },

    #[error("{tx_id} holds no lock on {page_id}")]
    LockNotHeld {
        tx_id: TransactionId,
        page_id: PageId,
    },

    // Catalog
    #[error("table not found: {0}")]
    TableNotFound(TableId),

    #[error("table not found: {0}")]
    TableNameNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    // Page store
    #[error("page {page_id} out of range (table has {num_pages} pages)")]
    PageOutOfRange { page_id: PageId, num_pages: u32 },

    #[error("page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    #[error("tuple size mismatch: expected {expected}, got {actual}")]
    TupleSizeMismatch { expected: usize, actual: usize },

    #[error("tuple not found: {0}")]
    TupleNotFound(RecordId),

    #[error("tuple has no record id")]
    MissingRecordId,

    // Configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StratumError {
    /// Whether the owning transaction has to be aborted after this error.
    pub fn is_transaction_abort(&self) -> bool {
        matches!(
            self,
            StratumError::DeadlockDetected { .. } | StratumError::CacheExhausted { .. }
        )
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, StratumError::DeadlockDetected { .. })
    }
}
