//! Error types for SubKV
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using SubKvError
pub type Result<T> = std::result::Result<T, SubKvError>;

/// Unified error type for SubKV operations
#[derive(Debug, Error)]
pub enum SubKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Region is attached read-only")]
    ReadOnly,

    // -------------------------------------------------------------------------
    // Lookup Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key expired")]
    Expired,

    #[error("Key is a history record")]
    HistoryMarked,

    // -------------------------------------------------------------------------
    // Region Errors
    // -------------------------------------------------------------------------
    #[error("Allocation failed: {0}")]
    AllocationFailure(String),

    #[error("Region corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error("Lock failure: {0}")]
    LockFailure(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Transaction error: {0}")]
    Transaction(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SubKvError {
    /// True for the errors a reader should treat as "key absent"
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            SubKvError::KeyNotFound | SubKvError::Expired | SubKvError::HistoryMarked
        )
    }
}

impl From<bincode::Error> for SubKvError {
    fn from(e: bincode::Error) -> Self {
        SubKvError::Serialization(e.to_string())
    }
}
