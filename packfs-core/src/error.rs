//! Error taxonomy for the storage kernel
//!
//! Integrity and format errors always surface to the caller; lock
//! contention and optional-cache failures are locally recoverable
//! depending on configuration.

use crate::id::ItemId;

/// Result type for storage kernel operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur inside the storage kernel
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    #[error("Revision {0} not found")]
    RevisionNotFound(u64),

    #[error("Transaction {0} not found")]
    TxnNotFound(String),

    /// Another process or thread holds a required lock. Retryable.
    #[error("Resource busy: {0}")]
    Busy(String),

    /// Stored data does not match its recorded digest or structure.
    /// Never masked; indicates on-disk corruption.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Corrupt storage structure: {0}")]
    Corrupt(String),

    /// On-disk format number is not one this build can read.
    #[error("Unsupported filesystem format {found} (expected {expected})")]
    Format { expected: u32, found: u32 },

    /// A remote cache backend failed while `fail_stop` is enabled.
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for FsError {
    fn from(e: rusqlite::Error) -> Self {
        FsError::Database(e.to_string())
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl FsError {
    /// True for contention conditions the caller may retry after backoff.
    pub fn is_busy(&self) -> bool {
        matches!(self, FsError::Busy(_))
    }
}
