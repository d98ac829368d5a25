//! Storage layer error types.

use crate::storage::page::PageId;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the page cache, the tree index and the object context.
///
/// Corruption and lock-state errors are never retried. Timeouts are the only
/// condition a caller is expected to catch and react to.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Invalid {what} signature: expected {expected:#018x}, found {found:#018x}")]
    InvalidSignature {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Page number mismatch: expected {expected}, found {found}")]
    PageMismatch { expected: PageId, found: PageId },

    #[error("Storage is corrupted: {0}")]
    Corruption(String),

    #[error("Page {0} is not locked")]
    PageNotLocked(PageId),

    #[error("Invalid lock state: {0}")]
    LockState(String),

    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    #[error("Timeout acquiring {name} after {waited:?}")]
    Timeout { name: String, waited: Duration },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Page storage is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl StorageError {
    /// Whether the error is a lock acquisition timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StorageError::Timeout { .. })
    }

    /// Whether the error reports structural damage of persisted data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::InvalidSignature { .. }
                | StorageError::PageMismatch { .. }
                | StorageError::Corruption(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
