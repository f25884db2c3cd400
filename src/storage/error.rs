//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption in {target}: {reason}")]
    Corruption { target: String, reason: String },

    #[error("Allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema inconsistency for table '{table}': {reason}")]
    SchemaInconsistency { table: String, reason: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation {seq} was cancelled before it was sealed into a batch")]
    Cancelled { seq: u64 },

    #[error("Storage engine is closed")]
    Closed,

    #[error("Decode error: {0}")]
    Codec(String),

    #[error("Value too large: {size} bytes (max: {max})")]
    ValueTooLarge { size: usize, max: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StorageError {
    pub fn corruption(target: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Corruption {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn checksum_mismatch(target: impl Into<String>, expected: u32, actual: u32) -> Self {
        StorageError::Corruption {
            target: target.into(),
            reason: format!(
                "checksum mismatch (expected {:08x}, got {:08x})",
                expected, actual
            ),
        }
    }

    /// Rebuild an I/O error so it can be handed to every waiter of a failed batch.
    pub fn io_like(err: &std::io::Error) -> Self {
        StorageError::Io(std::io::Error::new(err.kind(), err.to_string()))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corruption { .. })
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Io(std::io::Error::other(format!(
            "background task failed: {err}"
        )))
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
