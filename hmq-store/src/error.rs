//! Store error types.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("store is closed")]
    Closed,

    #[error("invalid store state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    /// Returns whether this error indicates damaged data on disk.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::CorruptedRecord { .. }
                | StoreError::InvalidHeader { .. }
                | StoreError::RecordTooLarge { .. }
        )
    }
}
