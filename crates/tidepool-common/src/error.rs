//! Error types for Tidepool.

use thiserror::Error;

/// Result type alias using TidepoolError.
pub type Result<T> = std::result::Result<T, TidepoolError>;

/// Errors that can occur in Tidepool operations.
#[derive(Debug, Error)]
pub enum TidepoolError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disk manager has been shut down")]
    DiskClosed,

    // Buffer errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page ids exhausted after {last_page_id}")]
    PageIdsExhausted { last_page_id: i32 },

    #[error("Invalid page id: {page_id}")]
    InvalidPageId { page_id: i32 },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl TidepoolError {
    /// Returns true if the caller can retry after releasing resources.
    ///
    /// Only capacity exhaustion qualifies. Disk failures leave the affected
    /// page in an undefined state and must not be retried blindly.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TidepoolError::BufferPoolFull)
    }
}
