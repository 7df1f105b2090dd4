//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The stored snapshot is too large to load into memory.
    #[error("snapshot too large: {size} bytes")]
    TooLarge {
        /// Size of the stored snapshot.
        size: u64,
    },

    /// The backend refused the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    /// Returns true if the error came from the operating system.
    pub fn is_io(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}
