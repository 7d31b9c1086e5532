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

    /// Attempted to read beyond the end of a store.
    #[error("read beyond end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current store size.
        size: u64,
    },

    /// Attempted to truncate a store to a size larger than its current size.
    #[error("cannot truncate store of size {size} to {requested}")]
    InvalidTruncate {
        /// The requested size.
        requested: u64,
        /// The current store size.
        size: u64,
    },

    /// The requested store does not exist.
    #[error("store not found: {category}/{id}")]
    NotFound {
        /// Store category.
        category: String,
        /// Store id.
        id: u64,
    },

    /// The store directory is locked by another process.
    #[error("store directory locked: {0}")]
    Locked(String),
}

impl StorageError {
    /// Creates a not-found error for `(id, category)`.
    pub fn not_found(id: u64, category: &str) -> Self {
        Self::NotFound {
            category: category.to_string(),
            id,
        }
    }
}
