//! Error types for byte-level storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the store.
    #[error("read beyond end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current store size.
        size: u64,
    },

    /// Another process holds the exclusive lock on the file.
    #[error("storage file is locked by another process")]
    Locked,

    /// A write was attempted on a backend opened read-only.
    #[error("storage backend is read-only")]
    ReadOnly,
}
