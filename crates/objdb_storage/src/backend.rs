//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store underneath an ObjDB record log.
///
/// Backends hold an opaque, append-only byte sequence. The log format
/// (blocks, records, checksums) is interpreted entirely by the layer
/// above; a backend only needs to hand back exactly the bytes that were
/// appended.
///
/// # Invariants
///
/// - `append` returns the offset the data was written at, which equals
///   the size of the store before the call
/// - `read_at` returns exactly the bytes previously written there
/// - after `sync` returns, all appended data survives process death
/// - backends are `Send + Sync`; interior locking keeps access consistent
///
/// # Implementors
///
/// - [`super::FileBackend`] for persistent stores
/// - [`super::InMemoryBackend`] for tests and ephemeral stores
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends
    /// beyond the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data at the end of the store and returns the offset it
    /// was written at.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the backend is read-only.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// This is the offset the next `append` will write at.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// Stronger than `flush`: after this returns, the data is on disk,
    /// not merely handed to the OS.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the store to `new_size` bytes.
    ///
    /// Used by log replay to cut off a partially written tail.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size, if the
    /// backend is read-only, or on I/O failure.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
