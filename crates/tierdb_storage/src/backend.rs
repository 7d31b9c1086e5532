//! Store trait definition.

use crate::error::StorageResult;

/// A random-access byte store.
///
/// Stores are **opaque**: the engine owns every format (log records, disk
/// segment blocks, metadata snapshots) and a store only moves bytes.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `flush` pushes appended data to the OS, `sync` makes it durable
/// - Stores must be `Send + Sync` so readers can share them
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the store, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the store and returns its offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes pending writes.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes, which is where the next `append` writes.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the store to `new_size` bytes.
    ///
    /// Used to cut a torn tail off a log.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is
    /// greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads the whole store.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        self.read_at(0, size as usize)
    }
}
