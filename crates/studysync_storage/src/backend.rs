//! Storage backend trait definition.

use crate::error::{StorageError, StorageResult};

/// A durable snapshot store for the offline change queue.
///
/// Backends hold one opaque byte snapshot. The queue rewrites the whole
/// snapshot after every mutation, so `replace` must be atomic: readers
/// observe either the previous snapshot or the new one, never a mix.
///
/// # Invariants
///
/// - `read_all` returns exactly the bytes of the last successful `replace`
/// - A successful `replace` is durable before it returns
/// - A failed `replace` leaves the previous snapshot readable
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The read would extend beyond the current size
    /// - An I/O error occurs
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Atomically replaces the stored snapshot with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data could not be made durable. The
    /// previous snapshot is left in place.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Returns the current size of the snapshot in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Reads the whole snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| StorageError::TooLarge { size })?;
        self.read_at(0, len)
    }

    /// Returns true if no snapshot has been written yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.size()? == 0)
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        (**self).replace(data)
    }

    fn size(&self) -> StorageResult<u64> {
        (**self).size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }
}
