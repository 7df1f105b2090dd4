//! In-memory storage backend for testing.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory storage backend.
///
/// This backend stores the snapshot in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral queues that don't need persistence
///
/// Clones share the same buffer, so a test can drop a queue and reopen
/// it from a clone to simulate a process restart.
///
/// # Example
///
/// ```rust
/// use studysync_storage::{StorageBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let survivor = backend.clone();
/// backend.replace(b"test data").unwrap();
/// drop(backend);
/// assert_eq!(survivor.size().unwrap(), 9);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a copy of the stored snapshot.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes every subsequent `replace` fail until switched off again.
    ///
    /// Used to exercise storage-failure paths (full disk, revoked
    /// permissions).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let offset_usize = offset as usize;
        let end = offset_usize.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[offset_usize..end].to_vec())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(
                "in-memory backend is failing writes".into(),
            ));
        }

        let mut data = self.data.write();
        data.clear();
        data.extend_from_slice(new_data);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        // Nothing buffered
        Ok(())
    }
}
