//! File-based storage backend for persistent queues.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A file-based storage backend.
///
/// This backend keeps the snapshot in a single file. Data survives
/// process restarts.
///
/// # Durability
///
/// `replace()` writes the new snapshot to a temporary file in the same
/// directory, calls `File::sync_all()` on it, renames it over the target
/// and finally syncs the parent directory. A crash at any point leaves
/// either the old or the new snapshot on disk.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
/// Internal locking ensures consistent access.
///
/// # Example
///
/// ```no_run
/// use studysync_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("queue.ssq")).unwrap();
/// backend.replace(b"persistent snapshot").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = Self::open_file(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Opens an existing file without creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_file(path: &Path) -> StorageResult<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    #[cfg(unix)]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        File::open(self.parent_dir())?.sync_all()?;
        Ok(())
    }

    // Directory handles cannot be synced on this platform; the rename
    // itself is the commit point.
    #[cfg(not(unix))]
    fn sync_parent_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let mut file = self.file.write();
        let mut size = self.size.write();

        let mut staged = NamedTempFile::new_in(self.parent_dir())?;
        staged.write_all(data)?;
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| e.error)?;
        self.sync_parent_dir()?;

        *file = Self::open_file(&self.path)?;
        *size = data.len() as u64;

        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(backend.is_empty().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn file_replace_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.replace(b"hello world").unwrap();
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_all().unwrap(), b"hello world");

        backend.replace(b"bye").unwrap();
        assert_eq!(backend.size().unwrap(), 3);
        assert_eq!(backend.read_all().unwrap(), b"bye");
    }

    #[test]
    fn file_read_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.replace(b"hello world").unwrap();

        let data = backend.read_at(6, 5).unwrap();
        assert_eq!(&data, b"world");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.replace(b"hello").unwrap();

        let result = backend.read_at(10, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.replace(b"persistent data").unwrap();
        }

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(backend.size().unwrap(), 15);
            assert_eq!(backend.read_all().unwrap(), b"persistent data");
        }
    }

    #[test]
    fn file_replace_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let mut backend = FileBackend::open(&path).unwrap();
        for i in 0..5u8 {
            backend.replace(&[i; 32]).unwrap();
        }

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("queue.ssq");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.ssq");

        assert!(FileBackend::open_existing(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.path(), path);
    }
}
