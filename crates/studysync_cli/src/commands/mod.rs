//! CLI command implementations.

pub mod conflicts;
pub mod dead_letters;
pub mod inspect;
pub mod pending;
pub mod verify;

use std::path::Path;
use studysync_protocol::{QueueSnapshot, SnapshotHeader};
use studysync_storage::{FileBackend, StorageBackend};
use tracing::debug;

/// A queue file read from disk.
pub struct LoadedQueue {
    /// Size of the file in bytes.
    pub file_size: u64,
    /// Envelope header, `None` for an empty file.
    pub header: Option<SnapshotHeader>,
    /// Decoded queue contents.
    pub snapshot: QueueSnapshot,
}

/// Reads and decodes the queue file at `path`.
///
/// An empty file is an empty queue.
pub fn load(path: &Path) -> Result<LoadedQueue, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue file found at {:?}", path).into());
    }

    let backend = FileBackend::open_existing(path)?;
    let file_size = backend.size()?;
    let bytes = backend.read_all()?;
    debug!(path = %path.display(), bytes = file_size, "read queue file");

    if bytes.is_empty() {
        return Ok(LoadedQueue {
            file_size,
            header: None,
            snapshot: QueueSnapshot::default(),
        });
    }

    let header = SnapshotHeader::parse(&bytes)?;
    let snapshot = QueueSnapshot::decode(&bytes)?;
    Ok(LoadedQueue {
        file_size,
        header: Some(header),
        snapshot,
    })
}

/// Prints `value` as pretty JSON.
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
