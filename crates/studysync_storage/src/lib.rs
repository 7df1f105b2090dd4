//! # StudySync Storage
//!
//! Durable byte storage for the StudySync offline change queue.
//!
//! Backends are **opaque byte stores** holding exactly one snapshot.
//! They do not interpret the bytes they hold; the queue owns the
//! snapshot format.
//!
//! ## Design Principles
//!
//! - A snapshot is replaced as a whole, atomically
//! - After `replace` returns, the new snapshot survives process termination
//! - A failed `replace` leaves the previous snapshot intact
//! - Must be `Send + Sync` so the queue can be shared across tasks
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral queues
//! - [`FileBackend`] - For persistent queues using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use studysync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.replace(b"snapshot v1").unwrap();
//! backend.replace(b"snapshot v2").unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"snapshot v2");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
