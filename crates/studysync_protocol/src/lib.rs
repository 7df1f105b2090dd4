//! # StudySync Protocol
//!
//! Data model and wire types for the StudySync offline change queue.
//!
//! This crate provides:
//! - [`Change`]: one queued intended mutation against a remote entity
//! - [`ApplyRequest`] / [`ApplyResponse`]: the remote reconciliation contract
//! - [`RemoteEntity`]: the remote's current copy of an entity, used for diffs
//! - [`ConflictRecord`] and [`ConflictPolicy`] for conflict handling
//! - [`QueueSnapshot`]: the versioned, checksummed durable queue format
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod messages;
mod payload;
mod snapshot;
mod types;

pub use change::{Change, ChangeKind};
pub use conflict::{ConflictPolicy, ConflictRecord, ConflictState};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ApplyRequest, ApplyResponse, RemoteEntity};
pub use payload::Payload;
pub use snapshot::{
    DeadLetter, QueueSnapshot, QueuedChange, SnapshotHeader, SNAPSHOT_HEADER_SIZE,
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION,
};
pub use types::{ChangeId, EntityKey, Timestamp, Version};
