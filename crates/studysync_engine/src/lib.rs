//! # StudySync Engine
//!
//! Offline change queue and reconciliation engine for StudySync.
//!
//! This crate provides:
//! - [`LocalChangeStore`]: durable, coalescing queue of local edits
//! - [`NetworkMonitor`]: debounced connectivity transitions
//! - [`RemoteClient`]: the remote reconciliation contract
//! - [`ConflictResolver`]: field-level conflict detection with per-type policies
//! - [`SyncOrchestrator`]: the replay state machine with retry and backoff
//! - [`StatusReporter`]: read-only status for UI consumers
//!
//! ## Architecture
//!
//! ```text
//! user edit ──> SyncHandle::enqueue ──> LocalChangeStore (persisted)
//!                                            │
//! NetworkMonitor ──watch──> SyncOrchestrator ┤ claim_next / mark_*
//!                                │           │
//!                                └──> RemoteClient::apply
//!                                        │ conflict
//!                                        └──> RemoteClient::fetch ──> ConflictResolver
//! ```
//!
//! ## Key Invariants
//!
//! - An edit is durable before `enqueue` returns
//! - At most one pending create/update per entity; later edits coalesce
//! - At most one in-flight call per entity
//! - Within one entity, changes reach the remote in enqueue order
//! - The remote deduplicates replays by change id

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod network;
mod orchestrator;
mod resolver;
mod status;
mod store;
mod transport;

pub use config::{MonitorConfig, PolicyTable, RetryConfig, StoreConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use network::{ConnectivityProbe, Debouncer, NetworkMonitor, NetworkStatus};
pub use orchestrator::{SyncHandle, SyncOrchestrator};
pub use resolver::{ConflictResolver, Resolution};
pub use status::{OrchestratorState, RejectedChange, StatusReporter, SyncStatus};
pub use store::{EnqueueOutcome, FailureOutcome, LocalChangeStore};
pub use transport::{MockRemote, MockReply, RemoteClient};
