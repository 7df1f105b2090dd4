//! # StudySync Reference Remote
//!
//! In-memory remote implementing the StudySync reconciliation contract.
//!
//! This crate provides:
//! - Apply handling with per-entity versions and conflict detection
//! - Deduplication of replayed changes by change id
//! - Per-version field history for conflict diffs
//! - Hooks to simulate edits from other devices
//!
//! # Contract
//!
//! - A Create on a live entity conflicts; a Create on a tombstone revives it
//! - An Update or Delete whose base version differs from the current one
//!   conflicts
//! - An Update of an entity that never existed is rejected
//! - A Delete of a missing or already deleted entity succeeds
//! - Applied and rejected outcomes are cached by change id and returned
//!   unchanged on replay; conflicts are not cached, so a rebased change
//!   can be resent under the same id

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod entities;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use entities::{EntityRecord, EntityTable};
pub use error::{ServerError, ServerResult};
pub use handler::{HandlerContext, RequestHandler};
pub use server::ReferenceRemote;
