//! # StudySync Testkit
//!
//! Test utilities for the StudySync change queue.
//!
//! This crate provides:
//! - Queue fixtures that survive simulated restarts
//! - A running-engine fixture over the reference remote
//! - A loopback remote client with fault injection
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use studysync_testkit::prelude::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn drains() {
//!     let engine = TestEngine::start(
//!         TestQueue::memory(),
//!         ReferenceRemote::default(),
//!         SyncConfig::default(),
//!         true,
//!     );
//!     engine.handle.enqueue(change)?;
//!     engine.drained().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod loopback;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::loopback::*;
}

pub use fixtures::*;
pub use generators::*;
pub use loopback::*;
