//! Error types for the sync engine.

use studysync_protocol::{ChangeId, EntityKey, ProtocolError};
use studysync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The queue could not be persisted or loaded.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The persisted queue could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote request did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// An edit targets an entity whose deletion is already queued.
    #[error("entity {0} is pending deletion")]
    EntityDeleted(EntityKey),

    /// No pending change has the given id.
    #[error("unknown change {0}")]
    UnknownChange(ChangeId),

    /// No pending conflict exists for the entity.
    #[error("no pending conflict for {0}")]
    NoConflict(EntityKey),

    /// No dead letter has the given id.
    #[error("no dead letter for change {0}")]
    NoDeadLetter(ChangeId),

    /// A background task panicked or was lost before reporting back.
    #[error("sync task failed: {0}")]
    TaskFailed(String),

    /// The orchestrator has stopped and no longer accepts commands.
    #[error("sync orchestrator stopped")]
    Stopped,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::TaskFailed(_) => true,
            _ => false,
        }
    }
}
