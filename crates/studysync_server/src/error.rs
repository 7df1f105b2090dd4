//! Error types for the reference remote.

use studysync_protocol::{ChangeKind, EntityKey};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the reference remote.
///
/// These are protocol violations and lookups that fail, not verdicts on a
/// change: a change the remote refuses is an `ApplyResponse::Rejected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A change kind was sent with a base version it cannot carry.
    #[error("{kind:?} change for {key} has an invalid base version")]
    InvalidBaseVersion {
        /// Change kind.
        kind: ChangeKind,
        /// Target entity.
        key: EntityKey,
    },

    /// The entity has never existed on the remote.
    #[error("entity not found: {0}")]
    NotFound(EntityKey),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::InvalidBaseVersion { .. }
                | ServerError::NotFound(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}
