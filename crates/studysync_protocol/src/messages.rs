//! Remote reconciliation messages.
//!
//! The contract is transport-agnostic: a request carries one change, the
//! response reports whether the remote applied it, detected a version
//! conflict, or rejected it for good. Transport-level failures are not
//! part of the response type; they surface as errors from the client.

use crate::change::{Change, ChangeKind};
use crate::payload::Payload;
use crate::types::{ChangeId, EntityKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Request to apply one change on the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Change id; the remote deduplicates replays by it.
    pub id: ChangeId,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Target entity.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Fields to write.
    pub payload: Payload,
    /// Version the change was authored against.
    pub base_version: Option<Version>,
    /// Local authoring time.
    pub created_at: Timestamp,
    /// Acting user.
    pub owner_id: String,
}

impl From<&Change> for ApplyRequest {
    fn from(change: &Change) -> Self {
        Self {
            id: change.id,
            kind: change.kind,
            key: change.key.clone(),
            payload: change.payload.clone(),
            base_version: change.base_version,
            created_at: change.created_at,
            owner_id: change.owner_id.clone(),
        }
    }
}

/// Remote verdict on an [`ApplyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyResponse {
    /// The change was applied (or had already been applied).
    #[serde(rename_all = "camelCase")]
    Applied {
        /// Entity version after the change.
        new_version: Version,
    },
    /// The remote copy moved past the change's base version.
    #[serde(rename_all = "camelCase")]
    Conflict {
        /// Remote's current version.
        remote_version: Version,
        /// Remote's current payload.
        remote_payload: Payload,
    },
    /// The change can never be applied (validation, permission, schema).
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
}

impl ApplyResponse {
    /// Creates an applied response.
    pub fn applied(new_version: Version) -> Self {
        Self::Applied { new_version }
    }

    /// Creates a rejected response.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns true if the change was applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// The remote's current copy of an entity, fetched to resolve a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    /// Entity identity.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Current remote version.
    pub version: Version,
    /// Current remote fields.
    pub payload: Payload,
    /// Server-side time of the latest write, when known.
    pub updated_at: Option<Timestamp>,
    /// True if the entity has been deleted remotely.
    pub deleted: bool,
    /// Fields written remotely after the requested base version.
    ///
    /// `None` when the remote cannot say; callers must then assume every
    /// field may have changed.
    pub changed_since: Option<BTreeSet<String>>,
}
