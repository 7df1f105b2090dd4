//! Conflict records and resolution policies.

use crate::change::{Change, ChangeKind};
use crate::payload::Payload;
use crate::types::{ChangeId, EntityKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle state of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    /// Waiting for a user decision; the entity is suspended.
    Pending,
    /// Settled by policy without user involvement.
    AutoResolved,
    /// Settled by an explicit resolution call.
    ManuallyResolved,
}

/// A local change whose base version no longer matches the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    /// Conflicting entity.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Id of the local change that was converted into this record.
    pub change_id: ChangeId,
    /// Kind of the local change.
    pub local_kind: ChangeKind,
    /// Fields the local change tried to write.
    pub local_payload: Payload,
    /// Remote's current fields.
    pub remote_payload: Payload,
    /// Version the local change was authored against.
    pub local_base_version: Option<Version>,
    /// Remote's current version.
    pub remote_version: Version,
    /// True if the remote has deleted the entity.
    pub remote_deleted: bool,
    /// Fields written on both sides, when known.
    pub overlapping_fields: BTreeSet<String>,
    /// Authoring time of the local change.
    pub local_created_at: Timestamp,
    /// Acting user of the local change.
    pub owner_id: String,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
    /// Resolution state.
    pub resolution: ConflictState,
}

impl ConflictRecord {
    /// Creates a pending conflict for `change` against the remote state.
    pub fn pending(
        change: &Change,
        remote_version: Version,
        remote_payload: Payload,
        remote_deleted: bool,
        overlapping_fields: BTreeSet<String>,
    ) -> Self {
        Self {
            key: change.key.clone(),
            change_id: change.id,
            local_kind: change.kind,
            local_payload: change.payload.clone(),
            remote_payload,
            local_base_version: change.base_version,
            remote_version,
            remote_deleted,
            overlapping_fields,
            local_created_at: change.created_at,
            owner_id: change.owner_id.clone(),
            detected_at: Timestamp::now(),
            resolution: ConflictState::Pending,
        }
    }

    /// Returns true while the record waits for a user decision.
    pub fn is_pending(&self) -> bool {
        self.resolution == ConflictState::Pending
    }

    /// Marks the record as manually resolved.
    pub fn mark_resolved(&mut self) {
        self.resolution = ConflictState::ManuallyResolved;
    }

    /// Marks the record as settled by policy without a user decision.
    pub fn mark_auto_resolved(&mut self) {
        self.resolution = ConflictState::AutoResolved;
    }
}

/// How conflicts are settled for one entity type.
///
/// Disjoint edits (local and remote touched different fields) are merged
/// automatically under every policy except [`ConflictPolicy::ManualOnly`].
/// The policy decides what happens when both sides wrote the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Merge disjoint edits; escalate overlapping ones to the user.
    AutoMerge,
    /// Merge disjoint edits; settle overlaps by the later write.
    ///
    /// Compares client wall clocks with server time, which are not
    /// synchronized; only suitable for low-stakes data such as cursor
    /// positions or presence.
    LastWriteWins,
    /// Escalate every conflict to the user.
    ManualOnly,
}

impl ConflictPolicy {
    /// Returns true if disjoint edits are merged without the user.
    pub fn merges_disjoint(&self) -> bool {
        !matches!(self, ConflictPolicy::ManualOnly)
    }

    /// Returns true if overlapping edits are settled without the user.
    pub fn auto_resolves_overlap(&self) -> bool {
        matches!(self, ConflictPolicy::LastWriteWins)
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::AutoMerge
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::AutoMerge => write!(f, "auto-merge"),
            ConflictPolicy::LastWriteWins => write!(f, "last-write-wins"),
            ConflictPolicy::ManualOnly => write!(f, "manual-only"),
        }
    }
}
