//! Conflict detection and resolution.
//!
//! A conflict is reported when the remote copy of an entity has moved past
//! the version a local change was authored against. The resolver compares
//! the fields the local change writes with the fields the remote wrote since
//! that base version, then applies the entity type's [`ConflictPolicy`]:
//!
//! | Overlap | AutoMerge | LastWriteWins | ManualOnly |
//! |---------|-----------|---------------|------------|
//! | none    | merge     | merge         | escalate   |
//! | some    | escalate  | later wins    | escalate   |
//!
//! When the remote cannot say which fields changed, or has deleted the
//! entity, every field is assumed to overlap.

use crate::config::PolicyTable;
use std::collections::BTreeSet;
use studysync_protocol::{Change, ChangeKind, ConflictPolicy, ConflictRecord, RemoteEntity};
use tracing::debug;

/// What to do with a change that hit a version conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Edits were disjoint; resend the change against the remote version.
    Merged(Change),
    /// Overlapping edits settled by timestamp; resend what survived.
    LastWriteWins(Change),
    /// The remote already reflects the outcome; nothing needs sending.
    Superseded,
    /// A user has to decide.
    Escalated(ConflictRecord),
}

/// Applies per-entity-type conflict policies.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policies: PolicyTable,
}

impl ConflictResolver {
    /// Creates a resolver over a policy table.
    pub fn new(policies: PolicyTable) -> Self {
        Self { policies }
    }

    /// Returns the policy table.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Decides how to settle `change` against the remote's current state.
    pub fn resolve(&self, change: &Change, remote: &RemoteEntity) -> Resolution {
        let policy = self.policies.policy_for(change.entity_type());
        let resolution = match change.kind {
            ChangeKind::Delete => Self::resolve_delete(policy, change, remote),
            ChangeKind::Create | ChangeKind::Update => Self::resolve_write(policy, change, remote),
        };
        debug!(
            change_id = %change.id,
            entity = %change.key,
            %policy,
            remote_version = %remote.version,
            outcome = resolution.label(),
            "conflict resolved"
        );
        resolution
    }

    /// Builds the audit record for a conflict settled without a user decision.
    pub fn auto_resolved_record(&self, change: &Change, remote: &RemoteEntity) -> ConflictRecord {
        let mut record = ConflictRecord::pending(
            change,
            remote.version,
            remote.payload.clone(),
            remote.deleted,
            overlapping_fields(change, remote),
        );
        record.mark_auto_resolved();
        record
    }

    fn resolve_write(policy: ConflictPolicy, change: &Change, remote: &RemoteEntity) -> Resolution {
        let overlap = overlapping_fields(change, remote);

        if !policy.merges_disjoint() {
            return escalate(change, remote, overlap);
        }
        if overlap.is_empty() {
            return Resolution::Merged(rebase(change, remote, change.payload.clone()));
        }
        if !policy.auto_resolves_overlap() {
            return escalate(change, remote, overlap);
        }

        if local_is_newer(change, remote) {
            Resolution::LastWriteWins(rebase(change, remote, change.payload.clone()))
        } else {
            let remaining = change.payload.without(&overlap);
            if remaining.is_empty() || remote.deleted {
                Resolution::Superseded
            } else {
                Resolution::LastWriteWins(rebase(change, remote, remaining))
            }
        }
    }

    fn resolve_delete(policy: ConflictPolicy, change: &Change, remote: &RemoteEntity) -> Resolution {
        if remote.deleted {
            return Resolution::Superseded;
        }
        if !policy.auto_resolves_overlap() {
            return escalate(change, remote, remote.payload.fields().map(String::from).collect());
        }

        if local_is_newer(change, remote) {
            let mut resend = change.clone();
            resend.base_version = Some(remote.version);
            Resolution::LastWriteWins(resend)
        } else {
            Resolution::Superseded
        }
    }
}

impl Resolution {
    fn label(&self) -> &'static str {
        match self {
            Resolution::Merged(_) => "merged",
            Resolution::LastWriteWins(_) => "last_write_wins",
            Resolution::Superseded => "superseded",
            Resolution::Escalated(_) => "escalated",
        }
    }
}

fn overlapping_fields(change: &Change, remote: &RemoteEntity) -> BTreeSet<String> {
    match &remote.changed_since {
        Some(changed) if !remote.deleted => change.payload.overlap(changed),
        _ => change.payload.fields().map(String::from).collect(),
    }
}

/// Missing server time counts in favour of the local edit.
fn local_is_newer(change: &Change, remote: &RemoteEntity) -> bool {
    remote
        .updated_at
        .map_or(true, |remote_at| change.created_at >= remote_at)
}

/// Re-targets a change at the remote's current version.
///
/// A create that collided with an existing entity becomes an update; a write
/// to a remotely deleted entity becomes a create.
fn rebase(change: &Change, remote: &RemoteEntity, payload: studysync_protocol::Payload) -> Change {
    let mut rebased = change.clone();
    rebased.payload = payload;
    if remote.deleted {
        rebased.kind = ChangeKind::Create;
        rebased.base_version = None;
    } else {
        rebased.kind = ChangeKind::Update;
        rebased.base_version = Some(remote.version);
    }
    rebased
}

fn escalate(change: &Change, remote: &RemoteEntity, overlap: BTreeSet<String>) -> Resolution {
    Resolution::Escalated(ConflictRecord::pending(
        change,
        remote.version,
        remote.payload.clone(),
        remote.deleted,
        overlap,
    ))
}
