//! Queued changes.

use crate::payload::Payload;
use crate::types::{ChangeId, EntityKey, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of mutation a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entity is created with a client-generated id.
    Create,
    /// Some fields of an existing entity are rewritten.
    Update,
    /// Entity is deleted.
    Delete,
}

impl ChangeKind {
    /// Returns true for kinds that carry field data.
    #[must_use]
    pub const fn writes_fields(&self) -> bool {
        matches!(self, ChangeKind::Create | ChangeKind::Update)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// One intended mutation against a remote entity.
///
/// # Fields
///
/// - `id`: locally generated, stable across retries
/// - `key`: target entity type and id
/// - `base_version`: remote version the edit was authored against
///   (`None` for creates); drives conflict detection
/// - `created_at`: authoring time of the earliest coalesced edit
/// - `retry_count`: failed replay attempts so far
/// - `owner_id`: acting user, echoed to the remote for authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Unique change id.
    pub id: ChangeId,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Target entity.
    #[serde(flatten)]
    pub key: EntityKey,
    /// Fields written by this change (empty for deletes).
    pub payload: Payload,
    /// Remote version this change was authored against.
    pub base_version: Option<Version>,
    /// Local authoring time.
    pub created_at: Timestamp,
    /// Number of failed replay attempts.
    pub retry_count: u32,
    /// Acting user.
    pub owner_id: String,
}

impl Change {
    fn new(
        kind: ChangeKind,
        key: EntityKey,
        payload: Payload,
        base_version: Option<Version>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            kind,
            key,
            payload,
            base_version,
            created_at: Timestamp::now(),
            retry_count: 0,
            owner_id: owner_id.into(),
        }
    }

    /// Creates a change that creates a new entity.
    pub fn create(key: EntityKey, payload: Payload, owner_id: impl Into<String>) -> Self {
        Self::new(ChangeKind::Create, key, payload, None, owner_id)
    }

    /// Creates a change that rewrites fields of an entity known at `base_version`.
    pub fn update(
        key: EntityKey,
        payload: Payload,
        base_version: Version,
        owner_id: impl Into<String>,
    ) -> Self {
        Self::new(ChangeKind::Update, key, payload, Some(base_version), owner_id)
    }

    /// Creates a change that deletes an entity known at `base_version`.
    pub fn delete(key: EntityKey, base_version: Version, owner_id: impl Into<String>) -> Self {
        Self::new(
            ChangeKind::Delete,
            key,
            Payload::new(),
            Some(base_version),
            owner_id,
        )
    }

    /// Overrides the authoring time.
    #[must_use]
    pub fn with_created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns the entity type discriminator.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.key.entity_type
    }

    /// Returns the entity id.
    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.key.entity_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_kind_and_base() {
        let key = EntityKey::new("note", "n1");
        let create = Change::create(key.clone(), Payload::new(), "u1");
        assert_eq!(create.kind, ChangeKind::Create);
        assert_eq!(create.base_version, None);

        let update = Change::update(key.clone(), Payload::new(), Version(3), "u1");
        assert_eq!(update.kind, ChangeKind::Update);
        assert_eq!(update.base_version, Some(Version(3)));

        let delete = Change::delete(key, Version(4), "u1");
        assert_eq!(delete.kind, ChangeKind::Delete);
        assert!(delete.payload.is_empty());
        assert!(!delete.kind.writes_fields());
    }

    #[test]
    fn serializes_with_flat_entity_fields() {
        let change = Change::update(
            EntityKey::new("task", "t1"),
            Payload::from_fields([("done", json!(true))]),
            Version(1),
            "u1",
        )
        .with_created_at(Timestamp(10));

        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["entityType"], json!("task"));
        assert_eq!(value["entityId"], json!("t1"));
        assert_eq!(value["kind"], json!("update"));
        assert_eq!(value["baseVersion"], json!(1));
        assert_eq!(value["createdAt"], json!(10));
        assert_eq!(value["payload"]["done"], json!(true));
    }
}
