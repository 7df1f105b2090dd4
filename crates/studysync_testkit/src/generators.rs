//! Property-based test generators using proptest.
//!
//! Keys are drawn from a deliberately small id space so that generated
//! edit scripts hit the same entity repeatedly and exercise coalescing.

use proptest::prelude::*;
use serde_json::Value;
use studysync_protocol::{Change, ChangeKind, EntityKey, Payload, Version};

/// Entity types used by generated data.
pub const ENTITY_TYPES: &[&str] = &["note", "task", "resource", "studyGroup"];

/// Strategy for entity type discriminators.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(ENTITY_TYPES).prop_map(str::to_owned)
}

/// Strategy for entity keys over a small id space.
pub fn entity_key_strategy() -> impl Strategy<Value = EntityKey> {
    (entity_type_strategy(), 0u8..4).prop_map(|(t, id)| EntityKey::new(t, format!("e{id}")))
}

/// Strategy for scalar JSON field values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
        "[a-z ]{0,16}".prop_map(Value::from),
        Just(Value::Null),
    ]
}

/// Strategy for payloads over a small field-name space.
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map("[a-e]", field_value_strategy(), 0..4)
        .prop_map(Payload::from_fields)
}

/// Strategy for non-empty payloads.
pub fn non_empty_payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map("[a-e]", field_value_strategy(), 1..4)
        .prop_map(Payload::from_fields)
}

/// Strategy for change kinds.
pub fn change_kind_strategy() -> impl Strategy<Value = ChangeKind> {
    prop_oneof![
        Just(ChangeKind::Create),
        Just(ChangeKind::Update),
        Just(ChangeKind::Delete),
    ]
}

/// Strategy for well-formed standalone changes.
pub fn change_strategy() -> impl Strategy<Value = Change> {
    (
        entity_key_strategy(),
        change_kind_strategy(),
        payload_strategy(),
        1u64..100,
    )
        .prop_map(|(key, kind, payload, base)| match kind {
            ChangeKind::Create => Change::create(key, payload, "user-1"),
            ChangeKind::Update => Change::update(key, payload, Version(base), "user-1"),
            ChangeKind::Delete => Change::delete(key, Version(base), "user-1"),
        })
}

/// One raw user action in an edit script.
///
/// The action is a wish; a script interpreter decides what it means given
/// whether the entity currently exists (an edit of a deleted entity
/// becomes a create).
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedEdit {
    /// Index of the target entity.
    pub entity: usize,
    /// Requested kind.
    pub kind: ChangeKind,
    /// Fields written.
    pub payload: Payload,
}

/// Strategy for edit scripts over `entities` entities.
pub fn edit_script_strategy(
    entities: usize,
    len: std::ops::Range<usize>,
) -> impl Strategy<Value = Vec<ScriptedEdit>> {
    let edit = (0..entities.max(1), change_kind_strategy(), non_empty_payload_strategy())
        .prop_map(|(entity, kind, payload)| ScriptedEdit {
            entity,
            kind,
            payload,
        });
    prop::collection::vec(edit, len)
}
