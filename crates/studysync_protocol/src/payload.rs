//! Entity payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;

/// The fields written by a change.
///
/// The queue treats field values as opaque; it only looks at field names
/// (to detect overlapping edits) and merges maps. Update payloads are
/// partial: they carry only the fields the user touched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, Value>);

impl Payload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a payload from field/value pairs.
    pub fn from_fields<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    /// Returns true if the payload sets the given field.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// Returns the set field names in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterates over field/value pairs.
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlays `later` on top of this payload; fields in `later` win.
    pub fn merge(&mut self, later: Payload) {
        self.0.extend(later.0);
    }

    /// Returns the fields of this payload that also appear in `fields`.
    #[must_use]
    pub fn overlap<'a, I>(&self, fields: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        fields
            .into_iter()
            .filter(|f| self.0.contains_key(f.as_str()))
            .cloned()
            .collect()
    }

    /// Returns a copy without the given fields.
    #[must_use]
    pub fn without(&self, fields: &BTreeSet<String>) -> Payload {
        Payload(
            self.0
                .iter()
                .filter(|(k, _)| !fields.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Returns the field names whose values differ between the payloads,
    /// including fields present on only one side.
    #[must_use]
    pub fn diff_fields(&self, other: &Payload) -> BTreeSet<String> {
        let mut changed: BTreeSet<String> = self
            .0
            .iter()
            .filter(|(k, v)| other.0.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(
            other
                .0
                .keys()
                .filter(|k| !self.0.contains_key(*k))
                .cloned(),
        );
        changed
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self::from_fields(iter)
    }
}

impl<'a> IntoIterator for &'a Payload {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn merge_later_fields_win() {
        let mut base = Payload::from_fields([("title", json!("a")), ("body", json!("x"))]);
        base.merge(Payload::from_fields([("title", json!("b")), ("done", json!(true))]));

        assert_eq!(base.get("title"), Some(&json!("b")));
        assert_eq!(base.get("body"), Some(&json!("x")));
        assert_eq!(base.get("done"), Some(&json!(true)));
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn overlap_and_without() {
        let payload = Payload::from_fields([("title", json!("a")), ("body", json!("x"))]);
        let remote = fields(&["body", "tags"]);

        assert_eq!(payload.overlap(&remote), fields(&["body"]));
        let rest = payload.without(&remote);
        assert_eq!(rest.fields().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn diff_fields_covers_both_sides() {
        let a = Payload::from_fields([("title", json!("a")), ("body", json!("x"))]);
        let b = Payload::from_fields([("title", json!("a")), ("body", json!("y")), ("due", json!(3))]);

        assert_eq!(a.diff_fields(&b), fields(&["body", "due"]));
        assert!(a.diff_fields(&a).is_empty());
    }

    #[test]
    fn serializes_as_plain_map() {
        let payload = Payload::from_fields([("title", json!("Read ch. 4"))]);
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"title":"Read ch. 4"}"#
        );
    }

    fn payload_strategy() -> impl Strategy<Value = Payload> {
        prop::collection::btree_map("[a-f]", any::<i32>().prop_map(|n| json!(n)), 0..6)
            .prop_map(|map| map.into_iter().collect())
    }

    proptest! {
        #[test]
        fn merge_keeps_every_field_and_later_wins(
            earlier in payload_strategy(),
            later in payload_strategy(),
        ) {
            let mut merged = earlier.clone();
            merged.merge(later.clone());

            for (field, value) in &later {
                prop_assert_eq!(merged.get(field), Some(value));
            }
            for (field, value) in &earlier {
                if !later.contains(field) {
                    prop_assert_eq!(merged.get(field), Some(value));
                }
            }
            let expected: BTreeSet<&str> = earlier.fields().chain(later.fields()).collect();
            prop_assert_eq!(merged.fields().collect::<BTreeSet<_>>(), expected);
        }

        #[test]
        fn overlap_and_remainder_partition_fields(
            payload in payload_strategy(),
            remote in prop::collection::btree_set("[a-h]", 0..6),
        ) {
            let overlap = payload.overlap(&remote);
            let rest = payload.without(&overlap);

            prop_assert!(overlap.iter().all(|f| payload.contains(f) && remote.contains(f)));
            prop_assert!(rest.fields().all(|f| !remote.contains(f)));
            prop_assert_eq!(overlap.len() + rest.len(), payload.len());
        }
    }
}
