//! Versioned entity table with per-version field history.

use std::collections::{BTreeSet, HashMap, VecDeque};
use studysync_protocol::{EntityKey, Payload, RemoteEntity, Timestamp, Version};

/// Remote copy of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Current version; bumped by every write.
    pub version: Version,
    /// Current fields (empty once deleted).
    pub payload: Payload,
    /// Time of the latest write.
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
    /// Fields written by each recent version, oldest first.
    history: VecDeque<(Version, BTreeSet<String>)>,
}

impl EntityRecord {
    /// Returns the fields written after `since`.
    ///
    /// `None` when the history no longer reaches back that far.
    pub fn changed_since(&self, since: Version) -> Option<BTreeSet<String>> {
        if since >= self.version {
            return Some(BTreeSet::new());
        }
        let oldest = self.history.front()?.0;
        if oldest > since.next() {
            return None;
        }
        Some(
            self.history
                .iter()
                .filter(|(v, _)| *v > since)
                .flat_map(|(_, fields)| fields.iter().cloned())
                .collect(),
        )
    }

    fn record(&mut self, fields: BTreeSet<String>, limit: usize) {
        self.history.push_back((self.version, fields));
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// All entities known to the remote.
#[derive(Debug)]
pub struct EntityTable {
    entities: HashMap<EntityKey, EntityRecord>,
    history_limit: usize,
}

impl EntityTable {
    /// Creates an empty table keeping `history_limit` versions per entity.
    pub fn new(history_limit: usize) -> Self {
        Self {
            entities: HashMap::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Returns the record for `key`, tombstones included.
    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.entities.get(key)
    }

    /// Returns the number of live (not deleted) entities.
    pub fn live_count(&self) -> usize {
        self.entities.values().filter(|r| !r.deleted).count()
    }

    /// Writes a full payload, creating or reviving the entity.
    pub fn create(&mut self, key: &EntityKey, payload: Payload, at: Timestamp) -> Version {
        let limit = self.history_limit;
        let fields: BTreeSet<String> = payload.fields().map(str::to_owned).collect();
        let record = self
            .entities
            .entry(key.clone())
            .or_insert_with(|| EntityRecord {
                version: Version(0),
                payload: Payload::new(),
                updated_at: at,
                deleted: true,
                history: VecDeque::new(),
            });

        // A revived entity starts from a clean payload; every old field is
        // considered rewritten.
        let mut touched = record.payload.fields().map(str::to_owned).collect::<BTreeSet<_>>();
        touched.extend(fields);

        record.version = record.version.next();
        record.payload = payload;
        record.updated_at = at;
        record.deleted = false;
        record.record(touched, limit);
        record.version
    }

    /// Overlays `patch` on a live entity.
    ///
    /// Returns `None` if the entity is missing or deleted.
    pub fn update(&mut self, key: &EntityKey, patch: Payload, at: Timestamp) -> Option<Version> {
        let limit = self.history_limit;
        let record = self.entities.get_mut(key).filter(|r| !r.deleted)?;
        let fields = patch.fields().map(str::to_owned).collect();

        record.version = record.version.next();
        record.payload.merge(patch);
        record.updated_at = at;
        record.record(fields, limit);
        Some(record.version)
    }

    /// Tombstones a live entity.
    ///
    /// Returns `None` if the entity is missing or already deleted.
    pub fn delete(&mut self, key: &EntityKey, at: Timestamp) -> Option<Version> {
        let limit = self.history_limit;
        let record = self.entities.get_mut(key).filter(|r| !r.deleted)?;
        let fields = record.payload.fields().map(str::to_owned).collect();

        record.version = record.version.next();
        record.payload = Payload::new();
        record.updated_at = at;
        record.deleted = true;
        record.record(fields, limit);
        Some(record.version)
    }

    /// Builds the fetch view of an entity.
    pub fn view(&self, key: &EntityKey, since: Option<Version>) -> Option<RemoteEntity> {
        let record = self.entities.get(key)?;
        Some(RemoteEntity {
            key: key.clone(),
            version: record.version,
            payload: record.payload.clone(),
            updated_at: Some(record.updated_at),
            deleted: record.deleted,
            changed_since: since.and_then(|v| record.changed_since(v)),
        })
    }
}
