//! Durable local change store.
//!
//! The store is the single owner of the offline queue. Every mutating call
//! runs under one lock, rewrites the persisted snapshot, and only then
//! commits the new state in memory; a failed write leaves both the file and
//! the in-memory queue unchanged, and the error goes back to the caller.
//!
//! ## Ordering
//!
//! Each entry carries a sequence number. Within one entity, changes are
//! dispatched strictly in sequence order: only the entity's lowest-sequence
//! entry (its head) is ever a candidate for [`LocalChangeStore::peek_next`].
//! Across entities, candidates are taken in ready order, which is enqueue
//! order except that failed entries move to the back.
//!
//! ## In-flight marks
//!
//! In-flight marks and backoff deadlines live in memory only. After a
//! restart every pending change is eligible again, which relies on the
//! remote deduplicating replays by change id.

use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use studysync_protocol::{
    Change, ChangeId, ChangeKind, ConflictRecord, DeadLetter, EntityKey, Payload, QueueSnapshot,
    QueuedChange, Timestamp,
};
use studysync_storage::StorageBackend;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Result of [`LocalChangeStore::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The change was added as a new queue entry.
    Accepted,
    /// The change was merged into an unsent pending change for the entity.
    Coalesced,
    /// A delete cancelled an unsent local create; nothing will be sent.
    Collapsed,
}

/// Result of [`LocalChangeStore::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The change stays queued and will be retried.
    Requeued {
        /// Failed attempts so far.
        retry_count: u32,
    },
    /// The retry cap was exceeded; the change moved to the dead letters.
    DeadLettered,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    change: Change,
    last_error: Option<String>,
    attempted: bool,
    not_before: Option<Instant>,
}

impl Entry {
    fn is_unsent(&self, in_flight: &HashSet<ChangeId>) -> bool {
        !self.attempted && !in_flight.contains(&self.change.id)
    }
}

#[derive(Debug, Clone, Default)]
struct QueueState {
    /// Pending entries in ready order.
    pending: Vec<Entry>,
    dead_letters: Vec<DeadLetter>,
    conflicts: Vec<ConflictRecord>,
    next_seq: u64,
    in_flight: HashSet<ChangeId>,
}

impl QueueState {
    fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        Self {
            pending: snapshot
                .pending
                .into_iter()
                .map(|q| Entry {
                    seq: q.seq,
                    change: q.change,
                    last_error: q.last_error,
                    attempted: q.attempted,
                    not_before: None,
                })
                .collect(),
            dead_letters: snapshot.dead_letters,
            conflicts: snapshot.conflicts,
            next_seq: snapshot.next_seq,
            in_flight: HashSet::new(),
        }
    }

    fn to_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self
                .pending
                .iter()
                .map(|e| QueuedChange {
                    seq: e.seq,
                    change: e.change.clone(),
                    last_error: e.last_error.clone(),
                    attempted: e.attempted,
                })
                .collect(),
            dead_letters: self.dead_letters.clone(),
            conflicts: self.conflicts.clone(),
            next_seq: self.next_seq,
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn position(&self, id: ChangeId) -> SyncResult<usize> {
        self.pending
            .iter()
            .position(|e| e.change.id == id)
            .ok_or(SyncError::UnknownChange(id))
    }

    fn is_suspended(&self, key: &EntityKey) -> bool {
        self.conflicts.iter().any(|c| c.is_pending() && &c.key == key)
    }

    /// Index of the highest-sequence entry for `key`.
    fn tail_of(&self, key: &EntityKey) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.change.key == key)
            .max_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)
    }

    /// Index of the lowest-sequence entry for `key`.
    fn head_of(&self, key: &EntityKey) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, e)| &e.change.key == key)
            .min_by_key(|(_, e)| e.seq)
            .map(|(i, _)| i)
    }

    /// Gives every entry for `key` a fresh sequence number, keeping their
    /// relative order.
    fn renumber(&mut self, key: &EntityKey) {
        let mut indices: Vec<usize> = (0..self.pending.len())
            .filter(|&i| &self.pending[i].change.key == key)
            .collect();
        indices.sort_by_key(|&i| self.pending[i].seq);
        for i in indices {
            let seq = self.take_seq();
            self.pending[i].seq = seq;
        }
    }

    fn push(&mut self, change: Change, attempted: bool) {
        let seq = self.take_seq();
        self.pending.push(Entry {
            seq,
            change,
            last_error: None,
            attempted,
            not_before: None,
        });
    }

    fn enqueue(&mut self, change: Change) -> SyncResult<EnqueueOutcome> {
        let Some(tail) = self.tail_of(&change.key) else {
            self.push(change, false);
            return Ok(EnqueueOutcome::Accepted);
        };

        let unsent = self.pending[tail].is_unsent(&self.in_flight);
        let existing = &mut self.pending[tail];

        match (existing.change.kind, change.kind) {
            (ChangeKind::Delete, ChangeKind::Update) => Err(SyncError::EntityDeleted(change.key)),
            (ChangeKind::Delete, ChangeKind::Delete) => Ok(EnqueueOutcome::Coalesced),
            (ChangeKind::Delete, ChangeKind::Create) => {
                self.push(change, false);
                Ok(EnqueueOutcome::Accepted)
            }
            (ChangeKind::Create | ChangeKind::Update, ChangeKind::Create | ChangeKind::Update)
                if unsent =>
            {
                existing.change.payload.merge(change.payload);
                Ok(EnqueueOutcome::Coalesced)
            }
            (ChangeKind::Create, ChangeKind::Delete) if unsent => {
                self.pending.remove(tail);
                Ok(EnqueueOutcome::Collapsed)
            }
            (ChangeKind::Update, ChangeKind::Delete) if unsent => {
                let base_version = existing.change.base_version;
                let created_at = existing.change.created_at;
                existing.change = Change {
                    base_version,
                    created_at,
                    ..change
                };
                Ok(EnqueueOutcome::Coalesced)
            }
            _ => {
                self.push(change, false);
                Ok(EnqueueOutcome::Accepted)
            }
        }
    }

    fn heads(&self) -> HashMap<&EntityKey, u64> {
        let mut heads: HashMap<&EntityKey, u64> = HashMap::new();
        for entry in &self.pending {
            heads
                .entry(&entry.change.key)
                .and_modify(|seq| *seq = (*seq).min(entry.seq))
                .or_insert(entry.seq);
        }
        heads
    }

    /// Heads that are neither in flight nor suspended, in ready order.
    fn dispatchable(&self) -> impl Iterator<Item = &Entry> {
        let heads = self.heads();
        self.pending.iter().filter(move |e| {
            heads.get(&e.change.key) == Some(&e.seq)
                && !self.in_flight.contains(&e.change.id)
                && !self.is_suspended(&e.change.key)
        })
    }

    fn peek_at(&self, now: Instant) -> Option<&Entry> {
        self.dispatchable()
            .find(|e| e.not_before.map_or(true, |t| t <= now))
    }
}

struct Inner {
    backend: Box<dyn StorageBackend>,
    state: QueueState,
}

impl Inner {
    fn persist(&mut self, state: &QueueState) -> SyncResult<()> {
        let bytes = state.to_snapshot().encode()?;
        self.backend.replace(&bytes)?;
        Ok(())
    }

    /// Applies `f` to a copy of the state, persists it, then commits.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut QueueState) -> SyncResult<R>) -> SyncResult<R> {
        let mut next = self.state.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        self.state = next;
        Ok(out)
    }
}

/// Durable, ordered queue of pending changes.
///
/// See the [module docs](self) for ordering and durability guarantees.
pub struct LocalChangeStore {
    inner: Mutex<Inner>,
    config: StoreConfig,
}

impl LocalChangeStore {
    /// Opens the store, loading the last persisted snapshot.
    ///
    /// An empty backend yields an empty queue. A snapshot that cannot be
    /// decoded is an error; it is never silently discarded.
    pub fn open<B>(backend: B, config: StoreConfig) -> SyncResult<Self>
    where
        B: StorageBackend + 'static,
    {
        let state = if backend.is_empty()? {
            QueueState::default()
        } else {
            let bytes = backend.read_all()?;
            QueueState::from_snapshot(QueueSnapshot::decode(&bytes)?)
        };

        info!(
            pending = state.pending.len(),
            dead_letters = state.dead_letters.len(),
            conflicts = state.conflicts.len(),
            "opened change store"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                backend: Box::new(backend),
                state,
            }),
            config,
        })
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Queues a change, coalescing it with an unsent change for the same
    /// entity where possible.
    ///
    /// Returns only after the queue has been persisted. A storage error
    /// means the edit was not recorded.
    pub fn enqueue(&self, change: Change) -> SyncResult<EnqueueOutcome> {
        let id = change.id;
        let key = change.key.clone();
        let kind = change.kind;
        let outcome = self.inner.lock().mutate(|s| s.enqueue(change))?;
        debug!(change_id = %id, entity = %key, %kind, ?outcome, "enqueued change");
        Ok(outcome)
    }

    /// Returns the oldest change that may be sent now.
    ///
    /// Only the head of each entity is considered, and heads that are in
    /// flight, suspended by a conflict, or waiting out a backoff deadline are
    /// skipped.
    pub fn peek_next(&self) -> Option<Change> {
        self.inner
            .lock()
            .state
            .peek_at(Instant::now())
            .map(|e| e.change.clone())
    }

    /// Atomically picks the next sendable change and marks it in flight.
    pub fn claim_next(&self) -> Option<Change> {
        let mut inner = self.inner.lock();
        let change = inner.state.peek_at(Instant::now())?.change.clone();
        inner.state.in_flight.insert(change.id);
        Some(change)
    }

    /// Marks a pending change as in flight.
    pub fn mark_in_flight(&self, id: ChangeId) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        inner.state.position(id)?;
        inner.state.in_flight.insert(id);
        Ok(())
    }

    /// Removes a change the remote has accepted.
    pub fn mark_done(&self, id: ChangeId) -> SyncResult<Change> {
        let change = self.inner.lock().mutate(|s| {
            let pos = s.position(id)?;
            s.in_flight.remove(&id);
            Ok(s.pending.remove(pos).change)
        })?;
        debug!(change_id = %id, entity = %change.key, "change applied");
        Ok(change)
    }

    /// Records a transient failure.
    ///
    /// Increments the retry count and moves the change to the back of the
    /// ready order with an optional backoff deadline. Once the retry count
    /// exceeds the configured cap the change moves to the dead letters and is
    /// never retried automatically.
    pub fn mark_failed(
        &self,
        id: ChangeId,
        error: &str,
        retry_at: Option<Instant>,
    ) -> SyncResult<FailureOutcome> {
        let max_retries = self.config.max_retries;
        let outcome = self.inner.lock().mutate(|s| {
            let pos = s.position(id)?;
            s.in_flight.remove(&id);
            let mut entry = s.pending.remove(pos);
            entry.change.retry_count += 1;

            if entry.change.retry_count > max_retries {
                s.dead_letters.push(DeadLetter {
                    change: entry.change,
                    error: error.to_string(),
                    failed_at: Timestamp::now(),
                });
                return Ok(FailureOutcome::DeadLettered);
            }

            let retry_count = entry.change.retry_count;
            entry.last_error = Some(error.to_string());
            entry.attempted = true;
            entry.not_before = retry_at;
            s.pending.push(entry);
            Ok(FailureOutcome::Requeued { retry_count })
        })?;

        match outcome {
            FailureOutcome::DeadLettered => {
                warn!(change_id = %id, error, "retry cap exceeded, change dead-lettered");
            }
            FailureOutcome::Requeued { retry_count } => {
                debug!(change_id = %id, retry_count, error, "change requeued after failure");
            }
        }
        Ok(outcome)
    }

    /// Drops a change the remote refused permanently.
    pub fn mark_rejected(&self, id: ChangeId, reason: &str) -> SyncResult<Change> {
        let change = self.inner.lock().mutate(|s| {
            let pos = s.position(id)?;
            s.in_flight.remove(&id);
            Ok(s.pending.remove(pos).change)
        })?;
        warn!(change_id = %id, entity = %change.key, reason, "change rejected");
        Ok(change)
    }

    /// Replaces an in-flight change with its auto-merged successor.
    ///
    /// The merged change keeps its original id and its place at the front of
    /// the entity's slot.
    pub fn apply_merged(&self, change: Change) -> SyncResult<()> {
        let id = change.id;
        self.inner.lock().mutate(|s| {
            let pos = s.position(id)?;
            s.in_flight.remove(&id);
            let entry = &mut s.pending[pos];
            entry.change = change;
            entry.attempted = true;
            entry.last_error = None;
            entry.not_before = None;
            Ok(())
        })?;
        debug!(change_id = %id, "merged change requeued");
        Ok(())
    }

    /// Converts a change into a pending conflict and suspends its entity.
    pub fn suspend(&self, record: ConflictRecord) -> SyncResult<()> {
        let key = record.key.clone();
        self.inner.lock().mutate(|s| {
            let pos = s.position(record.change_id)?;
            s.in_flight.remove(&record.change_id);
            s.pending.remove(pos);
            s.conflicts.retain(|c| c.key != record.key);
            s.conflicts.push(record);
            Ok(())
        })?;
        info!(entity = %key, "entity suspended awaiting conflict resolution");
        Ok(())
    }

    /// Resolves a pending conflict with a user-supplied payload.
    ///
    /// Enqueues a fresh change authored against the remote version at the
    /// front of the entity's slot, merging in any later unsent edit to the
    /// same entity (later edits win per field), and resumes the entity.
    /// Returns the change that will be sent.
    pub fn resolve_conflict(&self, key: &EntityKey, payload: Payload) -> SyncResult<Change> {
        let change = self.inner.lock().mutate(|s| {
            let idx = s
                .conflicts
                .iter()
                .position(|c| c.is_pending() && &c.key == key)
                .ok_or_else(|| SyncError::NoConflict(key.clone()))?;
            let mut record = s.conflicts.remove(idx);
            record.mark_resolved();

            let mut change = if record.remote_deleted {
                Change::create(key.clone(), payload, record.owner_id.clone())
            } else {
                Change::update(
                    key.clone(),
                    payload,
                    record.remote_version,
                    record.owner_id.clone(),
                )
            };

            let seq = match s.head_of(key) {
                Some(head) => {
                    let entry = &s.pending[head];
                    let mergeable =
                        entry.is_unsent(&s.in_flight) && entry.change.kind.writes_fields();
                    let seq = entry.seq;
                    if mergeable {
                        let entry = s.pending.remove(head);
                        change.payload.merge(entry.change.payload);
                    } else {
                        s.renumber(key);
                    }
                    seq
                }
                None => s.take_seq(),
            };

            s.pending.insert(
                0,
                Entry {
                    seq,
                    change: change.clone(),
                    last_error: None,
                    attempted: false,
                    not_before: None,
                },
            );
            Ok(change)
        })?;
        info!(entity = %key, change_id = %change.id, "conflict resolved");
        Ok(change)
    }

    /// Drops a pending conflict, accepting the remote state as is.
    pub fn discard_conflict(&self, key: &EntityKey) -> SyncResult<ConflictRecord> {
        let record = self.inner.lock().mutate(|s| {
            let idx = s
                .conflicts
                .iter()
                .position(|c| c.is_pending() && &c.key == key)
                .ok_or_else(|| SyncError::NoConflict(key.clone()))?;
            Ok(s.conflicts.remove(idx))
        })?;
        info!(entity = %key, "conflict discarded, remote state kept");
        Ok(record)
    }

    /// Moves a dead letter back into the queue with a fresh retry budget.
    pub fn requeue_dead_letter(&self, id: ChangeId) -> SyncResult<Change> {
        self.inner.lock().mutate(|s| {
            let idx = s
                .dead_letters
                .iter()
                .position(|d| d.change.id == id)
                .ok_or(SyncError::NoDeadLetter(id))?;
            let mut change = s.dead_letters.remove(idx).change;
            change.retry_count = 0;
            s.push(change.clone(), true);
            Ok(change)
        })
    }

    /// Deletes a dead letter for good.
    pub fn purge_dead_letter(&self, id: ChangeId) -> SyncResult<DeadLetter> {
        self.inner.lock().mutate(|s| {
            let idx = s
                .dead_letters
                .iter()
                .position(|d| d.change.id == id)
                .ok_or(SyncError::NoDeadLetter(id))?;
            Ok(s.dead_letters.remove(idx))
        })
    }

    /// Clears the in-flight mark of one change without changing the queue.
    pub fn release(&self, id: ChangeId) {
        self.inner.lock().state.in_flight.remove(&id);
    }

    /// Drops every backoff deadline so waiting changes are eligible at once.
    ///
    /// Returns how many deadlines were cleared.
    pub fn clear_backoff(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut cleared = 0;
        for entry in &mut inner.state.pending {
            if entry.not_before.take().is_some() {
                cleared += 1;
            }
        }
        cleared
    }

    /// Clears every in-flight mark, making those changes eligible again.
    pub fn release_in_flight(&self) {
        self.inner.lock().state.in_flight.clear();
    }

    /// Returns the number of pending changes.
    pub fn size(&self) -> usize {
        self.inner.lock().state.pending.len()
    }

    /// Returns true if no change is pending.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Lists pending changes in ready order, optionally for one entity type.
    pub fn list_pending(&self, entity_type: Option<&str>) -> Vec<Change> {
        self.inner
            .lock()
            .state
            .pending
            .iter()
            .filter(|e| entity_type.map_or(true, |t| e.change.entity_type() == t))
            .map(|e| e.change.clone())
            .collect()
    }

    /// Returns the dead letters.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().state.dead_letters.clone()
    }

    /// Returns the conflicts awaiting a user decision.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner
            .lock()
            .state
            .conflicts
            .iter()
            .filter(|c| c.is_pending())
            .cloned()
            .collect()
    }

    /// Returns the entities suspended by a pending conflict.
    pub fn suspended(&self) -> Vec<EntityKey> {
        self.conflicts().into_iter().map(|c| c.key).collect()
    }

    /// Returns true if the entity is suspended by a pending conflict.
    pub fn is_suspended(&self, key: &EntityKey) -> bool {
        self.inner.lock().state.is_suspended(key)
    }

    /// Returns the number of changes currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().state.in_flight.len()
    }

    /// Returns the earliest backoff deadline among heads that could be sent
    /// but are still waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock()
            .state
            .dispatchable()
            .filter_map(|e| e.not_before)
            .min()
    }

    /// Returns a copy of what is persisted.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.lock().state.to_snapshot()
    }
}

impl std::fmt::Debug for LocalChangeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalChangeStore")
            .field("pending", &inner.state.pending.len())
            .field("in_flight", &inner.state.in_flight.len())
            .field("dead_letters", &inner.state.dead_letters.len())
            .field("conflicts", &inner.state.conflicts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use studysync_protocol::Version;
    use studysync_storage::{FileBackend, InMemoryBackend};

    fn key(id: &str) -> EntityKey {
        EntityKey::new("note", id)
    }

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Payload {
        Payload::from_fields(pairs.iter().map(|(k, v)| (*k, v.clone())))
    }

    fn update(id: &str, pairs: &[(&str, serde_json::Value)], base: u64) -> Change {
        Change::update(key(id), fields(pairs), Version(base), "u1")
    }

    fn open_memory() -> (LocalChangeStore, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let store = LocalChangeStore::open(backend.clone(), StoreConfig::default()).unwrap();
        (store, backend)
    }

    fn reopen(backend: &InMemoryBackend) -> LocalChangeStore {
        LocalChangeStore::open(backend.clone(), StoreConfig::default()).unwrap()
    }

    #[test]
    fn updates_coalesce_into_one_change() {
        let (store, _) = open_memory();
        let first = update("a", &[("f1", json!("x"))], 1);
        let first_id = first.id;

        assert_eq!(store.enqueue(first).unwrap(), EnqueueOutcome::Accepted);
        assert_eq!(
            store.enqueue(update("a", &[("f2", json!("y"))], 2)).unwrap(),
            EnqueueOutcome::Coalesced
        );

        let pending = store.list_pending(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first_id);
        assert_eq!(pending[0].base_version, Some(Version(1)));
        assert_eq!(pending[0].payload.get("f1"), Some(&json!("x")));
        assert_eq!(pending[0].payload.get("f2"), Some(&json!("y")));
    }

    #[test]
    fn later_update_wins_per_field() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("title", json!("old"))], 1)).unwrap();
        store.enqueue(update("a", &[("title", json!("new"))], 1)).unwrap();

        let pending = store.list_pending(None);
        assert_eq!(pending[0].payload.get("title"), Some(&json!("new")));
    }

    #[test]
    fn create_then_update_stays_create() {
        let (store, _) = open_memory();
        store
            .enqueue(Change::create(key("a"), fields(&[("t", json!(1))]), "u1"))
            .unwrap();
        store.enqueue(update("a", &[("b", json!(2))], 1)).unwrap();

        let pending = store.list_pending(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ChangeKind::Create);
        assert_eq!(pending[0].base_version, None);
        assert_eq!(pending[0].payload.len(), 2);
    }

    #[test]
    fn delete_supersedes_update() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 4)).unwrap();
        assert_eq!(
            store.enqueue(Change::delete(key("a"), Version(5), "u1")).unwrap(),
            EnqueueOutcome::Coalesced
        );

        let pending = store.list_pending(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, ChangeKind::Delete);
        assert_eq!(pending[0].base_version, Some(Version(4)));
        assert!(pending[0].payload.is_empty());
    }

    #[test]
    fn delete_keeps_earliest_authoring_time() {
        let (store, _) = open_memory();
        store
            .enqueue(update("a", &[("t", json!(1))], 4).with_created_at(Timestamp(1_000)))
            .unwrap();
        store
            .enqueue(Change::delete(key("a"), Version(4), "u1").with_created_at(Timestamp(9_000)))
            .unwrap();

        let pending = store.list_pending(None);
        assert_eq!(pending[0].kind, ChangeKind::Delete);
        assert_eq!(pending[0].created_at, Timestamp(1_000));
    }

    #[test]
    fn delete_collapses_unsent_create() {
        let (store, _) = open_memory();
        store
            .enqueue(Change::create(key("a"), fields(&[("t", json!(1))]), "u1"))
            .unwrap();
        store.enqueue(update("a", &[("t", json!(2))], 1)).unwrap();

        assert_eq!(
            store.enqueue(Change::delete(key("a"), Version(1), "u1")).unwrap(),
            EnqueueOutcome::Collapsed
        );
        assert!(store.is_empty());
        assert!(store.peek_next().is_none());
    }

    #[test]
    fn update_after_pending_delete_is_refused() {
        let (store, _) = open_memory();
        store.enqueue(Change::delete(key("a"), Version(2), "u1")).unwrap();

        let err = store.enqueue(update("a", &[("t", json!(1))], 2)).unwrap_err();
        assert!(matches!(err, SyncError::EntityDeleted(_)));
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn create_after_pending_delete_is_appended() {
        let (store, _) = open_memory();
        store.enqueue(Change::delete(key("a"), Version(2), "u1")).unwrap();
        assert_eq!(
            store
                .enqueue(Change::create(key("a"), fields(&[("t", json!(1))]), "u1"))
                .unwrap(),
            EnqueueOutcome::Accepted
        );

        let kinds: Vec<_> = store.list_pending(None).iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Delete, ChangeKind::Create]);
    }

    #[test]
    fn in_flight_change_is_not_coalesced_into() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let sent = store.claim_next().unwrap();

        assert_eq!(
            store.enqueue(update("a", &[("t", json!(2))], 1)).unwrap(),
            EnqueueOutcome::Accepted
        );
        assert_eq!(store.size(), 2);
        // Second change waits for the first.
        assert!(store.peek_next().is_none());

        store.mark_done(sent.id).unwrap();
        let next = store.peek_next().unwrap();
        assert_eq!(next.payload.get("t"), Some(&json!(2)));
    }

    #[test]
    fn delete_behind_in_flight_create_is_sent() {
        let (store, _) = open_memory();
        store
            .enqueue(Change::create(key("a"), fields(&[("t", json!(1))]), "u1"))
            .unwrap();
        let create = store.claim_next().unwrap();

        assert_eq!(
            store.enqueue(Change::delete(key("a"), Version(1), "u1")).unwrap(),
            EnqueueOutcome::Accepted
        );
        store.mark_done(create.id).unwrap();
        assert_eq!(store.peek_next().unwrap().kind, ChangeKind::Delete);
    }

    #[test]
    fn peek_is_single_flight_per_entity() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        store.enqueue(update("b", &[("t", json!(1))], 1)).unwrap();

        let first = store.claim_next().unwrap();
        assert_eq!(first.key, key("a"));
        let second = store.claim_next().unwrap();
        assert_eq!(second.key, key("b"));
        assert!(store.claim_next().is_none());
        assert_eq!(store.in_flight_count(), 2);
    }

    #[test]
    fn failed_change_keeps_entity_order() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let first = store.claim_next().unwrap();
        store.enqueue(update("a", &[("t", json!(2))], 1)).unwrap();
        store.enqueue(update("b", &[("t", json!(1))], 1)).unwrap();

        let outcome = store.mark_failed(first.id, "timeout", None).unwrap();
        assert_eq!(outcome, FailureOutcome::Requeued { retry_count: 1 });

        // "b" is next in ready order, then the retried head of "a".
        assert_eq!(store.claim_next().unwrap().key, key("b"));
        let retried = store.claim_next().unwrap();
        assert_eq!(retried.id, first.id);
        assert_eq!(retried.retry_count, 1);
        assert!(store.claim_next().is_none());
    }

    #[test]
    fn failed_change_is_not_coalesced_into() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let first = store.claim_next().unwrap();
        store.mark_failed(first.id, "timeout", None).unwrap();

        assert_eq!(
            store.enqueue(update("a", &[("t", json!(2))], 1)).unwrap(),
            EnqueueOutcome::Accepted
        );
        assert_eq!(store.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_deadline_defers_peek() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let first = store.claim_next().unwrap();

        let retry_at = Instant::now() + Duration::from_secs(4);
        store.mark_failed(first.id, "503", Some(retry_at)).unwrap();
        assert!(store.peek_next().is_none());
        assert_eq!(store.next_deadline(), Some(retry_at));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.peek_next().unwrap().id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_backoff_makes_head_eligible() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let first = store.claim_next().unwrap();
        let retry_at = Instant::now() + Duration::from_secs(50);
        store.mark_failed(first.id, "503", Some(retry_at)).unwrap();
        assert!(store.peek_next().is_none());

        assert_eq!(store.clear_backoff(), 1);
        assert_eq!(store.next_deadline(), None);
        let retried = store.peek_next().unwrap();
        assert_eq!(retried.id, first.id);
        assert_eq!(retried.retry_count, 1);
        assert_eq!(store.clear_backoff(), 0);
    }

    #[test]
    fn exceeding_retry_cap_dead_letters() {
        let backend = InMemoryBackend::new();
        let store =
            LocalChangeStore::open(backend, StoreConfig::new().with_max_retries(2)).unwrap();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();

        for attempt in 1..=2 {
            let change = store.claim_next().unwrap();
            assert_eq!(
                store.mark_failed(change.id, "503", None).unwrap(),
                FailureOutcome::Requeued {
                    retry_count: attempt
                }
            );
        }
        let change = store.claim_next().unwrap();
        assert_eq!(
            store.mark_failed(change.id, "503", None).unwrap(),
            FailureOutcome::DeadLettered
        );

        assert!(store.is_empty());
        assert!(store.peek_next().is_none());
        let dead = store.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].change.retry_count, 3);
        assert_eq!(dead[0].error, "503");
    }

    #[test]
    fn dead_letter_requeue_and_purge() {
        let store = LocalChangeStore::open(
            InMemoryBackend::new(),
            StoreConfig::new().with_max_retries(0),
        )
        .unwrap();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        store.enqueue(update("b", &[("t", json!(1))], 1)).unwrap();
        let a = store.claim_next().unwrap();
        let b = store.claim_next().unwrap();
        store.mark_failed(a.id, "x", None).unwrap();
        store.mark_failed(b.id, "x", None).unwrap();
        assert_eq!(store.dead_letters().len(), 2);

        let requeued = store.requeue_dead_letter(a.id).unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(store.peek_next().unwrap().id, a.id);

        store.purge_dead_letter(b.id).unwrap();
        assert!(store.dead_letters().is_empty());
        assert!(matches!(
            store.purge_dead_letter(b.id),
            Err(SyncError::NoDeadLetter(_))
        ));
    }

    #[test]
    fn rejected_change_is_dropped() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let change = store.claim_next().unwrap();

        let dropped = store.mark_rejected(change.id, "forbidden").unwrap();
        assert_eq!(dropped.id, change.id);
        assert!(store.is_empty());
        assert!(store.dead_letters().is_empty());
    }

    #[test]
    fn unknown_change_errors() {
        let (store, _) = open_memory();
        let id = ChangeId::new();
        assert!(matches!(store.mark_done(id), Err(SyncError::UnknownChange(_))));
        assert!(matches!(
            store.mark_in_flight(id),
            Err(SyncError::UnknownChange(_))
        ));
    }

    fn conflict_for(change: &Change, remote: u64) -> ConflictRecord {
        let overlap: BTreeSet<String> = change.payload.fields().map(String::from).collect();
        ConflictRecord::pending(
            change,
            Version(remote),
            fields(&[("title", json!("remote"))]),
            false,
            overlap,
        )
    }

    #[test]
    fn suspend_blocks_entity_until_resolved() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("title", json!("mine"))], 1)).unwrap();
        let change = store.claim_next().unwrap();

        store.suspend(conflict_for(&change, 2)).unwrap();
        assert!(store.is_suspended(&key("a")));
        assert_eq!(store.size(), 0);
        assert_eq!(store.conflicts().len(), 1);

        // Later edits queue up but are not sent.
        store.enqueue(update("a", &[("body", json!("more"))], 1)).unwrap();
        assert!(store.peek_next().is_none());

        let resolved = store
            .resolve_conflict(&key("a"), fields(&[("title", json!("merged"))]))
            .unwrap();
        assert_eq!(resolved.base_version, Some(Version(2)));
        assert_eq!(resolved.payload.get("title"), Some(&json!("merged")));
        assert_eq!(resolved.payload.get("body"), Some(&json!("more")));

        assert!(!store.is_suspended(&key("a")));
        assert!(store.conflicts().is_empty());
        assert_eq!(store.size(), 1);
        assert_eq!(store.peek_next().unwrap().id, resolved.id);
    }

    #[test]
    fn resolution_goes_before_queued_delete() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("title", json!("mine"))], 1)).unwrap();
        let change = store.claim_next().unwrap();
        store.suspend(conflict_for(&change, 2)).unwrap();
        store.enqueue(Change::delete(key("a"), Version(1), "u1")).unwrap();

        let resolved = store
            .resolve_conflict(&key("a"), fields(&[("title", json!("final"))]))
            .unwrap();

        let order: Vec<_> = store.list_pending(None).iter().map(|c| c.kind).collect();
        assert_eq!(order, vec![ChangeKind::Update, ChangeKind::Delete]);
        assert_eq!(store.peek_next().unwrap().id, resolved.id);
    }

    #[test]
    fn resolve_without_conflict_errors() {
        let (store, _) = open_memory();
        assert!(matches!(
            store.resolve_conflict(&key("a"), Payload::new()),
            Err(SyncError::NoConflict(_))
        ));
    }

    #[test]
    fn discard_conflict_unsuspends() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("title", json!("mine"))], 1)).unwrap();
        let change = store.claim_next().unwrap();
        store.suspend(conflict_for(&change, 2)).unwrap();

        let record = store.discard_conflict(&key("a")).unwrap();
        assert_eq!(record.change_id, change.id);
        assert!(!store.is_suspended(&key("a")));
        assert!(store.is_empty());
    }

    #[test]
    fn apply_merged_keeps_id_and_slot() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("title", json!("mine"))], 1)).unwrap();
        let change = store.claim_next().unwrap();
        store.enqueue(update("a", &[("body", json!("later"))], 1)).unwrap();

        let mut merged = change.clone();
        merged.base_version = Some(Version(2));
        store.apply_merged(merged).unwrap();

        let next = store.peek_next().unwrap();
        assert_eq!(next.id, change.id);
        assert_eq!(next.base_version, Some(Version(2)));
        assert_eq!(store.size(), 2);
    }

    #[test]
    fn list_pending_filters_by_type() {
        let (store, _) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        store
            .enqueue(Change::create(
                EntityKey::new("task", "t1"),
                fields(&[("t", json!(1))]),
                "u1",
            ))
            .unwrap();

        assert_eq!(store.list_pending(None).len(), 2);
        assert_eq!(store.list_pending(Some("task")).len(), 1);
        assert!(store.list_pending(Some("file")).is_empty());
    }

    #[test]
    fn enqueued_changes_survive_reopen() {
        let (store, backend) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        store.enqueue(update("b", &[("t", json!(1))], 1)).unwrap();
        let before = store.list_pending(None);
        drop(store);

        let reopened = reopen(&backend);
        assert_eq!(reopened.size(), 2);
        assert_eq!(reopened.list_pending(None), before);
    }

    #[test]
    fn in_flight_marks_do_not_survive_reopen() {
        let (store, backend) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        let sent = store.claim_next().unwrap();
        drop(store);

        let reopened = reopen(&backend);
        assert_eq!(reopened.peek_next().unwrap().id, sent.id);
    }

    #[test]
    fn storage_failure_fails_enqueue_and_keeps_state() {
        let (store, backend) = open_memory();
        store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();

        backend.set_fail_writes(true);
        let err = store.enqueue(update("b", &[("t", json!(1))], 1)).unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(store.size(), 1);

        backend.set_fail_writes(false);
        assert_eq!(reopen(&backend).size(), 1);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let backend = InMemoryBackend::with_data(b"SSQF garbage".to_vec());
        let err = LocalChangeStore::open(backend, StoreConfig::default()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.ssq");

        {
            let store =
                LocalChangeStore::open(FileBackend::open(&path).unwrap(), StoreConfig::default())
                    .unwrap();
            store.enqueue(update("a", &[("t", json!(1))], 1)).unwrap();
        }

        let store =
            LocalChangeStore::open(FileBackend::open(&path).unwrap(), StoreConfig::default())
                .unwrap();
        assert_eq!(store.size(), 1);
    }
}
