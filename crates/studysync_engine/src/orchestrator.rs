//! Sync orchestrator.
//!
//! The orchestrator is a single tokio task that owns the replay loop. It
//! claims changes from the [`LocalChangeStore`], sends them through a
//! [`RemoteClient`] (up to `parallelism` at a time, never two for the same
//! entity), and books each outcome back into the store.
//!
//! ## State machine
//!
//! ```text
//!            online / trigger                 queue empty
//!   Idle ----------------------> Draining ------------------> Idle
//!                                 |    ^
//!          only retries pending   |    |  deadline reached
//!                                 v    |
//!                                Backoff
//!
//!   any state --offline--> Offline --online--> Draining
//!   any state --shutdown--> Stopped
//! ```
//!
//! Entities suspended by a pending conflict are skipped while everything
//! else keeps draining.
//!
//! ## Outcomes
//!
//! - applied: the change is removed
//! - transient error or timeout: retried after exponential backoff, and
//!   dead-lettered once the store's retry cap is exceeded
//! - rejected or permanent error: the change is dropped and reported
//! - conflict: the remote entity is fetched and handed to the
//!   [`ConflictResolver`]; merged changes are resent, escalated ones suspend
//!   their entity until resolved

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::network::NetworkStatus;
use crate::resolver::{ConflictResolver, Resolution};
use crate::status::{OrchestratorState, RejectedChange, StatusReporter, SyncStatus};
use crate::store::{EnqueueOutcome, FailureOutcome, LocalChangeStore};
use crate::transport::RemoteClient;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use studysync_protocol::{
    ApplyRequest, ApplyResponse, Change, ChangeId, ConflictRecord, DeadLetter, EntityKey,
    Payload, Timestamp, Version,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 32;

enum Command {
    Trigger,
    Shutdown(oneshot::Sender<()>),
}

/// Handle for interacting with a running [`SyncOrchestrator`].
///
/// Handles are cheap to clone. Every mutation goes through the shared store
/// first and then nudges the orchestrator, so the caller gets the storage
/// result synchronously and never waits on the network.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    store: Arc<LocalChangeStore>,
    status: StatusReporter,
}

impl SyncHandle {
    /// Queues a user edit. Returns once the edit is durable.
    pub fn enqueue(&self, change: Change) -> SyncResult<EnqueueOutcome> {
        let outcome = self.store.enqueue(change)?;
        self.trigger();
        Ok(outcome)
    }

    /// Asks the orchestrator to start a drain cycle.
    pub fn trigger(&self) {
        // A full buffer already holds a pending trigger.
        let _ = self.commands.try_send(Command::Trigger);
    }

    /// Resolves a pending conflict with the user's final payload.
    ///
    /// Returns the freshly enqueued change.
    pub fn resolve_conflict(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: Payload,
    ) -> SyncResult<Change> {
        let change = self
            .store
            .resolve_conflict(&EntityKey::new(entity_type, entity_id), payload)?;
        self.trigger();
        Ok(change)
    }

    /// Drops a pending conflict, keeping the remote state.
    pub fn discard_conflict(&self, key: &EntityKey) -> SyncResult<ConflictRecord> {
        let record = self.store.discard_conflict(key)?;
        self.trigger();
        Ok(record)
    }

    /// Puts a dead letter back into the queue.
    pub fn requeue_dead_letter(&self, id: ChangeId) -> SyncResult<Change> {
        let change = self.store.requeue_dead_letter(id)?;
        self.trigger();
        Ok(change)
    }

    /// Deletes a dead letter.
    pub fn purge_dead_letter(&self, id: ChangeId) -> SyncResult<DeadLetter> {
        let letter = self.store.purge_dead_letter(id)?;
        self.trigger();
        Ok(letter)
    }

    /// Returns the shared change store.
    pub fn store(&self) -> &Arc<LocalChangeStore> {
        &self.store
    }

    /// Returns a status reporter.
    pub fn status(&self) -> StatusReporter {
        self.status.clone()
    }

    /// Stops the orchestrator and waits until it has stopped.
    ///
    /// In-flight calls are abandoned; their changes stay queued and are
    /// replayed on the next start.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Shutdown(ack))
            .await
            .map_err(|_| SyncError::Stopped)?;
        done.await.map_err(|_| SyncError::Stopped)
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle").finish_non_exhaustive()
    }
}

enum AttemptOutcome {
    Applied(Version),
    Rejected(String),
    Failed(SyncError),
    /// A settled conflict carries its audit record; escalations do not.
    Resolved(Resolution, Option<ConflictRecord>),
}

struct AttemptReport {
    change: Change,
    outcome: AttemptOutcome,
}

/// What booking an attempt into the store means for the published status.
enum Booked {
    Synced,
    Retrying(String),
    DeadLettered(String),
    Rejected(RejectedChange),
    AutoResolved { record: ConflictRecord, synced: bool },
    Requeued,
}

/// Replays queued changes against the remote.
pub struct SyncOrchestrator<R: RemoteClient> {
    store: Arc<LocalChangeStore>,
    remote: Arc<R>,
    resolver: Arc<ConflictResolver>,
    config: SyncConfig,
    commands: mpsc::Receiver<Command>,
    network: watch::Receiver<NetworkStatus>,
    network_open: bool,
    status: watch::Sender<SyncStatus>,
    tasks: JoinSet<AttemptReport>,
    attempts: HashMap<task::Id, Change>,
    online: bool,
    stopped: bool,
    last_sync_at: Option<Timestamp>,
    last_attempt_at: Option<Timestamp>,
    last_error: Option<String>,
    rejected: VecDeque<RejectedChange>,
    auto_resolved: VecDeque<ConflictRecord>,
}

impl<R: RemoteClient> SyncOrchestrator<R> {
    /// Creates an orchestrator and its handle; call [`Self::run`] to start it.
    pub fn new(
        store: Arc<LocalChangeStore>,
        remote: Arc<R>,
        mut network: watch::Receiver<NetworkStatus>,
        config: SyncConfig,
    ) -> (Self, SyncHandle) {
        let online = network.borrow_and_update().is_online();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(SyncStatus::initial(online));

        let orchestrator = Self {
            store: store.clone(),
            remote,
            resolver: Arc::new(ConflictResolver::new(config.policies.clone())),
            config,
            commands: cmd_rx,
            network,
            network_open: true,
            status: status_tx,
            tasks: JoinSet::new(),
            attempts: HashMap::new(),
            online,
            stopped: false,
            last_sync_at: None,
            last_attempt_at: None,
            last_error: None,
            rejected: VecDeque::new(),
            auto_resolved: VecDeque::new(),
        };
        let handle = SyncHandle {
            commands: cmd_tx,
            store,
            status: StatusReporter::new(status_rx),
        };
        (orchestrator, handle)
    }

    /// Creates an orchestrator and runs it on the current tokio runtime.
    pub fn spawn(
        store: Arc<LocalChangeStore>,
        remote: Arc<R>,
        network: watch::Receiver<NetworkStatus>,
        config: SyncConfig,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(store, remote, network, config);
        (handle, tokio::spawn(orchestrator.run()))
    }

    /// Runs the replay loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        info!(
            online = self.online,
            pending = self.store.size(),
            parallelism = self.config.parallelism,
            "sync orchestrator started"
        );

        loop {
            if self.online {
                self.dispatch();
            }
            self.publish();

            let deadline = if self.online && self.tasks.len() < self.config.parallelism {
                self.store.next_deadline()
            } else {
                None
            };

            tokio::select! {
                Some(joined) = self.tasks.join_next_with_id(), if !self.tasks.is_empty() => {
                    self.on_joined(joined).await;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Trigger) => debug!("sync triggered"),
                    Some(Command::Shutdown(ack)) => {
                        self.stop().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.stop().await;
                        return;
                    }
                },
                changed = self.network.changed(), if self.network_open => match changed {
                    Ok(()) => {
                        let status = *self.network.borrow_and_update();
                        self.on_network(status);
                    }
                    Err(_) => {
                        warn!("network monitor gone, keeping last known status");
                        self.network_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("retry backoff elapsed");
                }
            }
        }
    }

    fn dispatch(&mut self) {
        while self.tasks.len() < self.config.parallelism {
            let Some(change) = self.store.claim_next() else {
                break;
            };

            debug!(
                change_id = %change.id,
                entity = %change.key,
                kind = %change.kind,
                attempt = change.retry_count + 1,
                "sending change"
            );
            self.last_attempt_at = Some(Timestamp::now());
            let handle = self.tasks.spawn(attempt(
                self.remote.clone(),
                self.resolver.clone(),
                change.clone(),
                self.config.request_timeout,
            ));
            self.attempts.insert(handle.id(), change);
        }
    }

    fn on_network(&mut self, status: NetworkStatus) {
        let online = status.is_online();
        if online == self.online {
            return;
        }
        self.online = online;
        if online {
            info!(pending = self.store.size(), "network online, draining queue");
        } else {
            info!(
                in_flight = self.tasks.len(),
                "network offline, pausing sync"
            );
        }

        // Retry timers do not outlive a connectivity change; the next loop
        // turn dispatches whatever is eligible.
        let cleared = self.store.clear_backoff();
        if cleared > 0 {
            debug!(cleared, "backoff timers cancelled");
        }
    }

    async fn on_joined(&mut self, joined: Result<(task::Id, AttemptReport), JoinError>) {
        let report = match joined {
            Ok((task_id, report)) => {
                self.attempts.remove(&task_id);
                report
            }
            Err(err) => {
                let Some(change) = self.attempts.remove(&err.id()) else {
                    return;
                };
                if err.is_cancelled() {
                    self.store.release(change.id);
                    return;
                }
                error!(change_id = %change.id, error = %err, "sync attempt panicked");
                AttemptReport {
                    change,
                    outcome: AttemptOutcome::Failed(SyncError::TaskFailed(err.to_string())),
                }
            }
        };

        // Booking persists the queue, so it runs off the async workers.
        let id = report.change.id;
        let store = self.store.clone();
        let retry = self.config.retry.clone();
        let now = Instant::now();
        let booked = task::spawn_blocking(move || book(&store, &retry, now, report))
            .await
            .unwrap_or_else(|err| Err(SyncError::TaskFailed(err.to_string())));

        match booked {
            Ok(Booked::Synced) => self.last_sync_at = Some(Timestamp::now()),
            Ok(Booked::Retrying(message) | Booked::DeadLettered(message)) => {
                self.last_error = Some(message);
            }
            Ok(Booked::Rejected(rejected)) => {
                self.last_error = Some(format!(
                    "{} rejected: {}",
                    rejected.change.key, rejected.reason
                ));
                self.rejected.push_back(rejected);
                while self.rejected.len() > self.config.rejected_history {
                    self.rejected.pop_front();
                }
            }
            Ok(Booked::AutoResolved { record, synced }) => {
                if synced {
                    self.last_sync_at = Some(Timestamp::now());
                }
                self.auto_resolved.push_back(record);
                while self.auto_resolved.len() > self.config.rejected_history {
                    self.auto_resolved.pop_front();
                }
            }
            Ok(Booked::Requeued) => {}
            Err(err) => {
                error!(change_id = %id, error = %err, "failed to record sync outcome");
                self.store.release(id);
                self.last_error = Some(err.to_string());
            }
        }
    }

    async fn stop(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.attempts.clear();
        self.store.release_in_flight();
        self.stopped = true;
        self.publish();
        info!(pending = self.store.size(), "sync orchestrator stopped");
    }

    fn state(&self) -> OrchestratorState {
        if self.stopped {
            OrchestratorState::Stopped
        } else if !self.online {
            OrchestratorState::Offline
        } else if !self.tasks.is_empty() || self.store.peek_next().is_some() {
            OrchestratorState::Draining
        } else if self.store.next_deadline().is_some() {
            OrchestratorState::Backoff
        } else {
            OrchestratorState::Idle
        }
    }

    fn publish(&self) {
        let state = self.state();
        let next = SyncStatus {
            state,
            is_online: self.online,
            is_syncing: state.is_active(),
            pending_count: self.store.size(),
            last_sync_at: self.last_sync_at,
            last_attempt_at: self.last_attempt_at,
            last_error: self.last_error.clone(),
            conflicts: self.store.conflicts(),
            dead_letters: self.store.dead_letters(),
            rejected: self.rejected.iter().cloned().collect(),
            auto_resolved: self.auto_resolved.iter().cloned().collect(),
            suspended: self.store.suspended(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Records the outcome of one attempt in the store.
fn book(
    store: &LocalChangeStore,
    retry: &RetryConfig,
    now: Instant,
    report: AttemptReport,
) -> SyncResult<Booked> {
    let AttemptReport { change, outcome } = report;
    let id = change.id;

    match outcome {
        AttemptOutcome::Applied(version) => {
            store.mark_done(id)?;
            info!(change_id = %id, entity = %change.key, %version, "change synced");
            Ok(Booked::Synced)
        }
        AttemptOutcome::Failed(err) if err.is_retryable() => {
            let message = err.to_string();
            let delay = retry.delay_for_attempt(change.retry_count + 1);
            match store.mark_failed(id, &message, Some(now + delay))? {
                FailureOutcome::Requeued { retry_count } => {
                    debug!(
                        change_id = %id,
                        retry_count,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retry scheduled"
                    );
                    Ok(Booked::Retrying(message))
                }
                FailureOutcome::DeadLettered => Ok(Booked::DeadLettered(format!(
                    "{} could not be saved after repeated failures: {message}",
                    change.key
                ))),
            }
        }
        AttemptOutcome::Failed(err) => reject(store, id, err.to_string()),
        AttemptOutcome::Rejected(reason) => reject(store, id, reason),
        AttemptOutcome::Resolved(resolution, settled) => {
            let synced = match resolution {
                Resolution::Merged(merged) | Resolution::LastWriteWins(merged) => {
                    store.apply_merged(merged)?;
                    false
                }
                Resolution::Superseded => {
                    store.mark_done(id)?;
                    true
                }
                Resolution::Escalated(record) => {
                    store.suspend(record)?;
                    false
                }
            };
            Ok(match settled {
                Some(record) => Booked::AutoResolved { record, synced },
                None if synced => Booked::Synced,
                None => Booked::Requeued,
            })
        }
    }
}

fn reject(store: &LocalChangeStore, id: ChangeId, reason: String) -> SyncResult<Booked> {
    let change = store.mark_rejected(id, &reason)?;
    Ok(Booked::Rejected(RejectedChange {
        change,
        reason,
        rejected_at: Timestamp::now(),
    }))
}

async fn attempt<R: RemoteClient>(
    remote: Arc<R>,
    resolver: Arc<ConflictResolver>,
    change: Change,
    limit: Duration,
) -> AttemptReport {
    let applied = tokio::time::timeout(limit, remote.apply(ApplyRequest::from(&change))).await;

    let outcome = match applied {
        Err(_) => AttemptOutcome::Failed(SyncError::Timeout),
        Ok(Err(err)) => AttemptOutcome::Failed(err),
        Ok(Ok(ApplyResponse::Applied { new_version })) => AttemptOutcome::Applied(new_version),
        Ok(Ok(ApplyResponse::Rejected { reason })) => AttemptOutcome::Rejected(reason),
        Ok(Ok(ApplyResponse::Conflict { remote_version, .. })) => {
            debug!(
                change_id = %change.id,
                entity = %change.key,
                %remote_version,
                "version conflict, fetching remote entity"
            );
            match tokio::time::timeout(limit, remote.fetch(&change.key, change.base_version)).await
            {
                Ok(Ok(entity)) => {
                    let resolution = resolver.resolve(&change, &entity);
                    let settled = match resolution {
                        Resolution::Escalated(_) => None,
                        _ => Some(resolver.auto_resolved_record(&change, &entity)),
                    };
                    AttemptOutcome::Resolved(resolution, settled)
                }
                Ok(Err(err)) => AttemptOutcome::Failed(SyncError::transport_retryable(format!(
                    "conflict fetch failed: {err}"
                ))),
                Err(_) => AttemptOutcome::Failed(SyncError::Timeout),
            }
        }
    };

    AttemptReport { change, outcome }
}
