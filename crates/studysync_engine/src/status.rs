//! Read-only sync status for UI consumers.

use serde::Serialize;
use studysync_protocol::{Change, ConflictRecord, DeadLetter, EntityKey, Timestamp};
use tokio::sync::watch;

/// State of the sync orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    /// Nothing to send.
    Idle,
    /// Changes are being sent.
    Draining,
    /// Changes are pending but all of them wait for a retry deadline.
    Backoff,
    /// The network is down; nothing is sent.
    Offline,
    /// The orchestrator has shut down.
    Stopped,
}

impl OrchestratorState {
    /// Returns true if the orchestrator is sending changes.
    pub fn is_active(&self) -> bool {
        matches!(self, OrchestratorState::Draining)
    }
}

/// A change the remote refused permanently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    /// The dropped change.
    pub change: Change,
    /// Why it was refused.
    pub reason: String,
    /// When it was dropped.
    pub rejected_at: Timestamp,
}

/// Snapshot of sync state, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Orchestrator state.
    pub state: OrchestratorState,
    /// Committed network status.
    pub is_online: bool,
    /// True only while changes are being sent.
    pub is_syncing: bool,
    /// Pending changes in the queue.
    pub pending_count: usize,
    /// Time of the last change the remote accepted.
    pub last_sync_at: Option<Timestamp>,
    /// Time of the last remote call.
    pub last_attempt_at: Option<Timestamp>,
    /// Most recent error.
    pub last_error: Option<String>,
    /// Conflicts awaiting a user decision.
    pub conflicts: Vec<ConflictRecord>,
    /// Changes that exhausted their retries.
    pub dead_letters: Vec<DeadLetter>,
    /// Recently rejected changes, oldest first.
    pub rejected: Vec<RejectedChange>,
    /// Recent conflicts settled by policy, oldest first.
    pub auto_resolved: Vec<ConflictRecord>,
    /// Entities whose sync is suspended by a conflict.
    pub suspended: Vec<EntityKey>,
}

impl SyncStatus {
    pub(crate) fn initial(is_online: bool) -> Self {
        Self {
            state: if is_online {
                OrchestratorState::Idle
            } else {
                OrchestratorState::Offline
            },
            is_online,
            is_syncing: false,
            pending_count: 0,
            last_sync_at: None,
            last_attempt_at: None,
            last_error: None,
            conflicts: Vec::new(),
            dead_letters: Vec::new(),
            rejected: Vec::new(),
            auto_resolved: Vec::new(),
            suspended: Vec::new(),
        }
    }
}

/// Read-only view of the orchestrator's [`SyncStatus`].
#[derive(Debug, Clone)]
pub struct StatusReporter {
    rx: watch::Receiver<SyncStatus>,
}

impl StatusReporter {
    pub(crate) fn new(rx: watch::Receiver<SyncStatus>) -> Self {
        Self { rx }
    }

    /// Returns the latest status.
    pub fn current(&self) -> SyncStatus {
        self.rx.borrow().clone()
    }

    /// Waits for the next status update and returns it.
    ///
    /// Returns `None` once the orchestrator is gone.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Waits until `predicate` holds for the status and returns it.
    ///
    /// Returns `None` if the orchestrator stops first.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SyncStatus) -> bool,
    ) -> Option<SyncStatus> {
        self.rx
            .wait_for(|s| predicate(s))
            .await
            .ok()
            .map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_camel_case() {
        let status = SyncStatus::initial(true);
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(value["state"], "idle");
        assert_eq!(value["isOnline"], true);
        assert_eq!(value["pendingCount"], 0);
        assert!(value["lastSyncAt"].is_null());
    }

    #[tokio::test]
    async fn reporter_sees_updates() {
        let (tx, rx) = watch::channel(SyncStatus::initial(false));
        let mut reporter = StatusReporter::new(rx);
        assert_eq!(reporter.current().state, OrchestratorState::Offline);

        let mut next = SyncStatus::initial(true);
        next.pending_count = 3;
        tx.send_replace(next);

        let seen = reporter.changed().await.unwrap();
        assert_eq!(seen.pending_count, 3);

        drop(tx);
        assert!(reporter.changed().await.is_none());
    }
}
