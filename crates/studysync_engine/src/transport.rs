//! Remote reconciliation client abstraction.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use studysync_protocol::{ApplyRequest, ApplyResponse, EntityKey, Payload, RemoteEntity, Version};

/// A client for the remote store that changes are replayed against.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, IPC, an in-process server, a mock for testing).
///
/// # Preconditions
///
/// `apply` must be idempotent per [`ApplyRequest::id`]: the queue replays a
/// change whenever it cannot tell whether an earlier attempt landed (timeout,
/// crash before acknowledgement), and the remote must answer a replay with
/// the original outcome instead of applying it twice.
///
/// Transport failures are reported as [`SyncError::Transport`]; the
/// `retryable` flag separates transient failures (timeouts, 5xx, offline)
/// from permanent ones.
pub trait RemoteClient: Send + Sync + 'static {
    /// Applies one change.
    fn apply(
        &self,
        request: ApplyRequest,
    ) -> impl Future<Output = SyncResult<ApplyResponse>> + Send;

    /// Fetches the current remote copy of an entity, including the fields
    /// written after `since` when the remote can tell.
    fn fetch(
        &self,
        key: &EntityKey,
        since: Option<Version>,
    ) -> impl Future<Output = SyncResult<RemoteEntity>> + Send;
}

/// A scripted reply for [`MockRemote`].
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this response.
    Respond(ApplyResponse),
    /// Fail with a transport error.
    Fail {
        /// Error message.
        message: String,
        /// Whether the error is transient.
        retryable: bool,
    },
}

/// A mock remote for testing.
///
/// Replies are taken from a script in order; once the script is empty every
/// request is applied, bumping a per-entity version counter.
#[derive(Debug, Default)]
pub struct MockRemote {
    connected: AtomicBool,
    script: Mutex<VecDeque<MockReply>>,
    entities: Mutex<HashMap<EntityKey, RemoteEntity>>,
    versions: Mutex<HashMap<EntityKey, Version>>,
    requests: Mutex<Vec<ApplyRequest>>,
    latency: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockRemote {
    /// Creates a new connected mock remote.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues a scripted reply.
    pub fn push_reply(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Queues a response.
    pub fn push_response(&self, response: ApplyResponse) {
        self.push_reply(MockReply::Respond(response));
    }

    /// Queues a transient transport failure.
    pub fn push_transient(&self, message: impl Into<String>) {
        self.push_reply(MockReply::Fail {
            message: message.into(),
            retryable: true,
        });
    }

    /// Sets what `fetch` returns for an entity.
    pub fn set_entity(&self, entity: RemoteEntity) {
        self.entities.lock().insert(entity.key.clone(), entity);
    }

    /// Delays every `apply` call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Sets the connected state; a disconnected mock fails transiently.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<ApplyRequest> {
        self.requests.lock().clone()
    }

    /// Returns the highest number of concurrent `apply` calls observed.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &ApplyRequest) -> SyncResult<ApplyResponse> {
        match self.script.lock().pop_front() {
            Some(MockReply::Respond(response)) => Ok(response),
            Some(MockReply::Fail { message, retryable }) => Err(SyncError::Transport {
                message,
                retryable,
            }),
            None => {
                let mut versions = self.versions.lock();
                let version = versions.entry(request.key.clone()).or_default();
                *version = version.next();
                Ok(ApplyResponse::applied(*version))
            }
        }
    }
}

impl RemoteClient for MockRemote {
    async fn apply(&self, request: ApplyRequest) -> SyncResult<ApplyResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.requests.lock().push(request.clone());
        let reply = self.next_reply(&request);
        self.active.fetch_sub(1, Ordering::SeqCst);
        reply
    }

    async fn fetch(&self, key: &EntityKey, _since: Option<Version>) -> SyncResult<RemoteEntity> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("not connected"));
        }

        Ok(self
            .entities
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| RemoteEntity {
                key: key.clone(),
                version: Version::default(),
                payload: Payload::new(),
                updated_at: None,
                deleted: false,
                changed_since: None,
            }))
    }
}
