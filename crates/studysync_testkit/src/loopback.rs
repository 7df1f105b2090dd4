//! In-process remote client with fault injection.
//!
//! [`LoopbackRemote`] implements [`RemoteClient`] directly over a
//! [`ReferenceRemote`], so the engine can be driven end to end without a
//! network. Faults are injected per call:
//!
//! - `fail_next(n)`: the next `n` applies fail transiently before reaching
//!   the remote
//! - `drop_next_acks(n)`: the next `n` applies reach the remote and are
//!   applied, but the client sees a transient error (a lost response)
//! - `set_offline(true)`: every call fails transiently
//! - `set_latency(d)`: every apply waits `d` first

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use studysync_engine::{RemoteClient, SyncError, SyncResult};
use studysync_protocol::{ApplyRequest, ApplyResponse, EntityKey, RemoteEntity, Version};
use studysync_server::{ReferenceRemote, ServerError};

#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    drop_acks: u32,
    fail_fetches: u32,
    offline: bool,
    latency: Option<Duration>,
}

/// A [`RemoteClient`] that calls a [`ReferenceRemote`] in-process.
#[derive(Debug)]
pub struct LoopbackRemote {
    remote: ReferenceRemote,
    faults: Mutex<Faults>,
    applies: AtomicUsize,
    delivered: AtomicUsize,
}

impl LoopbackRemote {
    /// Creates a client over `remote`.
    pub fn new(remote: ReferenceRemote) -> Self {
        Self {
            remote,
            faults: Mutex::new(Faults::default()),
            applies: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        }
    }

    /// Returns the remote this client talks to.
    pub fn remote(&self) -> &ReferenceRemote {
        &self.remote
    }

    /// Fails the next `n` applies before they reach the remote.
    pub fn fail_next(&self, n: u32) {
        self.faults.lock().fail_next = n;
    }

    /// Applies the next `n` changes but reports a transient error.
    pub fn drop_next_acks(&self, n: u32) {
        self.faults.lock().drop_acks = n;
    }

    /// Fails the next `n` fetches.
    pub fn fail_next_fetches(&self, n: u32) {
        self.faults.lock().fail_fetches = n;
    }

    /// Makes every call fail transiently while set.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Delays every apply.
    pub fn set_latency(&self, latency: Duration) {
        self.faults.lock().latency = Some(latency);
    }

    /// Returns how many apply calls were made.
    pub fn apply_calls(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    /// Returns how many apply calls reached the remote.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

fn server_error(err: ServerError) -> SyncError {
    if err.is_client_error() {
        SyncError::transport_fatal(err.to_string())
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

impl RemoteClient for LoopbackRemote {
    async fn apply(&self, request: ApplyRequest) -> SyncResult<ApplyResponse> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut faults = self.faults.lock();
            if faults.offline {
                return Err(SyncError::transport_retryable("remote unreachable"));
            }
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(SyncError::transport_retryable("injected failure"));
            }
        }

        self.delivered.fetch_add(1, Ordering::SeqCst);
        let response = self.remote.handle_apply(request).map_err(server_error)?;

        let mut faults = self.faults.lock();
        if faults.drop_acks > 0 {
            faults.drop_acks -= 1;
            return Err(SyncError::transport_retryable("acknowledgement lost"));
        }
        Ok(response)
    }

    async fn fetch(&self, key: &EntityKey, since: Option<Version>) -> SyncResult<RemoteEntity> {
        {
            let mut faults = self.faults.lock();
            if faults.offline {
                return Err(SyncError::transport_retryable("remote unreachable"));
            }
            if faults.fail_fetches > 0 {
                faults.fail_fetches -= 1;
                return Err(SyncError::transport_retryable("injected fetch failure"));
            }
        }
        self.remote.handle_fetch(key, since).map_err(server_error)
    }
}
