//! Test fixtures for queues and running engines.
//!
//! [`TestQueue`] owns a [`LocalChangeStore`] plus whatever keeps its
//! backend alive, and can reopen the store from the same bytes to
//! simulate a process restart. [`TestEngine`] wires a queue, a
//! [`ReferenceRemote`] behind a [`LoopbackRemote`], and a manually driven
//! network signal into a running orchestrator.

use crate::loopback::LoopbackRemote;
use serde_json::Value;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use studysync_engine::{
    LocalChangeStore, NetworkStatus, OrchestratorState, StoreConfig, SyncConfig, SyncHandle,
    SyncOrchestrator, SyncResult, SyncStatus,
};
use studysync_protocol::{EntityKey, Payload};
use studysync_server::ReferenceRemote;
use studysync_storage::{FileBackend, InMemoryBackend};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shorthand for a note key.
pub fn note(id: &str) -> EntityKey {
    EntityKey::new("note", id)
}

/// Shorthand for a task key.
pub fn task(id: &str) -> EntityKey {
    EntityKey::new("task", id)
}

/// Builds a payload from field/value pairs.
pub fn fields<I>(pairs: I) -> Payload
where
    I: IntoIterator<Item = (&'static str, Value)>,
{
    Payload::from_fields(pairs)
}

enum Backing {
    Memory(InMemoryBackend),
    File {
        path: PathBuf,
        _dir: TempDir,
    },
}

/// A change store with a backend that outlives it.
pub struct TestQueue {
    /// The store under test.
    pub store: Arc<LocalChangeStore>,
    backing: Backing,
    config: StoreConfig,
}

impl TestQueue {
    /// Creates an empty in-memory queue.
    pub fn memory() -> Self {
        Self::memory_with_config(StoreConfig::default())
    }

    /// Creates an empty in-memory queue with `config`.
    pub fn memory_with_config(config: StoreConfig) -> Self {
        let backend = InMemoryBackend::new();
        let store = LocalChangeStore::open(backend.clone(), config.clone())
            .expect("Failed to open in-memory queue");
        Self {
            store: Arc::new(store),
            backing: Backing::Memory(backend),
            config,
        }
    }

    /// Creates an empty file-backed queue in a temporary directory.
    pub fn file() -> Self {
        Self::file_with_config(StoreConfig::default())
    }

    /// Creates an empty file-backed queue with `config`.
    pub fn file_with_config(config: StoreConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("queue").join("pending.ssq");
        let backend =
            FileBackend::open_with_create_dirs(&path).expect("Failed to create queue file");
        let store = LocalChangeStore::open(backend, config.clone()).expect("Failed to open queue");
        Self {
            store: Arc::new(store),
            backing: Backing::File { path, _dir: dir },
            config,
        }
    }

    /// Returns the queue file path if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Returns the raw persisted bytes.
    pub fn persisted_bytes(&self) -> Vec<u8> {
        match &self.backing {
            Backing::Memory(backend) => backend.data(),
            Backing::File { path, .. } => std::fs::read(path).expect("Failed to read queue file"),
        }
    }

    /// Drops the store and opens a fresh one from the persisted bytes.
    ///
    /// Anything not persisted (in-flight marks, backoff deadlines) is lost,
    /// as it would be after a crash.
    pub fn reopen(&mut self) -> SyncResult<()> {
        let store = match &self.backing {
            Backing::Memory(backend) => LocalChangeStore::open(backend.clone(), self.config.clone())?,
            Backing::File { path, .. } => {
                LocalChangeStore::open(FileBackend::open(path)?, self.config.clone())?
            }
        };
        self.store = Arc::new(store);
        Ok(())
    }
}

impl Deref for TestQueue {
    type Target = LocalChangeStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A running orchestrator over a [`TestQueue`] and a loopback remote.
pub struct TestEngine {
    /// Handle to the running orchestrator.
    pub handle: SyncHandle,
    /// The client the orchestrator talks through.
    pub client: Arc<LoopbackRemote>,
    /// Committed network status fed to the orchestrator.
    pub network: watch::Sender<NetworkStatus>,
    /// The queue being drained.
    pub queue: TestQueue,
    task: JoinHandle<()>,
}

impl TestEngine {
    /// Starts an orchestrator; must be called inside a tokio runtime.
    pub fn start(queue: TestQueue, remote: ReferenceRemote, config: SyncConfig, online: bool) -> Self {
        let client = Arc::new(LoopbackRemote::new(remote));
        let (network, network_rx) = watch::channel(NetworkStatus::from(online));
        let (handle, task) =
            SyncOrchestrator::spawn(queue.store.clone(), client.clone(), network_rx, config);
        Self {
            handle,
            client,
            network,
            queue,
            task,
        }
    }

    /// Returns the remote behind the client.
    pub fn remote(&self) -> &ReferenceRemote {
        self.client.remote()
    }

    /// Commits a network status.
    pub fn set_online(&self, online: bool) {
        self.network.send_replace(NetworkStatus::from(online));
    }

    /// Waits until `predicate` holds for the published status.
    pub async fn wait_for(&self, predicate: impl FnMut(&SyncStatus) -> bool) -> SyncStatus {
        self.handle
            .status()
            .wait_for(predicate)
            .await
            .expect("orchestrator stopped while waiting")
    }

    /// Waits until at least one attempt has been made and the queue is
    /// empty and idle.
    pub async fn drained(&self) -> SyncStatus {
        self.wait_for(|s| {
            s.last_attempt_at.is_some()
                && s.pending_count == 0
                && s.state == OrchestratorState::Idle
        })
        .await
    }

    /// Shuts the orchestrator down and returns the queue.
    pub async fn stop(self) -> TestQueue {
        self.handle.shutdown().await.expect("shutdown failed");
        self.task.await.expect("orchestrator task panicked");
        self.queue
    }
}
