//! Network connectivity monitoring.
//!
//! Raw connectivity observations are noisy: a flaky link can report
//! offline/online several times a second. The monitor only publishes a new
//! status after it has held for a full debounce window, so subscribers (the
//! sync orchestrator) see at most one transition per window.

use crate::config::MonitorConfig;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Connectivity as seen by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// The remote is believed reachable.
    Online,
    /// The remote is believed unreachable.
    Offline,
}

impl NetworkStatus {
    /// Returns true if online.
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

impl From<bool> for NetworkStatus {
    fn from(online: bool) -> Self {
        if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "online"),
            NetworkStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Trailing-edge debouncer for connectivity observations.
///
/// A status different from the committed one becomes a candidate when first
/// observed and is committed once it has been the latest observation for
/// the whole window. Observing the committed status again drops the
/// candidate.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    committed: NetworkStatus,
    candidate: Option<(NetworkStatus, Instant)>,
}

impl Debouncer {
    /// Creates a debouncer starting at `initial`.
    pub fn new(initial: NetworkStatus, window: Duration) -> Self {
        Self {
            window,
            committed: initial,
            candidate: None,
        }
    }

    /// Returns the committed status.
    pub fn current(&self) -> NetworkStatus {
        self.committed
    }

    /// Records a raw observation.
    pub fn observe(&mut self, status: NetworkStatus, now: Instant) {
        if status == self.committed {
            self.candidate = None;
        } else if self.candidate.map(|(s, _)| s) != Some(status) {
            self.candidate = Some((status, now));
        }
    }

    /// Commits the candidate if it has held for the window.
    pub fn poll(&mut self, now: Instant) -> Option<NetworkStatus> {
        let (status, since) = self.candidate?;
        if now.duration_since(since) >= self.window {
            self.committed = status;
            self.candidate = None;
            Some(status)
        } else {
            None
        }
    }

    /// Returns when the pending candidate would be committed.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate.map(|(_, since)| since + self.window)
    }
}

/// An active connectivity check, polled by the monitor at an interval.
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Returns true if the remote is reachable.
    fn check(&self) -> impl Future<Output = bool> + Send;
}

struct NoProbe;

impl ConnectivityProbe for NoProbe {
    async fn check(&self) -> bool {
        true
    }
}

/// Debounced connectivity monitor.
///
/// Platform hooks feed raw observations through [`NetworkMonitor::observe`]
/// (or an installed [`ConnectivityProbe`] produces them); committed
/// transitions are published on a watch channel. Observations are not
/// buffered: a burst collapses to its latest status, so the final transition
/// of a burst is never lost. The monitor only signals state and never touches
/// the queue.
#[derive(Debug)]
pub struct NetworkMonitor {
    observations: watch::Sender<NetworkStatus>,
    status: watch::Receiver<NetworkStatus>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Starts a monitor fed only by explicit observations.
    pub fn spawn(initial: NetworkStatus, config: MonitorConfig) -> Self {
        Self::start(initial, config, None::<NoProbe>)
    }

    /// Starts a monitor that also polls `probe` every probe interval.
    pub fn spawn_with_probe<P: ConnectivityProbe>(
        initial: NetworkStatus,
        config: MonitorConfig,
        probe: P,
    ) -> Self {
        Self::start(initial, config, Some(probe))
    }

    fn start<P: ConnectivityProbe>(
        initial: NetworkStatus,
        config: MonitorConfig,
        probe: Option<P>,
    ) -> Self {
        let (obs_tx, obs_rx) = watch::channel(initial);
        let (status_tx, status_rx) = watch::channel(initial);
        let task = tokio::spawn(run_monitor(
            Debouncer::new(initial, config.debounce),
            config.probe_interval,
            obs_rx,
            status_tx,
            probe,
        ));

        Self {
            observations: obs_tx,
            status: status_rx,
            task,
        }
    }

    /// Reports a raw connectivity observation.
    pub fn observe(&self, status: NetworkStatus) -> SyncResult<()> {
        self.observations
            .send(status)
            .map_err(|_| SyncError::Stopped)
    }

    /// Returns the committed status.
    pub fn current_status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Subscribes to committed transitions.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.clone()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_monitor<P: ConnectivityProbe>(
    mut debouncer: Debouncer,
    probe_interval: Duration,
    mut observations: watch::Receiver<NetworkStatus>,
    status: watch::Sender<NetworkStatus>,
    probe: Option<P>,
) {
    let mut ticker = tokio::time::interval(probe_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = debouncer.deadline();

        tokio::select! {
            changed = observations.changed() => match changed {
                Ok(()) => {
                    let observed = *observations.borrow_and_update();
                    debug!(status = %observed, "connectivity observed");
                    debouncer.observe(observed, Instant::now());
                }
                Err(_) => break,
            },
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            _ = ticker.tick(), if probe.is_some() => {
                if let Some(probe) = &probe {
                    let observed = NetworkStatus::from(probe.check().await);
                    debouncer.observe(observed, Instant::now());
                }
            }
        }

        if let Some(committed) = debouncer.poll(Instant::now()) {
            info!(status = %committed, "network status changed");
            status.send_replace(committed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn debouncer_commits_after_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(NetworkStatus::Offline, WINDOW);

        debouncer.observe(NetworkStatus::Online, start);
        assert_eq!(debouncer.poll(start + Duration::from_secs(1)), None);
        assert_eq!(debouncer.deadline(), Some(start + WINDOW));
        assert_eq!(
            debouncer.poll(start + WINDOW),
            Some(NetworkStatus::Online)
        );
        assert_eq!(debouncer.current(), NetworkStatus::Online);
        assert_eq!(debouncer.deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_ignores_flapping() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(NetworkStatus::Online, WINDOW);

        let mut t = start;
        for _ in 0..10 {
            debouncer.observe(NetworkStatus::Offline, t);
            t += Duration::from_millis(500);
            debouncer.observe(NetworkStatus::Online, t);
            t += Duration::from_millis(500);
            assert_eq!(debouncer.poll(t), None);
        }
        assert_eq!(debouncer.current(), NetworkStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_repeated_observation_keeps_first_time() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(NetworkStatus::Online, WINDOW);

        debouncer.observe(NetworkStatus::Offline, start);
        debouncer.observe(NetworkStatus::Offline, start + Duration::from_secs(1));
        assert_eq!(
            debouncer.poll(start + WINDOW),
            Some(NetworkStatus::Offline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_publishes_debounced_transition() {
        let monitor = NetworkMonitor::spawn(NetworkStatus::Offline, MonitorConfig::default());
        let mut rx = monitor.subscribe();

        monitor.observe(NetworkStatus::Online).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.current_status(), NetworkStatus::Offline);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Online);
        assert_eq!(monitor.current_status(), NetworkStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_drops_short_blip() {
        let monitor = NetworkMonitor::spawn(NetworkStatus::Online, MonitorConfig::default());

        monitor.observe(NetworkStatus::Offline).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        monitor.observe(NetworkStatus::Online).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(monitor.current_status(), NetworkStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_keeps_last_observation_of_a_burst() {
        let monitor = NetworkMonitor::spawn(NetworkStatus::Online, MonitorConfig::default());

        // The monitor task does not run until this test yields.
        for _ in 0..200 {
            monitor.observe(NetworkStatus::Online).unwrap();
        }
        monitor.observe(NetworkStatus::Offline).unwrap();
        tokio::time::sleep(WINDOW + Duration::from_secs(1)).await;

        assert_eq!(monitor.current_status(), NetworkStatus::Offline);
    }

    struct FlagProbe(Arc<AtomicBool>);

    impl ConnectivityProbe for FlagProbe {
        async fn check(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_polls_probe() {
        let reachable = Arc::new(AtomicBool::new(true));
        let monitor = NetworkMonitor::spawn_with_probe(
            NetworkStatus::Online,
            MonitorConfig::default().with_probe_interval(Duration::from_secs(1)),
            FlagProbe(reachable.clone()),
        );

        reachable.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.current_status(), NetworkStatus::Offline);
    }
}
