//! Configuration for the sync engine.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use studysync_protocol::ConflictPolicy;

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of concurrent remote calls (each for a distinct entity).
    pub parallelism: usize,
    /// Timeout for a single remote call.
    pub request_timeout: Duration,
    /// Backoff configuration for transient failures.
    pub retry: RetryConfig,
    /// Conflict policy per entity type.
    pub policies: PolicyTable,
    /// Number of rejected changes, and of auto-resolved conflicts, kept in the status.
    pub rejected_history: usize,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            parallelism: 3,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            policies: PolicyTable::default(),
            rejected_history: 50,
        }
    }

    /// Sets the number of concurrent remote calls.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conflict policy table.
    pub fn with_policies(mut self, policies: PolicyTable) -> Self {
        self.policies = policies;
        self
    }

    /// Sets how many rejected changes the status keeps.
    pub fn with_rejected_history(mut self, len: usize) -> Self {
        self.rejected_history = len;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates the default backoff: 1s base, factor 2, 60s cap, with jitter.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-based).
    ///
    /// The result never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let delay_secs = base_delay.min(max_secs);

        let delay_secs = if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            (delay_secs + jitter).min(max_secs)
        } else {
            delay_secs
        };

        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps entity types to their conflict policy.
///
/// Entity types that are not listed fall back to the default policy
/// ([`ConflictPolicy::AutoMerge`] unless changed).
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    policies: HashMap<String, ConflictPolicy>,
    fallback: ConflictPolicy,
}

impl PolicyTable {
    /// Creates an empty table with the default fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the policy for one entity type.
    pub fn with_policy(mut self, entity_type: impl Into<String>, policy: ConflictPolicy) -> Self {
        self.policies.insert(entity_type.into(), policy);
        self
    }

    /// Sets the policy for entity types that are not listed.
    pub fn with_fallback(mut self, policy: ConflictPolicy) -> Self {
        self.fallback = policy;
        self
    }

    /// Returns the policy for an entity type.
    pub fn policy_for(&self, entity_type: &str) -> ConflictPolicy {
        self.policies
            .get(entity_type)
            .copied()
            .unwrap_or(self.fallback)
    }
}

/// Configuration for the local change store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Failed attempts allowed before a change is dead-lettered.
    pub max_retries: u32,
}

impl StoreConfig {
    /// Creates a configuration with the default retry cap (10).
    pub fn new() -> Self {
        Self { max_retries: 10 }
    }

    /// Sets the retry cap.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the network monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long a new status must hold before it is published.
    pub debounce: Duration,
    /// Interval between connectivity probes, if a probe is installed.
    pub probe_interval: Duration,
}

impl MonitorConfig {
    /// Creates a configuration with a 2s debounce window and 5s probe interval.
    pub fn new() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            probe_interval: Duration::from_secs(5),
        }
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the probe interval.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}
