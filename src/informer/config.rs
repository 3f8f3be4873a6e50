/**
 * Configuration constants and options for informers, work queues and watch recovery
 */
use super::source::Selector;
use std::time::Duration;
use tracing::warn;

/// Default period between forced full re-lists in seconds (0 disables the timer)
pub const DEFAULT_RESYNC_SECONDS: u64 = 600;

/// Default number of queue consumers per informer
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of re-queues a failing work item gets before it is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Per-key rate limiter starting delay in milliseconds
pub const DEFAULT_RATE_LIMIT_BASE_MS: u64 = 5;

/// Per-key rate limiter ceiling in milliseconds
pub const DEFAULT_RATE_LIMIT_MAX_MS: u64 = 300_000;

/// Initial backoff time in milliseconds between watch re-attach attempts
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff time in seconds between watch re-attach attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Fraction of each backoff delay added as random jitter
pub const BACKOFF_JITTER: f64 = 0.2;

/// Server-side watch timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// How long `stop` waits for tasks before aborting them
pub const STOP_GRACE_PERIOD_SECONDS: u64 = 5;

/// Channel buffer size for watch events pumped from a transport
pub const WATCH_CHANNEL_CAPACITY: usize = 100;

/// Channel buffer size for normalized observations
pub const OBSERVATION_CHANNEL_CAPACITY: usize = 256;

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_WORKER_COUNT > 0, "DEFAULT_WORKER_COUNT must be greater than 0");
    assert!(DEFAULT_RATE_LIMIT_BASE_MS > 0, "DEFAULT_RATE_LIMIT_BASE_MS must be greater than 0");
    assert!(
        DEFAULT_RATE_LIMIT_MAX_MS >= DEFAULT_RATE_LIMIT_BASE_MS,
        "DEFAULT_RATE_LIMIT_MAX_MS must not be below the base delay"
    );
    assert!(INITIAL_BACKOFF_MS > 0, "INITIAL_BACKOFF_MS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(WATCH_CHANNEL_CAPACITY > 0, "WATCH_CHANNEL_CAPACITY must be greater than 0");
    assert!(
        OBSERVATION_CHANNEL_CAPACITY > 0,
        "OBSERVATION_CHANNEL_CAPACITY must be greater than 0"
    );
};

/// Per-key exponential delay applied by `WorkQueue::add_rate_limited`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RATE_LIMIT_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RATE_LIMIT_MAX_MS),
        }
    }
}

/// Jittered exponential backoff used when the watch has to be re-attached
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(INITIAL_BACKOFF_MS),
            max: Duration::from_secs(MAX_BACKOFF_SECONDS),
            jitter: BACKOFF_JITTER,
        }
    }
}

/// Configuration for a single informer
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Used in logs and as the `informer` metric label
    pub name: String,
    pub selector: Selector,
    /// `Duration::ZERO` means watch-only
    pub resync_period: Duration,
    pub worker_count: usize,
    pub rate_limiter: RateLimiterConfig,
    pub max_retries: u32,
    pub watch_backoff: BackoffConfig,
    pub stop_grace_period: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            selector: Selector::default(),
            resync_period: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            worker_count: DEFAULT_WORKER_COUNT,
            rate_limiter: RateLimiterConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            watch_backoff: BackoffConfig::default(),
            stop_grace_period: Duration::from_secs(STOP_GRACE_PERIOD_SECONDS),
        }
    }
}

impl InformerConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from `INFORMER_*` environment variables
    #[must_use]
    pub fn from_env(name: impl Into<String>) -> Self {
        Self::from_lookup(name, |key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Values that fail to parse are ignored with a warning and the default is kept.
    #[must_use]
    pub fn from_lookup<F>(name: impl Into<String>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(name);

        if let Some(secs) = parse_var::<u64>(&lookup, "INFORMER_RESYNC_SECONDS") {
            config.resync_period = Duration::from_secs(secs);
        }
        if let Some(workers) = parse_var::<usize>(&lookup, "INFORMER_WORKERS") {
            config = config.with_worker_count(workers);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "INFORMER_MAX_RETRIES") {
            config.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "INFORMER_RATE_LIMIT_BASE_MS") {
            config.rate_limiter.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "INFORMER_RATE_LIMIT_MAX_MS") {
            config.rate_limiter.max_delay = Duration::from_millis(ms);
        }
        if let Some(ns) = lookup("INFORMER_NAMESPACE").filter(|ns| !ns.is_empty()) {
            config.selector.namespace = Some(ns);
        }
        if let Some(labels) = lookup("INFORMER_LABEL_SELECTOR").filter(|l| !l.is_empty()) {
            config.selector.label_selector = Some(labels);
        }

        config
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub const fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Zero workers is treated as one
    #[must_use]
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers.max(1);
        self
    }

    #[must_use]
    pub const fn with_rate_limiter(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.rate_limiter = RateLimiterConfig {
            base_delay,
            max_delay,
        };
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_watch_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.watch_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}, keeping default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("INFORMER_RESYNC_SECONDS", "0"),
            ("INFORMER_WORKERS", "3"),
            ("INFORMER_MAX_RETRIES", "2"),
            ("INFORMER_RATE_LIMIT_BASE_MS", "10"),
            ("INFORMER_NAMESPACE", "security"),
            ("INFORMER_LABEL_SELECTOR", "app=trivy"),
        ]);
        let config =
            InformerConfig::from_lookup("reports", |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.name, "reports");
        assert_eq!(config.resync_period, Duration::ZERO);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.rate_limiter.base_delay, Duration::from_millis(10));
        assert_eq!(
            config.rate_limiter.max_delay,
            Duration::from_millis(DEFAULT_RATE_LIMIT_MAX_MS)
        );
        assert_eq!(config.selector.namespace.as_deref(), Some("security"));
        assert_eq!(config.selector.label_selector.as_deref(), Some("app=trivy"));
    }

    #[test]
    fn test_unparsable_values_keep_defaults() {
        let config = InformerConfig::from_lookup("x", |k| {
            (k == "INFORMER_WORKERS").then(|| "many".to_string())
        });
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config = InformerConfig::new("x").with_worker_count(0);
        assert_eq!(config.worker_count, 1);
    }
}
