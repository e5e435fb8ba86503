//! Coordinator configuration.
//!
//! Defaults are usable as-is; `from_env` overrides them from `TETHER_*`
//! environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use tether_core::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Probe cadence and quality thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityConfig {
    /// How often reachability is sampled and the health probe runs.
    pub probe_interval: Duration,
    /// Upper bound for one health probe; a slower probe counts as unreachable.
    pub probe_timeout: Duration,
    /// Probe latency below this is `excellent`.
    pub excellent_latency: Duration,
    /// Probe latency below this (and not excellent) is `good`; above is `poor`.
    pub good_latency: Duration,
    /// Consecutive identical samples required before a new status is adopted.
    pub debounce_samples: u32,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            excellent_latency: Duration::from_millis(150),
            good_latency: Duration::from_millis(600),
            debounce_samples: 2,
        }
    }
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Attempt limit and backoff applied to every queued operation.
    pub retry: RetryPolicy,
    /// Worker pool size for bulk retries.
    pub max_concurrent: usize,
    /// Per-operation replay timeout.
    pub operation_timeout: Duration,
    /// Status changes within this window are published as one notification.
    pub coalesce_window: Duration,
    /// Safety-net re-derivation of status, also drives automatic retries of
    /// operations whose backoff has elapsed.
    pub reconcile_interval: Duration,
    /// Expected replay time of one operation, used for `estimated_sync_time`.
    pub per_operation_estimate: Duration,
    /// Retry automatically on reconnect and on reconcile ticks.
    pub auto_sync: bool,
    pub connectivity: ConnectivityConfig,
    /// Endpoint for the HTTP health probe, if any.
    pub health_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent: 3,
            operation_timeout: Duration::from_secs(30),
            coalesce_window: Duration::from_millis(16),
            reconcile_interval: Duration::from_secs(30),
            per_operation_estimate: Duration::from_millis(500),
            auto_sync: true,
            connectivity: ConnectivityConfig::default(),
            health_url: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_auto_sync(mut self, enabled: bool) -> Self {
        self.auto_sync = enabled;
        self
    }

    pub fn with_connectivity(mut self, connectivity: ConnectivityConfig) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Load from `TETHER_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (environment, test map, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse::<u32>(&lookup, "TETHER_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_BACKOFF_BASE_MS")? {
            config.retry.base_delay = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_BACKOFF_MAX_MS")? {
            config.retry.max_delay = v;
        }
        if let Some(raw) = lookup("TETHER_BACKOFF_STRATEGY") {
            config.retry.strategy = match raw.trim().to_ascii_lowercase().as_str() {
                "fixed" => BackoffStrategy::Fixed,
                "linear" => BackoffStrategy::Linear,
                "exponential" => BackoffStrategy::Exponential,
                _ => {
                    return Err(ConfigError::invalid(
                        "TETHER_BACKOFF_STRATEGY",
                        raw,
                        "expected fixed, linear or exponential",
                    ));
                }
            };
        }
        if let Some(v) = parse::<f64>(&lookup, "TETHER_BACKOFF_JITTER")? {
            config.retry.jitter = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "TETHER_MAX_CONCURRENT")? {
            config.max_concurrent = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_COALESCE_WINDOW_MS")? {
            config.coalesce_window = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_RECONCILE_INTERVAL_MS")? {
            config.reconcile_interval = v;
        }
        if let Some(v) = parse::<bool>(&lookup, "TETHER_AUTO_SYNC")? {
            config.auto_sync = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_PROBE_INTERVAL_MS")? {
            config.connectivity.probe_interval = v;
        }
        if let Some(v) = millis(&lookup, "TETHER_PROBE_TIMEOUT_MS")? {
            config.connectivity.probe_timeout = v;
        }
        if let Some(v) = parse::<u32>(&lookup, "TETHER_DEBOUNCE_SAMPLES")? {
            config.connectivity.debounce_samples = v;
        }
        if let Some(url) = lookup("TETHER_HEALTH_URL").filter(|u| !u.trim().is_empty()) {
            config.health_url = Some(url.trim().to_string());
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("TETHER_MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("TETHER_MAX_CONCURRENT", "0", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid(
                "TETHER_BACKOFF_JITTER",
                self.retry.jitter.to_string(),
                "must be between 0 and 1",
            ));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(ConfigError::invalid(
                "TETHER_BACKOFF_MAX_MS",
                self.retry.max_delay.as_millis().to_string(),
                "must not be below the base delay",
            ));
        }
        if self.connectivity.debounce_samples == 0 {
            return Err(ConfigError::invalid("TETHER_DEBOUNCE_SAMPLES", "0", "must be at least 1"));
        }
        if self.connectivity.good_latency < self.connectivity.excellent_latency {
            return Err(ConfigError::invalid(
                "good_latency",
                format!("{:?}", self.connectivity.good_latency),
                "must not be below excellent_latency",
            ));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, raw, e.to_string())),
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_concurrent, 3);
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = CoordinatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, CoordinatorConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = CoordinatorConfig::from_lookup(lookup(&[
            ("TETHER_MAX_ATTEMPTS", "7"),
            ("TETHER_MAX_CONCURRENT", "2"),
            ("TETHER_OPERATION_TIMEOUT_MS", "1500"),
            ("TETHER_BACKOFF_STRATEGY", "Linear"),
            ("TETHER_AUTO_SYNC", "false"),
            ("TETHER_HEALTH_URL", " https://api.example.test/health "),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.operation_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.strategy, BackoffStrategy::Linear);
        assert!(!config.auto_sync);
        assert_eq!(config.health_url.as_deref(), Some("https://api.example.test/health"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = CoordinatorConfig::from_lookup(lookup(&[("TETHER_MAX_CONCURRENT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TETHER_MAX_CONCURRENT", .. }));

        let err = CoordinatorConfig::from_lookup(lookup(&[("TETHER_MAX_CONCURRENT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TETHER_MAX_CONCURRENT", .. }));

        let err = CoordinatorConfig::from_lookup(lookup(&[("TETHER_BACKOFF_STRATEGY", "random")])).unwrap_err();
        assert!(err.to_string().contains("TETHER_BACKOFF_STRATEGY"));
    }
}
