//! Retry policy and retry outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::id::OperationId;

/// How the delay grows between consecutive retries of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` every time
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Attempt limit and backoff shared by every queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed per operation before it is exhausted.
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0), applied as +/- a fraction of the delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-indexed), without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Delay before retry number `attempt` of operation `id`, with jitter.
    ///
    /// The jitter is derived from the operation id and attempt so that
    /// operations queued together spread out, while a given operation always
    /// computes the same delay. The result never exceeds `max_delay`.
    pub fn delay_for(&self, id: OperationId, attempt: u32) -> Duration {
        let delay = self.base_delay_for_attempt(attempt);
        if delay.is_zero() || self.jitter <= 0.0 {
            return delay;
        }

        let delay_ms = delay.as_millis() as f64;
        let jitter_range = delay_ms * self.jitter;
        let seed = id.as_uuid().as_u128() ^ (u128::from(attempt) * 0x9E37_79B9_7F4A_7C15);
        let pseudo_random = (seed % 1000) as f64 / 1000.0;
        let jittered = delay_ms + jitter_range * (pseudo_random - 0.5) * 2.0;

        let max_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }
}

/// Outcome of one retry attempt.
///
/// Always produced, even when the replay panicked, timed out, or the
/// operation could not be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResult {
    pub operation_id: OperationId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts recorded on the operation after this retry.
    pub attempts: u32,
    /// The operation is exhausted after this retry.
    pub exhausted: bool,
}

impl RetryResult {
    pub fn succeeded(operation_id: OperationId, attempts: u32) -> Self {
        Self {
            operation_id,
            success: true,
            error: None,
            attempts,
            exhausted: false,
        }
    }

    pub fn failed(operation_id: OperationId, error: impl Into<String>) -> Self {
        Self {
            operation_id,
            success: false,
            error: Some(error.into()),
            attempts: 0,
            exhausted: false,
        }
    }

    pub fn with_attempts(mut self, attempts: u32, exhausted: bool) -> Self {
        self.attempts = attempts;
        self.exhausted = exhausted;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.base_delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy::exponential(50, Duration::from_millis(500), Duration::from_secs(5));
        assert_eq!(policy.base_delay_for_attempt(40), Duration::from_secs(5));
        assert!(policy.delay_for(OperationId::new(), 40) <= Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        let id = OperationId::new();

        assert_eq!(policy.delay_for(id, 1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(id, 2), Duration::from_millis(500));
        assert_eq!(policy.delay_for(id, 3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.base_delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_range_and_is_stable() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(1000), Duration::from_secs(60))
            .with_jitter(0.25);

        for _ in 0..50 {
            let id = OperationId::new();
            let d = policy.delay_for(id, 2);
            assert!(d >= Duration::from_millis(1500), "{d:?}");
            assert!(d <= Duration::from_millis(2500), "{d:?}");
            assert_eq!(d, policy.delay_for(id, 2));
        }
    }

    #[test]
    fn retry_result_serializes_camel_case() {
        let id = OperationId::new();
        let json = serde_json::to_value(RetryResult::failed(id, "boom")).unwrap();
        assert_eq!(json["operationId"], id.to_string());
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
    }
}
