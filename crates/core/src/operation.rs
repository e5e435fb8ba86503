//! Queued failed operations and their classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReplayError;
use crate::id::OperationId;
use crate::retry::RetryPolicy;

/// Kind of work a failed operation represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Query,
    Mutation,
    BatchOperation,
    /// A multi-step domain workflow (e.g. building a daily plan).
    DomainWorkflow,
}

impl OperationType {
    pub const ALL: [OperationType; 4] = [
        OperationType::Query,
        OperationType::Mutation,
        OperationType::BatchOperation,
        OperationType::DomainWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::BatchOperation => "batch_operation",
            OperationType::DomainWorkflow => "domain_workflow",
        }
    }
}

/// Retry priority. Ordering is retry order: `Critical < Normal < Low`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Classification of the failure that produced (or last updated) an operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// No path to the backend. Always retryable; does not consume attempts.
    Connectivity,
    /// 5xx/timeout. Retryable up to `max_attempts`.
    Transient,
    /// Validation/conflict/4xx. Kept for manual resolution, never retried in bulk.
    Permanent,
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Active,
    /// Used every allowed attempt without success. Terminal until cleared.
    Exhausted,
}

/// Identity of the replayable work, as reported by the replay handle.
///
/// Two failures with the same `(type, entity, key)` are the same logical
/// failure and are merged instead of queued twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One queued unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity: String,
    pub operation: OperationKey,
    pub failure: FailureClass,
    pub state: OperationState,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// Earliest time an automatic retry may run. `None` means due now.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl FailedOperation {
    /// Record a freshly reported failure.
    ///
    /// `max_attempts` below 1 is raised to 1.
    pub fn new(
        op_type: OperationType,
        entity: impl Into<String>,
        operation: OperationKey,
        error: &ReplayError,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OperationId::new(),
            op_type,
            entity: entity.into(),
            operation,
            failure: error.class(),
            state: OperationState::Active,
            priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            last_error: error.message().to_string(),
            created_at: now,
            last_attempt_at: now,
            next_attempt_at: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure.is_retryable() && self.state == OperationState::Active
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == OperationState::Exhausted
    }

    /// Whether an automatic retry is allowed at `now` (backoff elapsed).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }

    /// Same logical failure as `other`?
    pub fn same_failure(&self, op_type: OperationType, entity: &str, operation: &OperationKey) -> bool {
        self.op_type == op_type && self.entity == entity && &self.operation == operation
    }

    /// Apply the outcome of a failed replay.
    ///
    /// Connectivity failures only refresh the error and timestamps. Transient
    /// failures consume an attempt and schedule backoff. Permanent failures
    /// consume an attempt and reclassify the operation as permanent.
    pub fn record_failure(&mut self, error: &ReplayError, now: DateTime<Utc>, policy: &RetryPolicy) {
        self.last_error = error.message().to_string();
        self.last_attempt_at = now;

        match error.class() {
            FailureClass::Connectivity => {
                let delay = policy.delay_for(self.id, self.attempts.max(1));
                self.next_attempt_at = Some(now + chrono_delay(delay));
            }
            FailureClass::Transient => {
                self.consume_attempt();
                if self.is_retryable() {
                    let delay = policy.delay_for(self.id, self.attempts);
                    self.next_attempt_at = Some(now + chrono_delay(delay));
                }
            }
            FailureClass::Permanent => {
                self.failure = FailureClass::Permanent;
                self.attempts = (self.attempts + 1).min(self.max_attempts);
                self.next_attempt_at = None;
            }
        }
    }

    /// Fold a duplicate report of the same logical failure into this record.
    ///
    /// Bumps `attempts`, keeps the more urgent priority and refreshes the
    /// error. A permanent classification is never downgraded. Connectivity
    /// reports are counted but stop one short of `max_attempts`, so they
    /// never exhaust the operation.
    pub fn merge_duplicate(&mut self, error: &ReplayError, priority: Priority, now: DateTime<Utc>) {
        if self.failure != FailureClass::Permanent {
            self.failure = error.class();
        }
        self.priority = self.priority.min(priority);
        self.last_error = error.message().to_string();
        self.last_attempt_at = now;
        if self.failure == FailureClass::Connectivity {
            let cap = self.max_attempts.saturating_sub(1);
            self.attempts = (self.attempts + 1).min(cap).max(self.attempts);
        } else {
            self.consume_attempt();
        }
    }

    /// Fold a newer report of the same logical failure into this record.
    pub fn merge(&mut self, newer: &FailedOperation) {
        let error = match newer.failure {
            FailureClass::Connectivity => ReplayError::connectivity(newer.last_error.clone()),
            FailureClass::Transient => ReplayError::transient(newer.last_error.clone()),
            FailureClass::Permanent => ReplayError::permanent(newer.last_error.clone()),
        };
        self.merge_duplicate(&error, newer.priority, newer.last_attempt_at);
    }

    fn consume_attempt(&mut self) {
        if self.state == OperationState::Exhausted {
            return;
        }
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        if self.attempts >= self.max_attempts && self.failure.is_retryable() {
            self.state = OperationState::Exhausted;
            self.next_attempt_at = None;
        }
    }
}

fn chrono_delay(delay: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(max_attempts: u32) -> FailedOperation {
        FailedOperation::new(
            OperationType::Mutation,
            "job",
            OperationKey::new("update_job:42"),
            &ReplayError::transient("503"),
            Priority::Normal,
            max_attempts,
            Utc::now(),
        )
    }

    #[test]
    fn priority_orders_critical_first() {
        let mut ps = vec![Priority::Low, Priority::Critical, Priority::Normal];
        ps.sort();
        assert_eq!(ps, vec![Priority::Critical, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn transient_failures_exhaust_at_max_attempts() {
        let policy = RetryPolicy::default();
        let mut op = op(3);
        let now = Utc::now();

        for _ in 0..2 {
            op.record_failure(&ReplayError::transient("503"), now, &policy);
            assert!(op.is_retryable());
        }
        op.record_failure(&ReplayError::transient("503"), now, &policy);

        assert_eq!(op.attempts, 3);
        assert!(op.is_exhausted());
        assert!(!op.is_retryable());
        assert_eq!(op.next_attempt_at, None);
    }

    #[test]
    fn attempts_never_exceed_max() {
        let policy = RetryPolicy::default();
        let mut op = op(1);
        let now = Utc::now();
        op.record_failure(&ReplayError::transient("a"), now, &policy);
        op.record_failure(&ReplayError::transient("b"), now, &policy);
        op.merge_duplicate(&ReplayError::transient("c"), Priority::Low, now);
        assert_eq!(op.attempts, 1);
    }

    #[test]
    fn connectivity_failures_do_not_consume_attempts() {
        let policy = RetryPolicy::default();
        let mut op = op(2);
        let now = Utc::now();
        for _ in 0..10 {
            op.record_failure(&ReplayError::connectivity("no route"), now, &policy);
        }
        assert_eq!(op.attempts, 0);
        assert!(op.is_retryable());
        assert!(!op.is_due(now));
        assert_eq!(op.last_error, "no route");
    }

    #[test]
    fn permanent_failure_is_not_exhaustion() {
        let policy = RetryPolicy::default();
        let mut op = op(3);
        op.record_failure(&ReplayError::permanent("422"), Utc::now(), &policy);
        assert_eq!(op.failure, FailureClass::Permanent);
        assert_eq!(op.state, OperationState::Active);
        assert!(!op.is_retryable());
    }

    #[test]
    fn merge_keeps_more_urgent_priority() {
        let mut op = op(5);
        op.merge_duplicate(&ReplayError::transient("again"), Priority::Critical, Utc::now());
        assert_eq!(op.priority, Priority::Critical);
        assert_eq!(op.attempts, 1);
        op.merge_duplicate(&ReplayError::transient("again"), Priority::Low, Utc::now());
        assert_eq!(op.priority, Priority::Critical);
    }

    #[test]
    fn duplicate_connectivity_reports_never_exhaust() {
        let mut op = FailedOperation::new(
            OperationType::Mutation,
            "job",
            OperationKey::new("update_job:1"),
            &ReplayError::connectivity("offline"),
            Priority::Normal,
            3,
            Utc::now(),
        );
        for _ in 0..4 {
            op.merge_duplicate(&ReplayError::connectivity("offline"), Priority::Normal, Utc::now());
        }
        assert_eq!(op.failure, FailureClass::Connectivity);
        assert_eq!(op.state, OperationState::Active);
        assert_eq!(op.attempts, 2);
        assert!(op.is_retryable());
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let op = op(3);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "mutation");
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["priority"], "normal");
        assert!(json.get("lastAttemptAt").is_some());
    }
}
