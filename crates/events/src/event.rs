//! Coordinator events published to subscribers.

use serde::{Deserialize, Serialize};

use tether_core::{FailedOperation, OperationId, RetryResult, RetryStats};

/// Why an operation left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A retry succeeded.
    Succeeded,
    /// Removed by an explicit clear.
    Cleared,
}

/// Change notification for the failed-operation queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A new failure was queued, or a duplicate was merged into `operation`.
    FailedOperationAdded { operation: FailedOperation, merged: bool },
    /// A retry attempt finished (successfully or not).
    FailedOperationRetried { result: RetryResult },
    /// An operation left the queue.
    FailedOperationResolved { operation_id: OperationId, resolution: Resolution },
    /// Stats after any queue mutation.
    RetryStatsChanged { stats: RetryStats },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::FailedOperationAdded { .. } => "failed_operation_added",
            QueueEvent::FailedOperationRetried { .. } => "failed_operation_retried",
            QueueEvent::FailedOperationResolved { .. } => "failed_operation_resolved",
            QueueEvent::RetryStatsChanged { .. } => "retry_stats_changed",
        }
    }
}
