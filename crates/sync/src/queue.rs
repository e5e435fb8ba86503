//! In-memory queue of failed operations.
//!
//! The queue is the single shared mutable resource of the coordinator. Every
//! mutation takes one short-lived lock and never holds it across a replay.
//! Each mutation publishes [`QueueEvent`]s and marks the aggregate status
//! dirty after the lock is released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use tether_core::{
    FailedOperation, OperationId, OperationKey, OperationType, Priority, ReplayError, RetryPolicy, RetryStats,
};
use tether_events::{EventBus, InMemoryEventBus, QueueEvent, Resolution};

use crate::status::ChangeSignal;

/// A replayable unit of work. Opaque to the coordinator.
#[async_trait]
pub trait ReplayOperation: Send + Sync {
    /// Identity of the work. Reports with the same `(type, entity, key)` are
    /// merged into one queue entry.
    fn key(&self) -> OperationKey;

    async fn replay(&self) -> Result<(), ReplayError>;
}

/// [`ReplayOperation`] backed by an async closure.
pub struct FnReplay<F> {
    key: OperationKey,
    f: F,
}

#[async_trait]
impl<F, Fut> ReplayOperation for FnReplay<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ReplayError>> + Send,
{
    fn key(&self) -> OperationKey {
        self.key.clone()
    }

    async fn replay(&self) -> Result<(), ReplayError> {
        (self.f)().await
    }
}

/// Wrap an async closure as a shareable replay handle.
pub fn replay_fn<F, Fut>(key: impl Into<OperationKey>, f: F) -> Arc<dyn ReplayOperation>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReplayError>> + Send + 'static,
{
    Arc::new(FnReplay { key: key.into(), f })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),
    #[error("operation {0} is already being retried")]
    InFlight(OperationId),
    #[error("operation {0} is not retryable")]
    NotRetryable(OperationId),
}

/// Result of [`OperationQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Inserted(FailedOperation),
    /// The report matched an existing entry, which was updated.
    Merged(FailedOperation),
}

impl EnqueueOutcome {
    pub fn operation(&self) -> &FailedOperation {
        match self {
            EnqueueOutcome::Inserted(op) | EnqueueOutcome::Merged(op) => op,
        }
    }

    pub fn id(&self) -> OperationId {
        self.operation().id
    }
}

/// An operation handed out for replay. While claimed, no other retry can
/// pick it up.
pub struct Claim {
    pub operation: FailedOperation,
    pub replay: Arc<dyn ReplayOperation>,
}

struct QueueEntry {
    record: FailedOperation,
    replay: Arc<dyn ReplayOperation>,
    in_flight: bool,
}

/// Retry order: priority band, then oldest first, then id.
fn retry_order(op: &FailedOperation) -> (Priority, DateTime<Utc>, OperationId) {
    (op.priority, op.created_at, op.id)
}

pub struct OperationQueue {
    entries: Mutex<HashMap<OperationId, QueueEntry>>,
    events: Arc<InMemoryEventBus<QueueEvent>>,
    signal: Arc<ChangeSignal>,
}

impl OperationQueue {
    pub fn new(events: Arc<InMemoryEventBus<QueueEvent>>, signal: Arc<ChangeSignal>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            signal,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, QueueEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: QueueEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!(error = ?e, "failed to publish queue event");
        }
    }

    fn changed(&self) {
        self.publish(QueueEvent::RetryStatsChanged { stats: self.stats() });
        self.signal.mark_dirty();
    }

    /// Queue a failure, or merge it into the entry for the same logical failure.
    pub fn enqueue(&self, record: FailedOperation, replay: Arc<dyn ReplayOperation>) -> EnqueueOutcome {
        let outcome = {
            let mut entries = self.lock();
            let existing = entries
                .values_mut()
                .find(|e| e.record.same_failure(record.op_type, &record.entity, &record.operation));

            match existing {
                Some(entry) => {
                    entry.record.merge(&record);
                    if !entry.in_flight {
                        entry.replay = replay;
                    }
                    EnqueueOutcome::Merged(entry.record.clone())
                }
                None => {
                    let snapshot = record.clone();
                    entries.insert(
                        record.id,
                        QueueEntry {
                            record,
                            replay,
                            in_flight: false,
                        },
                    );
                    EnqueueOutcome::Inserted(snapshot)
                }
            }
        };

        let merged = matches!(outcome, EnqueueOutcome::Merged(_));
        debug!(
            operation_id = %outcome.id(),
            merged,
            attempts = outcome.operation().attempts,
            "failed operation queued"
        );
        self.publish(QueueEvent::FailedOperationAdded {
            operation: outcome.operation().clone(),
            merged,
        });
        self.changed();
        outcome
    }

    /// Remove one entry. Returns `false` if it was not queued.
    pub fn remove(&self, id: OperationId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            self.publish(QueueEvent::FailedOperationResolved {
                operation_id: id,
                resolution: Resolution::Cleared,
            });
            self.changed();
        }
        removed
    }

    pub fn get(&self, id: OperationId) -> Option<FailedOperation> {
        self.lock().get(&id).map(|e| e.record.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every entry, in retry order.
    pub fn all(&self) -> Vec<FailedOperation> {
        self.collect(|_| true)
    }

    pub fn by_type(&self, op_type: OperationType) -> Vec<FailedOperation> {
        self.collect(|e| e.record.op_type == op_type)
    }

    pub fn by_entity(&self, entity: &str) -> Vec<FailedOperation> {
        self.collect(|e| e.record.entity == entity)
    }

    /// Retryable entries not currently being retried, in retry order.
    ///
    /// With `due_at`, entries still inside their backoff window are skipped.
    pub fn retryable(&self, due_at: Option<DateTime<Utc>>) -> Vec<FailedOperation> {
        self.collect(|e| {
            e.record.is_retryable() && !e.in_flight && due_at.map_or(true, |now| e.record.is_due(now))
        })
    }

    fn collect(&self, filter: impl Fn(&QueueEntry) -> bool) -> Vec<FailedOperation> {
        let mut ops: Vec<FailedOperation> = self
            .lock()
            .values()
            .filter(|e| filter(e))
            .map(|e| e.record.clone())
            .collect();
        ops.sort_by_key(retry_order);
        ops
    }

    /// Statistics over the current contents.
    pub fn stats(&self) -> RetryStats {
        let entries = self.lock();
        RetryStats::from_operations(entries.values().map(|e| &e.record))
    }

    /// Remove everything. Returns the removed ids.
    pub fn clear_all(&self) -> Vec<OperationId> {
        let removed: Vec<OperationId> = self.lock().drain().map(|(id, _)| id).collect();
        self.resolved(&removed);
        removed
    }

    /// Remove exhausted entries; active ones (including permanent failures
    /// awaiting manual resolution) stay.
    pub fn clear_resolved(&self) -> Vec<OperationId> {
        let removed: Vec<OperationId> = {
            let mut entries = self.lock();
            let ids: Vec<OperationId> = entries
                .values()
                .filter(|e| e.record.is_exhausted() && !e.in_flight)
                .map(|e| e.record.id)
                .collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };
        self.resolved(&removed);
        removed
    }

    fn resolved(&self, ids: &[OperationId]) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.publish(QueueEvent::FailedOperationResolved {
                operation_id: *id,
                resolution: Resolution::Cleared,
            });
        }
        self.changed();
    }

    /// Hand out an entry for replay and mark it in flight.
    pub fn claim(&self, id: OperationId) -> Result<Claim, QueueError> {
        self.claim_where(id, |_| true)
    }

    /// Like [`claim`](Self::claim), but only while the entry is still
    /// retryable (and, with `due_at`, out of its backoff window).
    pub fn claim_retryable(&self, id: OperationId, due_at: Option<DateTime<Utc>>) -> Result<Claim, QueueError> {
        self.claim_where(id, |op| op.is_retryable() && due_at.map_or(true, |now| op.is_due(now)))
    }

    fn claim_where(&self, id: OperationId, eligible: impl Fn(&FailedOperation) -> bool) -> Result<Claim, QueueError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if entry.in_flight {
            return Err(QueueError::InFlight(id));
        }
        if !eligible(&entry.record) {
            return Err(QueueError::NotRetryable(id));
        }
        entry.in_flight = true;
        Ok(Claim {
            operation: entry.record.clone(),
            replay: entry.replay.clone(),
        })
    }

    /// The replay succeeded: drop the entry.
    ///
    /// Returns `None` if the entry was cleared while in flight.
    pub fn complete_success(&self, id: OperationId) -> Option<FailedOperation> {
        let removed = self.lock().remove(&id).map(|e| e.record);
        if removed.is_some() {
            self.publish(QueueEvent::FailedOperationResolved {
                operation_id: id,
                resolution: Resolution::Succeeded,
            });
            self.changed();
        }
        removed
    }

    /// The replay failed: update counters and release the claim.
    ///
    /// Returns the updated record, or `None` if it was cleared while in flight.
    pub fn complete_failure(
        &self,
        id: OperationId,
        error: &ReplayError,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<FailedOperation> {
        let updated = {
            let mut entries = self.lock();
            entries.get_mut(&id).map(|entry| {
                entry.in_flight = false;
                entry.record.record_failure(error, now, policy);
                entry.record.clone()
            })
        };
        if updated.is_some() {
            self.changed();
        }
        updated
    }
}

impl core::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationQueue").field("len", &self.len()).finish()
    }
}
