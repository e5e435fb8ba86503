//! Aggregate [`OfflineStatus`] and its change notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use tether_core::{ConnectionQuality, ConnectionStatus, OfflineStatus, PriorityCounts, QueuedOperations};
use tether_events::{EventBus, InMemoryEventBus, Subscription, SubscriptionHandle, spawn_listener};

use crate::connectivity::ConnectivityMonitor;
use crate::manual::ManualOverride;
use crate::queue::OperationQueue;
use crate::retry::RetryCoordinator;

/// "Something that feeds the status changed."
///
/// Marks collapse into a single pending wakeup, so a burst of changes costs
/// one recomputation.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    notify: Notify,
    forced: AtomicBool,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.notify.notify_one();
    }

    /// Request a publish even if the snapshot is unchanged.
    pub fn force(&self) {
        self.forced.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume a pending force request.
    pub fn take_forced(&self) -> bool {
        self.forced.swap(false, Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Milliseconds needed to drain `retryable` operations at the given
/// concurrency over `connection`. `None` when there is nothing to do or no
/// way to do it.
pub fn estimate_sync_time(
    retryable: usize,
    concurrency: usize,
    per_operation: Duration,
    connection: &ConnectionStatus,
) -> Option<u64> {
    if retryable == 0 || !connection.is_connected {
        return None;
    }
    let factor: u64 = match connection.connection_quality {
        ConnectionQuality::Excellent => 1,
        ConnectionQuality::Good => 2,
        ConnectionQuality::Poor => 4,
        ConnectionQuality::Offline => return None,
    };
    let rounds = retryable.div_ceil(concurrency.max(1)) as u64;
    let per_operation = u64::try_from(per_operation.as_millis()).unwrap_or(u64::MAX);
    Some(rounds.saturating_mul(per_operation).saturating_mul(factor))
}

pub struct StatusAggregator {
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<OperationQueue>,
    retry: Arc<RetryCoordinator>,
    manual: Arc<ManualOverride>,
    bus: InMemoryEventBus<OfflineStatus>,
    last_published: Mutex<Option<OfflineStatus>>,
    per_operation_estimate: Duration,
}

impl StatusAggregator {
    pub fn new(
        monitor: Arc<ConnectivityMonitor>,
        queue: Arc<OperationQueue>,
        retry: Arc<RetryCoordinator>,
        manual: Arc<ManualOverride>,
        per_operation_estimate: Duration,
    ) -> Self {
        Self {
            monitor,
            queue,
            retry,
            manual,
            bus: InMemoryEventBus::new(),
            last_published: Mutex::new(None),
            per_operation_estimate,
        }
    }

    /// The effective connection: synthetic offline while manual offline mode
    /// is on, the monitor's view otherwise.
    pub fn connection(&self) -> ConnectionStatus {
        if self.manual.is_enabled() {
            ConnectionStatus::offline()
        } else {
            self.monitor.status()
        }
    }

    /// Recompute the snapshot from its inputs.
    pub fn status(&self) -> OfflineStatus {
        let connection = self.connection();
        let operations = self.queue.all();

        let mut priority = PriorityCounts::default();
        let mut retry_attempts = 0u32;
        let mut retryable = 0usize;
        for op in &operations {
            priority.add(op.priority);
            retry_attempts = retry_attempts.saturating_add(op.attempts);
            if op.is_retryable() {
                retryable += 1;
            }
        }

        OfflineStatus {
            connection,
            queued_operations: QueuedOperations {
                count: operations.len(),
                priority,
            },
            sync_in_progress: self.retry.sync_in_progress(),
            last_sync: self.retry.last_sync(),
            estimated_sync_time: estimate_sync_time(
                retryable,
                self.retry.max_concurrent(),
                self.per_operation_estimate,
                &connection,
            ),
            retry_attempts,
            manual_offline: self.manual.is_enabled(),
        }
    }

    pub fn subscribe(&self) -> Subscription<OfflineStatus> {
        self.bus.subscribe()
    }

    /// Run `callback` on every published snapshot in its own task.
    pub fn subscribe_with<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(OfflineStatus) + Send + 'static,
    {
        spawn_listener("offline_status", self.bus.subscribe(), callback)
    }

    /// Publish the current snapshot if it differs from the last one
    /// published, or unconditionally when `force` is set.
    pub fn publish_if_changed(&self, force: bool) -> bool {
        let status = self.status();
        let mut last = self.last_published.lock().unwrap_or_else(PoisonError::into_inner);
        if !force && last.as_ref() == Some(&status) {
            return false;
        }

        debug!(
            queued = status.queued_operations.count,
            sync_in_progress = status.sync_in_progress,
            connected = status.connection.is_connected,
            forced = force,
            "publishing offline status"
        );
        *last = Some(status.clone());
        if let Err(e) = self.bus.publish(status) {
            warn!(error = ?e, "failed to publish offline status");
        }
        true
    }
}

impl core::fmt::Debug for StatusAggregator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusAggregator")
            .field("subscribers", &self.bus.subscriber_count())
            .field("per_operation_estimate", &self.per_operation_estimate)
            .finish()
    }
}
