//! Public façade: [`OfflineCoordinator`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use tether_core::{
    Clock, ConnectionStatus, FailedOperation, OfflineStatus, OperationId, OperationType, Priority, ReplayError,
    RetryResult, RetryStats, SystemClock,
};
use tether_events::{EventBus, InMemoryEventBus, QueueEvent, QueueEventHandlers, Subscription, SubscriptionHandle};

use crate::config::CoordinatorConfig;
use crate::connectivity::{ConnectivityMonitor, HealthProbe, Reachability, StaticReachability};
use crate::manual::ManualOverride;
use crate::queue::{OperationQueue, ReplayOperation};
use crate::retry::{RetryCoordinator, SyncTrigger};
use crate::status::{ChangeSignal, StatusAggregator};
use crate::worker::{self, CoordinatorHandle};

/// Builder for [`OfflineCoordinator`].
pub struct OfflineCoordinatorBuilder {
    config: CoordinatorConfig,
    reachability: Option<Arc<dyn Reachability>>,
    probe: Option<Arc<dyn HealthProbe>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OfflineCoordinatorBuilder {
    /// Platform reachability source. Defaults to "always online".
    pub fn reachability(mut self, reachability: Arc<dyn Reachability>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// Backend health probe. Without one, reachability alone decides.
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> OfflineCoordinator {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let reachability = self
            .reachability
            .unwrap_or_else(|| Arc::new(StaticReachability::online()));

        let signal = Arc::new(ChangeSignal::new());
        let events = Arc::new(InMemoryEventBus::new());
        let monitor = Arc::new(ConnectivityMonitor::new(
            reachability,
            self.probe,
            config.connectivity.clone(),
        ));
        let queue = Arc::new(OperationQueue::new(events.clone(), signal.clone()));
        let retry = Arc::new(RetryCoordinator::new(
            queue.clone(),
            clock.clone(),
            config.retry.clone(),
            config.max_concurrent,
            config.operation_timeout,
            events.clone(),
            signal.clone(),
        ));
        let manual = Arc::new(ManualOverride::new(signal.clone()));
        let status = Arc::new(StatusAggregator::new(
            monitor.clone(),
            queue.clone(),
            retry.clone(),
            manual.clone(),
            config.per_operation_estimate,
        ));

        OfflineCoordinator {
            inner: Arc::new(Inner {
                config,
                clock,
                monitor,
                queue,
                retry,
                manual,
                status,
                events,
                signal,
                auto_sync_running: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<OperationQueue>,
    retry: Arc<RetryCoordinator>,
    manual: Arc<ManualOverride>,
    status: Arc<StatusAggregator>,
    events: Arc<InMemoryEventBus<QueueEvent>>,
    signal: Arc<ChangeSignal>,
    auto_sync_running: AtomicBool,
}

/// Coordinates failed-operation capture, connectivity and retries.
///
/// Cheap to clone; every clone shares the same state.
///
/// ```ignore
/// let coordinator = OfflineCoordinator::builder(CoordinatorConfig::from_env()?).build();
/// let handle = coordinator.start();
///
/// let replay = replay_fn("update_job:42", move || api.update_job(42));
/// coordinator.report_failure(OperationType::Mutation, "job", replay, &err, Priority::Critical);
///
/// handle.shutdown().await;
/// ```
#[derive(Clone)]
pub struct OfflineCoordinator {
    inner: Arc<Inner>,
}

impl OfflineCoordinator {
    pub fn builder(config: CoordinatorConfig) -> OfflineCoordinatorBuilder {
        OfflineCoordinatorBuilder {
            config,
            reachability: None,
            probe: None,
            clock: None,
        }
    }

    /// Coordinator with default configuration, always-online reachability
    /// and no probe.
    pub fn new() -> Self {
        Self::builder(CoordinatorConfig::default()).build()
    }

    /// Spawn the background tasks. Must be called within a tokio runtime.
    pub fn start(&self) -> CoordinatorHandle {
        worker::spawn(self.clone())
    }

    // --- capture -----------------------------------------------------------

    /// Queue a failed operation for later replay.
    ///
    /// A report matching an already queued `(type, entity, key)` is merged
    /// into it; the existing id is returned.
    pub fn report_failure(
        &self,
        op_type: OperationType,
        entity: impl Into<String>,
        operation: Arc<dyn ReplayOperation>,
        error: &ReplayError,
        priority: Priority,
    ) -> OperationId {
        let record = FailedOperation::new(
            op_type,
            entity,
            operation.key(),
            error,
            priority,
            self.inner.config.retry.max_attempts,
            self.inner.clock.now(),
        );
        let outcome = self.inner.queue.enqueue(record, operation);
        let op = outcome.operation();
        info!(
            operation_id = %op.id,
            op_type = op.op_type.as_str(),
            entity = %op.entity,
            priority = ?op.priority,
            class = ?op.failure,
            "operation failed, queued for retry"
        );
        op.id
    }

    // --- queue queries -----------------------------------------------------

    /// All queued operations in retry order.
    pub fn failed_operations(&self) -> Vec<FailedOperation> {
        self.inner.queue.all()
    }

    pub fn failed_operations_by_type(&self, op_type: OperationType) -> Vec<FailedOperation> {
        self.inner.queue.by_type(op_type)
    }

    pub fn failed_operations_by_entity(&self, entity: &str) -> Vec<FailedOperation> {
        self.inner.queue.by_entity(entity)
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.inner.queue.stats()
    }

    // --- retries -----------------------------------------------------------

    /// Retry a single operation now. Runs regardless of connectivity and
    /// manual offline mode.
    pub async fn retry_operation(&self, id: OperationId) -> RetryResult {
        self.inner.retry.retry_one(id).await
    }

    /// Retry every retryable operation now, ignoring backoff. Runs regardless
    /// of connectivity and manual offline mode.
    pub async fn retry_all_operations(&self) -> Vec<RetryResult> {
        self.inner.retry.retry_all(SyncTrigger::Manual).await
    }

    /// Sync if the backend is really reachable (manual offline mode is
    /// ignored), then publish the resulting status. Offline, the unchanged
    /// status is republished.
    ///
    /// "Reachable" is the probed `is_connected`, not the raw interface
    /// `is_online`: a network link without a route to the backend (captive
    /// portal, failing health check) does not count.
    pub async fn force_sync(&self) -> Vec<RetryResult> {
        if !self.inner.monitor.status().is_connected {
            warn!("force sync requested while offline, skipping");
            self.inner.status.publish_if_changed(true);
            return Vec::new();
        }

        let results = self.inner.retry.retry_all(SyncTrigger::Manual).await;
        self.inner.status.publish_if_changed(true);
        results
    }

    /// Stop running syncs from starting further retries.
    pub fn cancel_sync(&self) {
        self.inner.retry.cancel();
    }

    /// Automatic sync of due operations. Skipped in manual offline mode,
    /// when not connected, or when another automatic sync is running.
    pub(crate) async fn auto_sync(&self) {
        let inner = &self.inner;
        if !inner.config.auto_sync {
            return;
        }
        if inner.manual.is_enabled() {
            debug!("automatic sync suppressed: manual offline mode");
            return;
        }
        if !inner.monitor.status().is_connected {
            debug!("automatic sync skipped: not connected");
            return;
        }
        if inner.auto_sync_running.swap(true, Ordering::SeqCst) {
            debug!("automatic sync already running");
            return;
        }

        inner.retry.retry_all(SyncTrigger::Automatic).await;
        inner.auto_sync_running.store(false, Ordering::SeqCst);
    }

    // --- clearing ----------------------------------------------------------

    /// Remove every queued operation. Returns how many were removed.
    pub fn clear_all_failed_operations(&self) -> usize {
        let removed = self.inner.queue.clear_all().len();
        info!(removed, "cleared all failed operations");
        removed
    }

    /// Remove exhausted operations. Returns how many were removed.
    pub fn clear_resolved_operations(&self) -> usize {
        let removed = self.inner.queue.clear_resolved().len();
        info!(removed, "cleared exhausted operations");
        removed
    }

    /// Remove one operation. Returns `false` if it was not queued.
    pub fn clear_operation(&self, id: OperationId) -> bool {
        let removed = self.inner.queue.remove(id);
        if removed {
            info!(operation_id = %id, "cleared failed operation");
        }
        removed
    }

    // --- events and status -------------------------------------------------

    /// Queue change events. Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> Subscription<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Route queue events to per-event callbacks.
    pub fn subscribe_with(&self, handlers: QueueEventHandlers) -> SubscriptionHandle {
        handlers.spawn(self.inner.events.subscribe())
    }

    /// Current aggregate status, recomputed now.
    pub fn offline_status(&self) -> OfflineStatus {
        self.inner.status.status()
    }

    /// Published status snapshots (coalesced, change-only).
    pub fn subscribe_status(&self) -> Subscription<OfflineStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_status_with<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(OfflineStatus) + Send + 'static,
    {
        self.inner.status.subscribe_with(callback)
    }

    // --- connectivity ------------------------------------------------------

    /// Effective connection (synthetic offline in manual offline mode).
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.status.connection()
    }

    /// Take a connectivity sample now instead of waiting for the probe loop.
    pub async fn refresh_connectivity(&self) -> ConnectionStatus {
        self.inner.monitor.refresh().await;
        self.connection_status()
    }

    pub fn enable_manual_offline_mode(&self) {
        self.inner.manual.enable();
    }

    pub fn disable_manual_offline_mode(&self) {
        self.inner.manual.disable();
    }

    pub fn is_manual_offline_mode(&self) -> bool {
        self.inner.manual.is_enabled()
    }

    // --- internals for background tasks ------------------------------------

    pub(crate) fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub(crate) fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.inner.monitor
    }

    pub(crate) fn signal(&self) -> &Arc<ChangeSignal> {
        &self.inner.signal
    }

    pub(crate) fn aggregator(&self) -> &Arc<StatusAggregator> {
        &self.inner.status
    }
}

impl Default for OfflineCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OfflineCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OfflineCoordinator")
            .field("queued", &self.inner.queue.len())
            .field("connection", &self.connection_status())
            .field("manual_offline", &self.is_manual_offline_mode())
            .field("sync_in_progress", &self.inner.retry.sync_in_progress())
            .finish()
    }
}
