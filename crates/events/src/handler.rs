//! Callback-style consumers on top of [`Subscription`]s.
//!
//! Each listener runs in its own tokio task, so a slow or panicking callback
//! only affects its own delivery.

use tokio::task::JoinHandle;
use tracing::debug;

use tether_core::{FailedOperation, OperationId, RetryResult, RetryStats};

use crate::bus::Subscription;
use crate::event::{QueueEvent, Resolution};

type Handler<A> = Box<dyn Fn(A) + Send + Sync>;

/// Keeps a callback listener alive. Dropping it (or calling
/// [`SubscriptionHandle::unsubscribe`]) stops delivery.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn unsubscribe(self) {
        drop(self);
    }

    /// `false` once the listener stopped (unsubscribed, bus gone, or a
    /// callback panicked).
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a task that feeds every message of `subscription` to `handler`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_listener<M, F>(name: &'static str, mut subscription: Subscription<M>, mut handler: F) -> SubscriptionHandle
where
    M: Send + 'static,
    F: FnMut(M) + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            handler(message);
        }
        debug!(listener = name, "listener stopped: bus closed");
    });

    SubscriptionHandle { task }
}

/// Per-event callbacks for queue changes. Unset callbacks are skipped.
#[derive(Default)]
pub struct QueueEventHandlers {
    on_failed_operation_added: Option<Handler<FailedOperation>>,
    on_failed_operation_retried: Option<Handler<RetryResult>>,
    on_failed_operation_resolved: Option<Handler<(OperationId, Resolution)>>,
    on_retry_stats_changed: Option<Handler<RetryStats>>,
}

impl QueueEventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_failed_operation_added(mut self, f: impl Fn(FailedOperation) + Send + Sync + 'static) -> Self {
        self.on_failed_operation_added = Some(Box::new(f));
        self
    }

    pub fn on_failed_operation_retried(mut self, f: impl Fn(RetryResult) + Send + Sync + 'static) -> Self {
        self.on_failed_operation_retried = Some(Box::new(f));
        self
    }

    pub fn on_failed_operation_resolved(
        mut self,
        f: impl Fn((OperationId, Resolution)) + Send + Sync + 'static,
    ) -> Self {
        self.on_failed_operation_resolved = Some(Box::new(f));
        self
    }

    pub fn on_retry_stats_changed(mut self, f: impl Fn(RetryStats) + Send + Sync + 'static) -> Self {
        self.on_retry_stats_changed = Some(Box::new(f));
        self
    }

    /// Route one event to the matching callback.
    pub fn dispatch(&self, event: QueueEvent) {
        match event {
            QueueEvent::FailedOperationAdded { operation, .. } => {
                if let Some(f) = &self.on_failed_operation_added {
                    f(operation);
                }
            }
            QueueEvent::FailedOperationRetried { result } => {
                if let Some(f) = &self.on_failed_operation_retried {
                    f(result);
                }
            }
            QueueEvent::FailedOperationResolved { operation_id, resolution } => {
                if let Some(f) = &self.on_failed_operation_resolved {
                    f((operation_id, resolution));
                }
            }
            QueueEvent::RetryStatsChanged { stats } => {
                if let Some(f) = &self.on_retry_stats_changed {
                    f(stats);
                }
            }
        }
    }

    /// Spawn a listener that dispatches `subscription` to these callbacks.
    pub fn spawn(self, subscription: Subscription<QueueEvent>) -> SubscriptionHandle {
        spawn_listener("queue-event-handlers", subscription, move |event| self.dispatch(event))
    }
}

impl core::fmt::Debug for QueueEventHandlers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueEventHandlers")
            .field("on_failed_operation_added", &self.on_failed_operation_added.is_some())
            .field("on_failed_operation_retried", &self.on_failed_operation_retried.is_some())
            .field("on_failed_operation_resolved", &self.on_failed_operation_resolved.is_some())
            .field("on_retry_stats_changed", &self.on_retry_stats_changed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::{EventBus, InMemoryEventBus};

    #[tokio::test]
    async fn dispatches_only_to_registered_callbacks() {
        let bus = InMemoryEventBus::<QueueEvent>::new();
        let stats_seen = Arc::new(AtomicUsize::new(0));
        let resolved_seen = Arc::new(AtomicUsize::new(0));

        let s = stats_seen.clone();
        let r = resolved_seen.clone();
        let handle = QueueEventHandlers::new()
            .on_retry_stats_changed(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_failed_operation_resolved(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(bus.subscribe());

        bus.publish(QueueEvent::RetryStatsChanged { stats: RetryStats::default() }).unwrap();
        bus.publish(QueueEvent::FailedOperationRetried {
            result: RetryResult::failed(OperationId::new(), "x"),
        })
        .unwrap();
        bus.publish(QueueEvent::FailedOperationResolved {
            operation_id: OperationId::new(),
            resolution: Resolution::Cleared,
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats_seen.load(Ordering::SeqCst), 1);
        assert_eq!(resolved_seen.load(Ordering::SeqCst), 1);
        assert!(handle.is_active());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let handle = spawn_listener("test", bus.subscribe(), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.publish(2).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
