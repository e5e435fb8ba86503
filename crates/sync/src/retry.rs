//! Replay of queued operations.
//!
//! [`RetryCoordinator`] claims operations from the [`OperationQueue`], runs
//! their replay handles outside any lock with a per-operation timeout and
//! folds the outcome back into the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use tether_core::{Clock, OperationId, ReplayError, RetryPolicy, RetryResult};
use tether_events::{EventBus, InMemoryEventBus, QueueEvent};

use crate::queue::{Claim, OperationQueue};
use crate::status::ChangeSignal;

/// What started a sync run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Requested by the application. Backoff deadlines are ignored.
    Manual,
    /// Reconnect or reconcile tick. Only operations whose backoff has elapsed.
    Automatic,
}

pub struct RetryCoordinator {
    queue: Arc<OperationQueue>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    max_concurrent: usize,
    operation_timeout: Duration,
    in_flight: AtomicUsize,
    cancel_epoch: AtomicU64,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    events: Arc<InMemoryEventBus<QueueEvent>>,
    signal: Arc<ChangeSignal>,
}

/// Keeps `sync_in_progress` raised while alive.
struct InFlight<'a>(&'a RetryCoordinator);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.signal.mark_dirty();
    }
}

impl RetryCoordinator {
    pub fn new(
        queue: Arc<OperationQueue>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        max_concurrent: usize,
        operation_timeout: Duration,
        events: Arc<InMemoryEventBus<QueueEvent>>,
        signal: Arc<ChangeSignal>,
    ) -> Self {
        Self {
            queue,
            clock,
            policy,
            max_concurrent: max_concurrent.max(1),
            operation_timeout,
            in_flight: AtomicUsize::new(0),
            cancel_epoch: AtomicU64::new(0),
            last_sync: Mutex::new(None),
            events,
            signal,
        }
    }

    fn begin(&self) -> InFlight<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.signal.mark_dirty();
        InFlight(self)
    }

    /// True while any retry (single or bulk) is running.
    pub fn sync_in_progress(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Completion time of the last run that attempted at least one operation.
    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stop running syncs from starting further retries. In-flight replays
    /// finish or time out.
    pub fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        info!("sync cancelled");
    }

    /// Retry one operation now, ignoring its backoff.
    ///
    /// Unknown ids and operations already being retried produce a failed
    /// result without replaying anything.
    pub async fn retry_one(&self, id: OperationId) -> RetryResult {
        let _guard = self.begin();
        match self.queue.claim(id) {
            Ok(claim) => {
                let result = self.attempt(claim).await;
                self.touch_last_sync();
                result
            }
            Err(e) => {
                debug!(operation_id = %id, error = %e, "retry rejected");
                RetryResult::failed(id, e.to_string())
            }
        }
    }

    /// Retry every retryable operation with a fixed pool of workers.
    ///
    /// Results come back in queue order. Failures never abort the batch;
    /// cancellation stops workers from picking up further operations.
    pub async fn retry_all(&self, trigger: SyncTrigger) -> Vec<RetryResult> {
        let due_at = match trigger {
            SyncTrigger::Manual => None,
            SyncTrigger::Automatic => Some(self.clock.now()),
        };
        let ids: Vec<OperationId> = self.queue.retryable(due_at).into_iter().map(|op| op.id).collect();
        if ids.is_empty() {
            debug!(?trigger, "nothing to sync");
            return Vec::new();
        }

        let _guard = self.begin();
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        let total = ids.len();
        let workers = self.max_concurrent.min(total);
        info!(?trigger, operations = total, workers, "sync started");

        let pending = Mutex::new(ids.into_iter().enumerate().collect::<VecDeque<_>>());
        let finished = Mutex::new(Vec::with_capacity(total));
        join_all((0..workers).map(|_| self.work(&pending, &finished, epoch, due_at))).await;

        let mut finished = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        finished.sort_by_key(|(index, _)| *index);
        let results: Vec<RetryResult> = finished.into_iter().map(|(_, result)| result).collect();

        if !results.is_empty() {
            self.touch_last_sync();
        }
        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            ?trigger,
            attempted = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            cancelled = self.cancel_epoch.load(Ordering::SeqCst) != epoch,
            "sync finished"
        );
        results
    }

    async fn work(
        &self,
        pending: &Mutex<VecDeque<(usize, OperationId)>>,
        finished: &Mutex<Vec<(usize, RetryResult)>>,
        epoch: u64,
        due_at: Option<DateTime<Utc>>,
    ) {
        loop {
            if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let next = pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            let Some((index, id)) = next else {
                return;
            };

            // Re-checked at claim time: the entry may have been cleared,
            // picked up elsewhere or stopped being retryable since the snapshot.
            match self.queue.claim_retryable(id, due_at) {
                Ok(claim) => {
                    let result = self.attempt(claim).await;
                    finished.lock().unwrap_or_else(PoisonError::into_inner).push((index, result));
                }
                Err(e) => debug!(operation_id = %id, error = %e, "skipped"),
            }
        }
    }

    async fn attempt(&self, claim: Claim) -> RetryResult {
        let id = claim.operation.id;
        let (previous, max_attempts) = (claim.operation.attempts, claim.operation.max_attempts);
        let replay = claim.replay;

        let mut handle = tokio::spawn(async move { replay.replay().await });
        let outcome = match tokio::time::timeout(self.operation_timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(ReplayError::transient(format!("replay panicked: {join}"))),
            Err(_) => {
                handle.abort();
                Err(ReplayError::transient(format!(
                    "replay timed out after {:?}",
                    self.operation_timeout
                )))
            }
        };

        let result = match outcome {
            Ok(()) => {
                self.queue.complete_success(id);
                debug!(operation_id = %id, "replay succeeded");
                RetryResult::succeeded(id, (previous + 1).min(max_attempts))
            }
            Err(error) => {
                let now = self.clock.now();
                let updated = self.queue.complete_failure(id, &error, now, &self.policy);
                let (attempts, exhausted) = updated
                    .as_ref()
                    .map_or((previous, false), |op| (op.attempts, op.is_exhausted()));
                if exhausted {
                    warn!(operation_id = %id, attempts, error = %error, "operation exhausted its attempts");
                } else {
                    warn!(operation_id = %id, attempts, class = ?error.class(), error = %error, "replay failed");
                }
                RetryResult::failed(id, error.message()).with_attempts(attempts, exhausted)
            }
        };

        if let Err(e) = self.events.publish(QueueEvent::FailedOperationRetried { result: result.clone() }) {
            warn!(error = ?e, "failed to publish retry event");
        }
        result
    }

    fn touch_last_sync(&self) {
        *self.last_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
    }
}

impl core::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("max_concurrent", &self.max_concurrent)
            .field("operation_timeout", &self.operation_timeout)
            .field("sync_in_progress", &self.sync_in_progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use tether_core::{FailedOperation, ManualClock, OperationKey, OperationType, Priority};

    use super::*;
    use crate::queue::{ReplayOperation, replay_fn};

    struct Fixture {
        queue: Arc<OperationQueue>,
        clock: Arc<ManualClock>,
        retry: RetryCoordinator,
    }

    fn fixture(max_concurrent: usize, timeout: Duration) -> Fixture {
        let events = Arc::new(InMemoryEventBus::new());
        let signal = Arc::new(ChangeSignal::new());
        let queue = Arc::new(OperationQueue::new(events.clone(), signal.clone()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let retry = RetryCoordinator::new(
            queue.clone(),
            clock.clone(),
            RetryPolicy::default(),
            max_concurrent,
            timeout,
            events,
            signal,
        );
        Fixture { queue, clock, retry }
    }

    fn report(f: &Fixture, key: &str, priority: Priority, replay: Arc<dyn ReplayOperation>) -> OperationId {
        let record = FailedOperation::new(
            OperationType::Mutation,
            "job",
            OperationKey::new(key),
            &ReplayError::transient("503"),
            priority,
            3,
            f.clock.now(),
        );
        f.queue.enqueue(record, replay).id()
    }

    fn counting(key: &str, calls: Arc<AtomicU32>, result: Result<(), ReplayError>) -> Arc<dyn ReplayOperation> {
        replay_fn(key.to_string(), move || {
            let calls = calls.clone();
            let result = result.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                result
            }
        })
    }

    #[tokio::test]
    async fn successful_retry_removes_operation() {
        let f = fixture(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let id = report(&f, "a", Priority::Normal, counting("a", calls.clone(), Ok(())));

        let result = f.retry.retry_one(id).await;

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(f.queue.is_empty());
        assert!(f.retry.last_sync().is_some());
        assert!(!f.retry.sync_in_progress());
    }

    #[tokio::test]
    async fn unknown_id_yields_failed_result() {
        let f = fixture(3, Duration::from_secs(5));
        let id = OperationId::new();
        let result = f.retry.retry_one(id).await;
        assert!(!result.success);
        assert_eq!(result.operation_id, id);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn failures_exhaust_at_max_attempts() {
        let f = fixture(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let id = report(&f, "a", Priority::Normal, counting("a", calls, Err(ReplayError::transient("503"))));

        let first = f.retry.retry_one(id).await;
        let second = f.retry.retry_one(id).await;
        let third = f.retry.retry_one(id).await;

        assert_eq!((first.attempts, first.exhausted), (1, false));
        assert_eq!((second.attempts, second.exhausted), (2, false));
        assert_eq!((third.attempts, third.exhausted), (3, true));
        assert!(f.queue.retryable(None).is_empty());
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn retry_all_returns_results_in_queue_order() {
        let f = fixture(1, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let sec = chrono::Duration::seconds(1);

        let low = report(&f, "low", Priority::Low, counting("low", calls.clone(), Ok(())));
        f.clock.advance(sec);
        let c1 = report(&f, "c1", Priority::Critical, counting("c1", calls.clone(), Ok(())));
        f.clock.advance(sec);
        let normal = report(&f, "n", Priority::Normal, counting("n", calls.clone(), Ok(())));
        f.clock.advance(sec);
        let c2 = report(&f, "c2", Priority::Critical, counting("c2", calls.clone(), Ok(())));

        let order: Vec<OperationId> = f
            .retry
            .retry_all(SyncTrigger::Manual)
            .await
            .into_iter()
            .map(|r| r.operation_id)
            .collect();

        assert_eq!(order, vec![c1, c2, normal, low]);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn automatic_sync_respects_backoff() {
        let f = fixture(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let id = report(&f, "a", Priority::Normal, counting("a", calls.clone(), Err(ReplayError::transient("503"))));

        f.retry.retry_one(id).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(f.retry.retry_all(SyncTrigger::Automatic).await.is_empty());
        assert_eq!(f.retry.retry_all(SyncTrigger::Manual).await.len(), 1);

        f.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(f.retry.retry_all(SyncTrigger::Automatic).await.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_replay_times_out_as_transient() {
        let f = fixture(1, Duration::from_millis(20));
        let id = report(
            &f,
            "slow",
            Priority::Normal,
            replay_fn("slow", || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        );

        let result = f.retry.retry_one(id).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(f.queue.get(id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn panicking_replay_becomes_a_failed_result() {
        let f = fixture(1, Duration::from_secs(5));
        let id = report(
            &f,
            "boom",
            Priority::Normal,
            replay_fn("boom", || async {
                let missing: Option<()> = None;
                missing.expect("replay exploded");
                Ok(())
            }),
        );

        let result = f.retry.retry_one(id).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("panicked"));
        assert!(f.queue.get(id).is_some());
    }

    #[tokio::test]
    async fn bulk_retry_skips_operations_that_turned_permanent_mid_run() {
        let f = Arc::new(fixture(1, Duration::from_secs(5)));
        let slow = report(
            &f,
            "slow",
            Priority::Critical,
            replay_fn("slow", || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }),
        );
        let later_calls = Arc::new(AtomicU32::new(0));
        let later = report(&f, "later", Priority::Low, counting("later", later_calls.clone(), Ok(())));

        let run = {
            let f = f.clone();
            tokio::spawn(async move { f.retry.retry_all(SyncTrigger::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let permanent = FailedOperation::new(
            OperationType::Mutation,
            "job",
            OperationKey::new("later"),
            &ReplayError::permanent("422"),
            Priority::Low,
            3,
            f.clock.now(),
        );
        f.queue.enqueue(permanent, counting("later", later_calls.clone(), Ok(())));
        assert!(!f.queue.get(later).unwrap().is_retryable());

        let results = run.await.unwrap();
        assert_eq!(results.iter().map(|r| r.operation_id).collect::<Vec<_>>(), vec![slow]);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(f.queue.get(later).is_some());
    }

    #[tokio::test]
    async fn cancellation_stops_new_retries() {
        let f = Arc::new(fixture(1, Duration::from_secs(5)));
        let calls = Arc::new(AtomicU32::new(0));
        for key in ["a", "b", "c", "d"] {
            let calls = calls.clone();
            report(
                &f,
                key,
                Priority::Normal,
                replay_fn(key, move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    }
                }),
            );
        }

        let run = {
            let f = f.clone();
            tokio::spawn(async move { f.retry.retry_all(SyncTrigger::Manual).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.retry.cancel();

        let results = run.await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.queue.len(), 3);
    }
}
