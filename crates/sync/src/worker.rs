//! Background tasks driving the coordinator.
//!
//! - probe loop: samples connectivity every `probe_interval`
//! - publisher: coalesces change signals into status publications
//! - connectivity watcher: auto-sync on reconnect, cancel on disconnect
//! - reconciler: periodic status re-derivation and auto-sync of due operations

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::coordinator::OfflineCoordinator;

/// Running background tasks. Dropping the handle signals them to stop;
/// [`shutdown`](Self::shutdown) also waits for them.
#[derive(Debug)]
pub struct CoordinatorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Stop every background task and wait for them to exit.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "background task failed");
                }
            }
        }
        tracing::info!("offline coordinator stopped");
    }

    /// `true` while every background task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|t| !t.is_finished())
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub(crate) fn spawn(coordinator: OfflineCoordinator) -> CoordinatorHandle {
    let (shutdown, _) = watch::channel(false);

    let tasks = vec![
        tokio::spawn(probe_loop(coordinator.clone(), shutdown.subscribe())),
        tokio::spawn(publisher(coordinator.clone(), shutdown.subscribe())),
        tokio::spawn(connectivity_watcher(coordinator.clone(), shutdown.subscribe())),
        tokio::spawn(reconciler(coordinator, shutdown.subscribe())),
    ];
    tracing::info!("offline coordinator started");

    CoordinatorHandle { shutdown, tasks }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn probe_loop(coordinator: OfflineCoordinator, mut shutdown: watch::Receiver<bool>) {
    let monitor = coordinator.monitor();
    let mut interval = ticker(monitor.probe_interval());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                monitor.refresh().await;
            }
        }
    }
    tracing::debug!("probe loop stopped");
}

async fn publisher(coordinator: OfflineCoordinator, mut shutdown: watch::Receiver<bool>) {
    let signal = coordinator.signal();
    let status = coordinator.aggregator();
    let window = coordinator.config().coalesce_window;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = signal.notified() => {}
        }
        // Let the rest of the burst land before recomputing.
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(window) => {}
        }
        status.publish_if_changed(signal.take_forced());
    }
    tracing::debug!("status publisher stopped");
}

async fn connectivity_watcher(coordinator: OfflineCoordinator, mut shutdown: watch::Receiver<bool>) {
    let mut changes = coordinator.monitor().subscribe();
    let mut was_connected = changes.borrow_and_update().is_connected;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let connected = changes.borrow_and_update().is_connected;
        coordinator.signal().mark_dirty();

        match (was_connected, connected) {
            (true, false) => {
                tracing::info!("connection lost, cancelling running syncs");
                coordinator.cancel_sync();
            }
            (false, true) => {
                tracing::info!("connection restored, starting automatic sync");
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.auto_sync().await });
            }
            _ => {}
        }
        was_connected = connected;
    }
    tracing::debug!("connectivity watcher stopped");
}

async fn reconciler(coordinator: OfflineCoordinator, mut shutdown: watch::Receiver<bool>) {
    let mut interval = ticker(coordinator.config().reconcile_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                coordinator.signal().mark_dirty();
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.auto_sync().await });
            }
        }
    }
    tracing::debug!("reconciler stopped");
}
