//! `tether-sync` — offline resilience and retry coordination.
//!
//! Captures operations that failed for lack of connectivity (or transient
//! backend errors), watches connectivity, and replays the captured work when
//! the backend is reachable again, with bounded concurrency, backoff and
//! change notifications.
//!
//! Entry point: [`OfflineCoordinator`].

pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod manual;
#[cfg(feature = "http")]
pub mod probe;
pub mod queue;
pub mod retry;
pub mod status;
mod worker;

pub use config::{ConfigError, ConnectivityConfig, CoordinatorConfig};
pub use connectivity::{
    ConnectivityMonitor, HealthProbe, NetworkState, ProbeOutcome, Reachability, StaticReachability, classify,
};
pub use coordinator::{OfflineCoordinator, OfflineCoordinatorBuilder};
pub use manual::ManualOverride;
#[cfg(feature = "http")]
pub use probe::{HttpProbe, replay_error};
pub use queue::{Claim, EnqueueOutcome, FnReplay, OperationQueue, QueueError, ReplayOperation, replay_fn};
pub use retry::{RetryCoordinator, SyncTrigger};
pub use status::{ChangeSignal, StatusAggregator, estimate_sync_time};
pub use worker::CoordinatorHandle;

pub use tether_core::{
    ConnectionQuality, ConnectionStatus, ConnectionType, FailedOperation, FailureClass, OfflineStatus, OperationId,
    OperationKey, OperationType, Priority, ReplayError, RetryPolicy, RetryResult, RetryStats,
};
pub use tether_events::{QueueEvent, QueueEventHandlers, Resolution, Subscription, SubscriptionHandle};
