//! `tether-core` — data model of the offline retry coordinator.
//!
//! This crate contains **pure** types (no runtime, no IO): failed operations
//! and their classification, retry policy, derived statistics and status
//! snapshots.

pub mod clock;
pub mod error;
pub mod id;
pub mod operation;
pub mod retry;
pub mod stats;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ParseIdError, ReplayError};
pub use id::OperationId;
pub use operation::{FailedOperation, FailureClass, OperationKey, OperationState, OperationType, Priority};
pub use retry::{BackoffStrategy, RetryPolicy, RetryResult};
pub use stats::{PriorityCounts, RetryStats};
pub use status::{ConnectionQuality, ConnectionStatus, ConnectionType, OfflineStatus, QueuedOperations};
