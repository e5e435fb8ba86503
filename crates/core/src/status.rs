//! Connectivity and aggregate offline status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::PriorityCounts;

/// Discrete link quality, classified from probe outcome and latency.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Offline,
}

/// Physical connection type reported by the platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    Other,
    None,
    Unknown,
}

/// Connectivity as seen by the monitor.
///
/// `is_online` is raw reachability; `is_connected` additionally requires the
/// last health probe to have succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub is_online: bool,
    pub is_connected: bool,
    pub connection_quality: ConnectionQuality,
    pub connection_type: ConnectionType,
    pub is_expensive: bool,
}

impl ConnectionStatus {
    /// Status before anything has been observed.
    pub fn unknown() -> Self {
        Self {
            is_online: false,
            is_connected: false,
            connection_quality: ConnectionQuality::Offline,
            connection_type: ConnectionType::Unknown,
            is_expensive: false,
        }
    }

    /// Synthetic offline status (manual offline mode).
    pub fn offline() -> Self {
        Self {
            is_online: false,
            is_connected: false,
            connection_quality: ConnectionQuality::Offline,
            connection_type: ConnectionType::None,
            is_expensive: false,
        }
    }
}

/// Queue summary embedded in [`OfflineStatus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperations {
    pub count: usize,
    pub priority: PriorityCounts,
}

/// The single externally observed snapshot of the coordinator.
///
/// Always recomputed from its inputs; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub connection: ConnectionStatus,
    pub queued_operations: QueuedOperations,
    pub sync_in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    /// Estimated milliseconds to drain the retryable part of the queue.
    pub estimated_sync_time: Option<u64>,
    /// Sum of recorded attempts across queued operations.
    pub retry_attempts: u32,
    pub manual_offline: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_wire_names() {
        let status = OfflineStatus {
            connection: ConnectionStatus::offline(),
            queued_operations: QueuedOperations::default(),
            sync_in_progress: false,
            last_sync: None,
            estimated_sync_time: None,
            retry_attempts: 0,
            manual_offline: true,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connection"]["isOnline"], false);
        assert_eq!(json["connection"]["connectionQuality"], "offline");
        assert_eq!(json["queuedOperations"]["priority"]["critical"], 0);
        assert_eq!(json["syncInProgress"], false);
    }
}
