//! Connectivity monitoring: reachability sampling, health probing and
//! discrete quality classification.
//!
//! The platform reports raw reachability through [`Reachability`]. An
//! optional [`HealthProbe`] checks that the backend is actually usable: a
//! device can be "online" behind a captive portal and still be classified as
//! not connected. The monitor only announces a change after the classified
//! status has been stable for `debounce_samples` consecutive samples.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use tether_core::{ConnectionQuality, ConnectionStatus, ConnectionType};

use crate::config::ConnectivityConfig;

/// Raw network state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub is_online: bool,
    pub connection_type: ConnectionType,
    pub is_expensive: bool,
}

impl NetworkState {
    pub fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_online: true,
            connection_type,
            is_expensive: matches!(connection_type, ConnectionType::Cellular),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            connection_type: ConnectionType::None,
            is_expensive: false,
        }
    }
}

/// Platform reachability primitive.
pub trait Reachability: Send + Sync {
    fn current(&self) -> NetworkState;
}

/// Reachability value pushed by the host application (e.g. from an OS
/// network callback), or fixed in tests.
#[derive(Debug)]
pub struct StaticReachability {
    state: Mutex<NetworkState>,
}

impl StaticReachability {
    pub fn new(state: NetworkState) -> Self {
        Self { state: Mutex::new(state) }
    }

    pub fn online() -> Self {
        Self::new(NetworkState::online(ConnectionType::Unknown))
    }

    pub fn offline() -> Self {
        Self::new(NetworkState::offline())
    }

    pub fn set(&self, state: NetworkState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Reachability for StaticReachability {
    fn current(&self) -> NetworkState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable { latency: Duration },
    Unreachable { reason: String },
}

/// Lightweight check that the backend answers.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Classify one sample.
///
/// - not online: offline, not connected
/// - online, probe failed: online but not connected, quality offline
/// - online, probe ok: quality from latency thresholds
/// - online, no probe configured: connected, quality good
pub fn classify(network: NetworkState, probe: Option<&ProbeOutcome>, config: &ConnectivityConfig) -> ConnectionStatus {
    if !network.is_online {
        return ConnectionStatus {
            is_online: false,
            is_connected: false,
            connection_quality: ConnectionQuality::Offline,
            connection_type: network.connection_type,
            is_expensive: network.is_expensive,
        };
    }

    let (is_connected, connection_quality) = match probe {
        None => (true, ConnectionQuality::Good),
        Some(ProbeOutcome::Unreachable { .. }) => (false, ConnectionQuality::Offline),
        Some(ProbeOutcome::Reachable { latency }) => {
            let quality = if *latency < config.excellent_latency {
                ConnectionQuality::Excellent
            } else if *latency < config.good_latency {
                ConnectionQuality::Good
            } else {
                ConnectionQuality::Poor
            };
            (true, quality)
        }
    };

    ConnectionStatus {
        is_online: true,
        is_connected,
        connection_quality,
        connection_type: network.connection_type,
        is_expensive: network.is_expensive,
    }
}

/// Adopts a new status only after it was seen `required` times in a row.
#[derive(Debug)]
struct Debouncer {
    required: u32,
    seeded: bool,
    candidate: Option<(ConnectionStatus, u32)>,
}

impl Debouncer {
    fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            seeded: false,
            candidate: None,
        }
    }

    /// Returns the status to adopt, if `sample` should replace `current`.
    fn observe(&mut self, current: &ConnectionStatus, sample: ConnectionStatus) -> Option<ConnectionStatus> {
        if !self.seeded {
            self.seeded = true;
            self.candidate = None;
            return (sample != *current).then_some(sample);
        }

        if sample == *current {
            self.candidate = None;
            return None;
        }

        let seen = match &self.candidate {
            Some((candidate, n)) if *candidate == sample => n + 1,
            _ => 1,
        };

        if seen >= self.required {
            self.candidate = None;
            Some(sample)
        } else {
            self.candidate = Some((sample, seen));
            None
        }
    }
}

/// Observes reachability and probe results and exposes the classified,
/// debounced [`ConnectionStatus`].
pub struct ConnectivityMonitor {
    reachability: Arc<dyn Reachability>,
    probe: Option<Arc<dyn HealthProbe>>,
    config: ConnectivityConfig,
    debouncer: Mutex<Debouncer>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectivityMonitor {
    /// Create a monitor.
    ///
    /// Without a probe, the initial status is classified from reachability
    /// alone. With a probe it stays unknown (offline) until the first
    /// [`refresh`](Self::refresh).
    pub fn new(
        reachability: Arc<dyn Reachability>,
        probe: Option<Arc<dyn HealthProbe>>,
        config: ConnectivityConfig,
    ) -> Self {
        let mut debouncer = Debouncer::new(config.debounce_samples);
        let initial = if probe.is_none() {
            debouncer.seeded = true;
            classify(reachability.current(), None, &config)
        } else {
            ConnectionStatus::unknown()
        };
        let (status, _) = watch::channel(initial);

        Self {
            reachability,
            probe,
            config,
            debouncer: Mutex::new(debouncer),
            status,
        }
    }

    /// Current adopted status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Change notifications. The receiver only wakes when the adopted status
    /// actually changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn probe_interval(&self) -> Duration {
        self.config.probe_interval
    }

    /// Take one sample (reachability + probe) and fold it into the status.
    pub async fn refresh(&self) -> ConnectionStatus {
        let network = self.reachability.current();

        let outcome = match (&self.probe, network.is_online) {
            (Some(probe), true) => Some(
                tokio::time::timeout(self.config.probe_timeout, probe.probe())
                    .await
                    .unwrap_or_else(|_| ProbeOutcome::Unreachable {
                        reason: format!("probe timed out after {:?}", self.config.probe_timeout),
                    }),
            ),
            _ => None,
        };

        if let Some(ProbeOutcome::Unreachable { reason }) = &outcome {
            debug!(reason = %reason, "health probe failed");
        }

        let sample = classify(network, outcome.as_ref(), &self.config);
        self.observe(sample)
    }

    fn observe(&self, sample: ConnectionStatus) -> ConnectionStatus {
        let current = self.status();
        let adopted = self
            .debouncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(&current, sample);

        match adopted {
            Some(next) => {
                info!(
                    online = next.is_online,
                    connected = next.is_connected,
                    quality = ?next.connection_quality,
                    connection_type = ?next.connection_type,
                    "connectivity changed"
                );
                self.status.send_replace(next);
                next
            }
            None => current,
        }
    }
}

impl core::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.status())
            .field("has_probe", &self.probe.is_some())
            .field("config", &self.config)
            .finish()
    }
}
