//! Manual offline mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::status::ChangeSignal;

/// User-controlled switch that makes the coordinator report offline and
/// suppresses automatic syncs. Explicit retries still run.
#[derive(Debug)]
pub struct ManualOverride {
    enabled: AtomicBool,
    signal: Arc<ChangeSignal>,
}

impl ManualOverride {
    pub fn new(signal: Arc<ChangeSignal>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            signal,
        }
    }

    /// Returns `true` if the mode changed.
    pub fn enable(&self) -> bool {
        self.set(true)
    }

    /// Returns `true` if the mode changed.
    pub fn disable(&self) -> bool {
        self.set(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) -> bool {
        let changed = self.enabled.swap(enabled, Ordering::SeqCst) != enabled;
        if changed {
            info!(enabled, "manual offline mode changed");
            self.signal.mark_dirty();
        }
        changed
    }
}
