#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tether_sync::{OperationKey, ReplayError, ReplayOperation};

/// Tracks how many replays run at the same time.
#[derive(Debug, Default)]
pub struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replay handle returning scripted outcomes, then `fallback` forever.
#[derive(Debug)]
pub struct ScriptedReplay {
    key: String,
    script: Mutex<VecDeque<Result<(), ReplayError>>>,
    fallback: Result<(), ReplayError>,
    delay: Duration,
    gauge: Option<Arc<Gauge>>,
    calls: AtomicU32,
}

impl ScriptedReplay {
    pub fn succeeding(key: &str) -> Self {
        Self::new(key, Ok(()))
    }

    pub fn failing(key: &str, error: ReplayError) -> Self {
        Self::new(key, Err(error))
    }

    fn new(key: &str, fallback: Result<(), ReplayError>) -> Self {
        Self {
            key: key.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            gauge: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn then(self, outcome: Result<(), ReplayError>) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplayOperation for ScriptedReplay {
    fn key(&self) -> OperationKey {
        OperationKey::new(self.key.clone())
    }

    async fn replay(&self) -> Result<(), ReplayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.leave();
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
