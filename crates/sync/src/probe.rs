//! HTTP health probe and error classification (`http` feature).

use std::time::{Duration, Instant};

use async_trait::async_trait;

use tether_core::ReplayError;

use crate::connectivity::{HealthProbe, ProbeOutcome};

/// Probes a health endpoint with a `GET`; any 2xx counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Reachable {
                latency: started.elapsed(),
            },
            Ok(resp) => ProbeOutcome::Unreachable {
                reason: format!("health check returned {}", resp.status()),
            },
            Err(e) => ProbeOutcome::Unreachable { reason: e.to_string() },
        }
    }
}

/// Classify a `reqwest` failure for [`report_failure`](crate::OfflineCoordinator::report_failure).
///
/// Connection failures are connectivity errors, timeouts are transient and
/// HTTP statuses go through [`ReplayError::from_status`].
pub fn replay_error(err: &reqwest::Error) -> ReplayError {
    if err.is_connect() {
        return ReplayError::connectivity(err.to_string());
    }
    if err.is_timeout() {
        return ReplayError::transient(err.to_string());
    }
    match err.status() {
        Some(status) => ReplayError::from_status(status.as_u16(), err.to_string()),
        None => ReplayError::transient(err.to_string()),
    }
}
