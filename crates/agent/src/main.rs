//! Standalone coordinator process: probes the configured health endpoint and
//! logs every offline-status change until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tether_sync::{CoordinatorConfig, HttpProbe, OfflineCoordinator};

const DEFAULT_HEALTH_URL: &str = "http://localhost:8080/health";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tether_observability::init();

    let config = CoordinatorConfig::from_env().context("invalid TETHER_* configuration")?;
    let health_url = config.health_url.clone().unwrap_or_else(|| {
        tracing::warn!("TETHER_HEALTH_URL not set; probing {DEFAULT_HEALTH_URL}");
        DEFAULT_HEALTH_URL.to_string()
    });

    let probe = HttpProbe::new(&health_url, config.connectivity.probe_timeout)
        .with_context(|| format!("failed to build health probe for {health_url}"))?;

    let coordinator = OfflineCoordinator::builder(config).probe(Arc::new(probe)).build();
    let handle = coordinator.start();

    let _status_log = coordinator.subscribe_status_with(|status| match serde_json::to_string(&status) {
        Ok(json) => tracing::info!(status = %json, "offline status changed"),
        Err(e) => tracing::warn!(error = %e, "failed to encode offline status"),
    });

    tracing::info!(health_url = %health_url, "tether agent running");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
