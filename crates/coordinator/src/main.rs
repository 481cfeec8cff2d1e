//! Triage Coordinator - Main Entry Point
//!
//! Loads configuration, starts GPU monitoring and the queue dispatcher, and
//! runs until interrupted.

use anyhow::Context;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use triage_common::TriageConfig;
use triage_coordinator::ControlPlane;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so the configured level applies
    let config = TriageConfig::from_env().context("failed to load configuration")?;

    // Initialize logging
    let level = &config.observability.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "triage_coordinator={0},triage_queue={0},triage_common={0}",
            level
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(
        models = config.models.len(),
        workers = config.dispatcher.num_workers,
        telemetry = ?config.monitor.source,
        "Starting Triage Coordinator"
    );

    let plane = ControlPlane::build(config).context("failed to build control plane")?;
    plane.start();

    info!("Triage Coordinator running");

    // Wait for shutdown signal
    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    plane.shutdown();
    if let Ok(metrics) = plane.metrics_text() {
        debug!("Final metrics:\n{}", metrics);
    }
    info!(
        "Triage Coordinator shutdown complete: {}",
        serde_json::to_string(&plane.get_stats()).unwrap_or_default()
    );
    Ok(())
}
