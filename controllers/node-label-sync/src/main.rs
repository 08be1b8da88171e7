//! Node Label Sync Controller
//!
//! Keeps a configured set of label keys synchronized from nodes onto the pods
//! scheduled on them, so pod selectors and affinity rules can depend on node
//! metadata (zone, hardware class, ...) without querying nodes.
//!
//! The controller watches Pods and Nodes cluster-wide. Each kind feeds its own
//! rate-limited work queue, and both queues are drained into one shared
//! labeler that mirrors the cluster state and writes pods whose labels drift.

mod config;
mod controller;
mod error;
mod labeler;
mod metrics;
mod server;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube and rustls both pull in a crypto provider, pick one explicitly
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Node Label Sync Controller");

    let config = Config::from_env()?;

    info!("Configuration:");
    info!("  Labels: {}", config.labels.join(", "));
    info!("  Workers per resource kind: {}", config.workers);
    match config.resync_period {
        Some(period) => info!("  Resync period: {:?}", period),
        None => info!("  Resync period: disabled"),
    }
    info!(
        "  API server: {}",
        config.master_url.as_deref().unwrap_or("from kubeconfig / in-cluster config")
    );
    info!("  Metrics address: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(&config).await?;
    controller.run().await?;

    info!("Node Label Sync Controller stopped");
    Ok(())
}
