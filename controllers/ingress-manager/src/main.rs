//! Ingress Manager
//!
//! Keeps an Ingress in step with every Service that carries the trigger
//! annotation (`ingress/http` by default):
//! - annotated Service without an Ingress: create one, owned by the Service
//! - Ingress whose Service lost the annotation: delete it
//!
//! Watch events only enqueue keys; a pool of workers reconciles each key
//! against the informer caches, retrying failures with per-key backoff.

mod backoff;
mod config;
mod controller;
mod error;
mod http;
mod key;
mod metrics;
mod queue;
mod reconciler;
mod router;
mod watcher;
mod worker;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Ingress Manager");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Workers: {}", config.workers);
    info!("  Max retries: {}", config.max_retries);
    info!("  Backoff: {:?} to {:?}", config.backoff_base, config.backoff_max);
    info!("  Trigger annotation: {}", config.ingress.trigger_annotation);
    info!(
        "  Ingress: class {}, host {}, backend port {}",
        config.ingress.ingress_class, config.ingress.host, config.ingress.backend_port
    );
    info!("  Metrics address: {}", config.metrics_addr);

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    info!("Ingress Manager stopped");
    Ok(())
}
