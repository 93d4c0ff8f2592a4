//! Metrics and probe endpoints.
//!
//! - `/metrics`: Prometheus text exposition of the controller registry
//! - `/healthz`: 200 while the process is serving
//! - `/readyz`: 200 once the caches have synced, 503 before

use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
pub struct State {
    metrics: Metrics,
    /// Cancelled once the caches have synced
    ready: CancellationToken,
}

impl State {
    /// Creates handler state; the server reports ready once `ready` is cancelled.
    pub fn new(metrics: Metrics, ready: CancellationToken) -> Self {
        Self { metrics, ready }
    }

    /// Current readiness
    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

/// Serve the endpoints on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Routes for the probe and metrics endpoints
pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics(AxumState(state): AxumState<Arc<State>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "Ok"
}

async fn readyz(AxumState(state): AxumState<Arc<State>>) -> Readiness {
    state.ready()
}

/// Answer of `/readyz`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Caches synced; 200
    Ready,
    /// Still syncing; 503
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "Ok").into_response(),
            Readiness::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "NotReady").into_response(),
        }
    }
}
