//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watchers,
//! work queue, worker pool and probe server together and runs them until
//! shutdown.

use crate::backoff::ExponentialBackoff;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::http;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::router::EventRouter;
use crate::watcher::Watcher;
use crate::worker::WorkerPool;
use cluster_client::{KubeResourceClient, StoreCache};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, Client};
use kube_runtime::reflector;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main controller for Service-driven Ingress management.
pub struct Controller {
    config: ControllerConfig,
    cache: StoreCache,
    workers: WorkerPool<Reconciler>,
    http_state: Arc<http::State>,
    ready: CancellationToken,
    service_watcher: JoinHandle<Result<(), ControllerError>>,
    ingress_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its watchers.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Ingress Manager");

        let kube_client = Client::try_default().await?;

        let (service_api, ingress_api): (Api<Service>, Api<Ingress>) = match config.namespace.as_deref() {
            Some(ns) => (
                Api::namespaced(kube_client.clone(), ns),
                Api::namespaced(kube_client.clone(), ns),
            ),
            None => (Api::all(kube_client.clone()), Api::all(kube_client.clone())),
        };

        let (service_store, service_writer) = reflector::store::<Service>();
        let (ingress_store, ingress_writer) = reflector::store::<Ingress>();
        let cache = StoreCache::new(service_store, ingress_store);

        let metrics = Metrics::new()?;
        let backoff = ExponentialBackoff::new(config.backoff_base, config.backoff_max);
        let queue = WorkQueue::new("ingress-manager", Arc::new(backoff));

        let router = Arc::new(EventRouter::new(queue.clone(), metrics.clone()));
        let watcher = Arc::new(Watcher::new(router));

        // Start watchers in background tasks
        let service_watcher = {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.watch_services(service_api, service_writer).await })
        };
        let ingress_watcher = tokio::spawn(async move {
            watcher.watch_ingresses(ingress_api, ingress_writer).await
        });

        let reconciler = Reconciler::new(
            Arc::new(cache.clone()),
            Arc::new(KubeResourceClient::new(kube_client)),
            config.ingress.clone(),
        );
        let workers = WorkerPool::new(
            queue,
            Arc::new(reconciler),
            config.workers,
            config.max_retries,
            metrics.clone(),
        );

        let ready = CancellationToken::new();
        let http_state = Arc::new(http::State::new(metrics, ready.clone()));

        Ok(Self {
            config,
            cache,
            workers,
            http_state,
            ready,
            service_watcher,
            ingress_watcher,
        })
    }

    /// Runs the controller until a shutdown signal or a watcher failure.
    ///
    /// Workers start only after both caches have synced; a sync timeout is
    /// fatal. On shutdown the queue is drained of waiting keys, in-flight
    /// reconciles finish and the probe server stops.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(http::serve(
            self.config.metrics_addr,
            Arc::clone(&self.http_state),
            shutdown.clone(),
        ));

        info!("Waiting for informer caches to sync");
        let synced = tokio::select! {
            result = self.cache.wait_for_sync(Some(self.config.cache_sync_timeout)) => {
                result.map_err(ControllerError::from)
            }
            result = &mut self.service_watcher => Err(watcher_exit("Service", result)),
            result = &mut self.ingress_watcher => Err(watcher_exit("Ingress", result)),
        };
        if let Err(e) = synced {
            shutdown.cancel();
            self.stop_watchers();
            return Err(e);
        }
        self.ready.cancel();
        info!("Caches synced, Ingress Manager running");

        let workers = tokio::spawn(self.workers.clone().run(shutdown.clone()));

        let outcome = tokio::select! {
            result = &mut self.service_watcher => Err(watcher_exit("Service", result)),
            result = &mut self.ingress_watcher => Err(watcher_exit("Ingress", result)),
            _ = shutdown_signal() => Ok(()),
        };

        info!("Shutting down Ingress Manager");
        shutdown.cancel();
        self.stop_watchers();
        if let Err(e) = workers.await {
            error!("Worker pool task failed: {}", e);
        }
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Metrics server exited with error: {}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }

        outcome
    }

    fn stop_watchers(&self) {
        self.service_watcher.abort();
        self.ingress_watcher.abort();
    }
}

fn watcher_exit(
    kind: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> ControllerError {
    match result {
        Ok(Ok(())) => ControllerError::Watch(format!("{} watcher exited", kind)),
        Ok(Err(e)) => ControllerError::Watch(format!("{} watcher error: {}", kind, e)),
        Err(e) => ControllerError::Watch(format!("{} watcher panicked: {}", kind, e)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Captured Ctrl+C signal"),
        _ = terminate => info!("Captured SIGTERM signal"),
    }
}
