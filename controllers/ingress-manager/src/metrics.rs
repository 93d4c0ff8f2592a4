//! Controller metrics
//!
//! Each controller instance owns its own registry so several instances (and
//! tests) can coexist in one process.

use crate::error::ControllerError;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus metrics for one controller instance.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// Reconciles by outcome (`created`, `deleted`, `in_sync`, `service_absent`, or an error label)
    pub reconciles: IntCounterVec,
    /// Wall time of each reconcile
    pub reconcile_duration: Histogram,
    /// Keys put back on the queue after a failure
    pub requeues: IntCounter,
    /// Keys abandoned after exhausting retries or failing permanently
    pub dropped: IntCounter,
    /// Watch notifications by event and routing decision
    pub events: IntCounterVec,
    /// Keys waiting for a worker
    pub queue_depth: IntGauge,
}

impl Metrics {
    /// Create and register all metrics in a fresh registry.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new_custom(Some("ingress_manager".to_string()), None)?;

        let reconciles = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconcile attempts by outcome"),
            &["outcome"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Reconcile duration in seconds")
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let requeues = IntCounter::new("requeues_total", "Keys requeued with backoff after a failure")?;
        let dropped = IntCounter::new("dropped_total", "Keys dropped after a permanent failure")?;
        let events = IntCounterVec::new(
            Opts::new("events_total", "Watch notifications by event and routing decision"),
            &["event", "decision"],
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Keys waiting for a worker")?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(requeues.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            reconcile_duration,
            requeues,
            dropped,
            events,
            queue_depth,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}
