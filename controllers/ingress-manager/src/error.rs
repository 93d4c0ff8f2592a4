//! Controller-specific error types.
//!
//! This module defines error types specific to the Ingress Manager
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Ingress Manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cache lookup or Ingress mutation failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client construction or API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Work item could not be split into namespace and name
    #[error("Malformed key: {0:?}")]
    MalformedKey(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Socket or server I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reconcile panicked
    #[error("Reconcile panicked: {0}")]
    Panicked(String),
}

impl ControllerError {
    /// Whether retrying the same key could succeed.
    ///
    /// Malformed keys and bad configuration stay broken no matter how often
    /// they are replayed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::MalformedKey(_) | Self::InvalidConfig(_))
    }

    /// Short label for the failure metric
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Cluster(_) => "cluster",
            Self::Kube(_) => "kube",
            Self::MalformedKey(_) => "malformed_key",
            Self::Reconciliation(_) => "reconciliation",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Watch(_) => "watch",
            Self::Metrics(_) => "metrics",
            Self::Io(_) => "io",
            Self::Panicked(_) => "panicked",
        }
    }
}
