//! Cluster access errors

use thiserror::Error;

/// Errors that can occur when reading the cache or mutating the cluster
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API or transport error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Local cache unavailable or not synced
    #[error("Cache error: {0}")]
    Cache(String),

    /// Any other failed request (throttling, conflicts, timeouts)
    #[error("Request failed: {0}")]
    Request(String),
}

impl ClusterError {
    /// Classify a kube error, lifting 404 and 409/AlreadyExists into their own variants.
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound(what.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists(what.to_string())
            }
            _ => Self::Kube(err),
        }
    }

    /// Whether this is a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether this is an already-exists condition
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}
