//! Cache and client traits
//!
//! The controller only ever talks to the cluster through these two traits.
//! The concrete implementations wrap reflector stores and `kube::Api`; tests
//! swap in [`MockCluster`](crate::mock::MockCluster).

use crate::error::ClusterError;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use std::sync::Arc;

/// Read-only view of the watched resources.
///
/// Lookups never block on the watch stream: they answer from whatever the
/// local mirror holds right now. `Ok(None)` means not found.
#[async_trait::async_trait]
pub trait ResourceCache: Send + Sync {
    /// Look up a Service by namespace and name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, ClusterError>;

    /// Look up an Ingress by namespace and name
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Arc<Ingress>>, ClusterError>;
}

/// Mutations against the backing store.
///
/// Implementations must report a create of an existing object as
/// [`ClusterError::AlreadyExists`] and a delete of a missing one as
/// [`ClusterError::NotFound`].
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create an Ingress in `namespace`
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), ClusterError>;

    /// Delete the Ingress `namespace/name`
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
