//! Kubernetes-backed resource client
//!
//! Issues the Ingress create/delete calls through `kube::Api` and folds API
//! status codes into [`ClusterError`].

use crate::cluster_trait::ResourceClient;
use crate::error::ClusterError;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use tracing::debug;

/// Ingress mutations against a live API server.
#[derive(Clone)]
pub struct KubeResourceClient {
    client: Client,
}

impl std::fmt::Debug for KubeResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceClient").finish_non_exhaustive()
    }
}

impl KubeResourceClient {
    /// Create a client from an existing kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeResourceClient {
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), ClusterError> {
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        debug!("POST Ingress {}/{}", namespace, name);
        self.ingresses(namespace)
            .create(&PostParams::default(), ingress)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &format!("Ingress {}/{}", namespace, name)))
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        debug!("DELETE Ingress {}/{}", namespace, name);
        self.ingresses(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &format!("Ingress {}/{}", namespace, name)))
    }
}
