//! Reflector-backed resource cache
//!
//! Wraps the kube-runtime [`Store`]s that the controller's watch streams keep
//! current. Reads are lock-free snapshots and never fail.

use crate::cluster_trait::ResourceCache;
use crate::error::ClusterError;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube_runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Local mirror of Services and Ingresses.
#[derive(Clone)]
pub struct StoreCache {
    services: Store<Service>,
    ingresses: Store<Ingress>,
}

impl std::fmt::Debug for StoreCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCache")
            .field("services", &self.services.state().len())
            .field("ingresses", &self.ingresses.state().len())
            .finish()
    }
}

impl StoreCache {
    /// Create a cache over two reflector stores
    pub fn new(services: Store<Service>, ingresses: Store<Ingress>) -> Self {
        Self { services, ingresses }
    }

    /// Wait until both stores have completed their initial list.
    ///
    /// With a timeout, a slow or broken watch surfaces as [`ClusterError::Cache`]
    /// instead of hanging startup.
    pub async fn wait_for_sync(&self, timeout: Option<Duration>) -> Result<(), ClusterError> {
        info!("Waiting for Service and Ingress caches to sync");
        let wait = async {
            self.services
                .wait_until_ready()
                .await
                .map_err(|e| ClusterError::Cache(format!("Service store: {}", e)))?;
            debug!("Service cache synced");
            self.ingresses
                .wait_until_ready()
                .await
                .map_err(|e| ClusterError::Cache(format!("Ingress store: {}", e)))?;
            debug!("Ingress cache synced");
            Ok::<(), ClusterError>(())
        };

        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_elapsed| ClusterError::Cache(format!("caches not synced after {:?}", timeout)))?,
            None => wait.await,
        }?;

        info!(
            "Caches synced: {} services, {} ingresses",
            self.services.state().len(),
            self.ingresses.state().len()
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceCache for StoreCache {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, ClusterError> {
        Ok(self.services.get(&object_ref(namespace, name)))
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Arc<Ingress>>, ClusterError> {
        Ok(self.ingresses.get(&object_ref(namespace, name)))
    }
}

fn object_ref<K>(namespace: &str, name: &str) -> ObjectRef<K>
where
    K: kube::Resource<DynamicType = ()>,
{
    let obj = ObjectRef::new(name);
    if namespace.is_empty() { obj } else { obj.within(namespace) }
}
