//! In-memory cluster for unit testing
//!
//! [`MockCluster`] is both the cache and the backing store: an Ingress created
//! through [`ResourceClient`] is visible to the next [`ResourceCache`] lookup,
//! which is what a settled informer would eventually show. Failures can be
//! injected per operation to exercise retry and race handling.

use crate::cluster_trait::{ResourceCache, ResourceClient};
use crate::error::ClusterError;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type ObjectId = (String, String);

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `ResourceCache::get_service`
    GetService,
    /// `ResourceCache::get_ingress`
    GetIngress,
    /// `ResourceClient::create_ingress`
    CreateIngress,
    /// `ResourceClient::delete_ingress`
    DeleteIngress,
}

/// Failure returned by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// [`ClusterError::NotFound`]
    NotFound,
    /// [`ClusterError::AlreadyExists`]
    AlreadyExists,
    /// [`ClusterError::Request`], a retryable failure
    Transient,
}

impl MockFailure {
    fn into_error(self, what: String) -> ClusterError {
        match self {
            Self::NotFound => ClusterError::NotFound(what),
            Self::AlreadyExists => ClusterError::AlreadyExists(what),
            Self::Transient => ClusterError::Request(format!("injected failure for {}", what)),
        }
    }
}

/// Mock cluster for testing
#[derive(Clone, Default)]
pub struct MockCluster {
    services: Arc<Mutex<HashMap<ObjectId, Arc<Service>>>>,
    ingresses: Arc<Mutex<HashMap<ObjectId, Arc<Ingress>>>>,
    // Remaining injected failures per operation
    faults: Arc<Mutex<HashMap<MockOp, (MockFailure, usize)>>>,
    latency: Arc<Mutex<Option<Duration>>>,
    create_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("services", &lock(&self.services).len())
            .field("ingresses", &lock(&self.ingresses).len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn object_id(namespace: &str, name: &str) -> ObjectId {
    (namespace.to_string(), name.to_string())
}

fn meta_id(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> ObjectId {
    object_id(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

impl MockCluster {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a Service (for test setup)
    pub fn add_service(&self, service: Service) {
        lock(&self.services).insert(meta_id(&service.metadata), Arc::new(service));
    }

    /// Remove a Service, as if deleted by its owner
    pub fn remove_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        lock(&self.services).remove(&object_id(namespace, name))
    }

    /// Add or replace an Ingress (for test setup)
    pub fn add_ingress(&self, ingress: Ingress) {
        lock(&self.ingresses).insert(meta_id(&ingress.metadata), Arc::new(ingress));
    }

    /// Remove an Ingress behind the controller's back
    pub fn remove_ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
        lock(&self.ingresses).remove(&object_id(namespace, name))
    }

    /// Current Ingress `namespace/name`, if any
    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
        lock(&self.ingresses).get(&object_id(namespace, name)).cloned()
    }

    /// Number of stored Ingresses
    pub fn ingress_count(&self) -> usize {
        lock(&self.ingresses).len()
    }

    /// Fail the next `times` calls of `op` with `failure`
    pub fn fail(&self, op: MockOp, failure: MockFailure, times: usize) {
        if times > 0 {
            lock(&self.faults).insert(op, (failure, times));
        }
    }

    /// Fail every call of `op` with `failure` until [`clear_failures`](Self::clear_failures)
    pub fn fail_always(&self, op: MockOp, failure: MockFailure) {
        self.fail(op, failure, usize::MAX);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        lock(&self.faults).clear();
    }

    /// Delay every client call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Number of `create_ingress` calls observed
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_ingress` calls observed
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn take_fault(&self, op: MockOp) -> Option<MockFailure> {
        let mut faults = lock(&self.faults);
        let (failure, remaining) = faults.get_mut(&op)?;
        let failure = *failure;
        if *remaining != usize::MAX {
            *remaining -= 1;
        }
        if *remaining == 0 {
            faults.remove(&op);
        }
        Some(failure)
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl ResourceCache for MockCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, ClusterError> {
        if let Some(failure) = self.take_fault(MockOp::GetService) {
            return Err(failure.into_error(format!("Service {}/{}", namespace, name)));
        }
        Ok(lock(&self.services).get(&object_id(namespace, name)).cloned())
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Arc<Ingress>>, ClusterError> {
        if let Some(failure) = self.take_fault(MockOp::GetIngress) {
            return Err(failure.into_error(format!("Ingress {}/{}", namespace, name)));
        }
        Ok(self.ingress(namespace, name))
    }
}

#[async_trait::async_trait]
impl ResourceClient for MockCluster {
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), ClusterError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let name = ingress.metadata.name.clone().unwrap_or_default();
        let what = format!("Ingress {}/{}", namespace, name);
        if let Some(failure) = self.take_fault(MockOp::CreateIngress) {
            return Err(failure.into_error(what));
        }

        let mut ingresses = lock(&self.ingresses);
        let id = object_id(namespace, &name);
        if ingresses.contains_key(&id) {
            return Err(ClusterError::AlreadyExists(what));
        }
        let mut stored = ingress.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        ingresses.insert(id, Arc::new(stored));
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let what = format!("Ingress {}/{}", namespace, name);
        if let Some(failure) = self.take_fault(MockOp::DeleteIngress) {
            return Err(failure.into_error(what));
        }

        match lock(&self.ingresses).remove(&object_id(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ingress(name: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_is_visible_to_cache() {
        let cluster = MockCluster::new();
        cluster.create_ingress("default", &ingress("web")).await.unwrap();

        let cached = cluster.get_ingress("default", "web").await.unwrap().unwrap();
        assert_eq!(cached.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(cluster.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_standard_conflict_semantics() {
        let cluster = MockCluster::new();
        cluster.create_ingress("default", &ingress("web")).await.unwrap();

        let again = cluster.create_ingress("default", &ingress("web")).await;
        assert!(again.unwrap_err().is_already_exists());

        cluster.delete_ingress("default", "web").await.unwrap();
        let missing = cluster.delete_ingress("default", "web").await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let cluster = MockCluster::new();
        cluster.fail(MockOp::CreateIngress, MockFailure::Transient, 2);

        assert!(matches!(
            cluster.create_ingress("default", &ingress("web")).await,
            Err(ClusterError::Request(_))
        ));
        assert!(cluster.create_ingress("default", &ingress("web")).await.is_err());
        assert!(cluster.create_ingress("default", &ingress("web")).await.is_ok());
        assert_eq!(cluster.ingress_count(), 1);
    }
}
