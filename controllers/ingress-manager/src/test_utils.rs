//! Test utilities for unit testing the controller
//!
//! Builders for Services, Ingresses and a reconciler wired to a
//! [`MockCluster`].

use crate::config::IngressSettings;
use crate::reconciler::Reconciler;
use cluster_client::MockCluster;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Helper to create a test Service, optionally carrying the trigger annotation
pub fn create_test_service(namespace: &str, name: &str, uid: &str, annotated: bool) -> Service {
    let annotations = annotated.then(|| {
        BTreeMap::from([("ingress/http".to_string(), String::new())])
    });
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create an owner reference the way the API server records one
pub fn owner_reference(kind: &str, name: &str, uid: &str, controller: bool) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        controller: Some(controller),
        block_owner_deletion: Some(true),
    }
}

/// Helper to create a bare Ingress with the given owner references
pub fn create_test_ingress(namespace: &str, name: &str, owners: Vec<OwnerReference>) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: (!owners.is_empty()).then_some(owners),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create an Ingress controlled by `service`
pub fn create_owned_ingress(service: &Service) -> Ingress {
    let namespace = service.metadata.namespace.clone().unwrap_or_default();
    let name = service.metadata.name.clone().unwrap_or_default();
    let uid = service.metadata.uid.clone().unwrap_or_default();
    create_test_ingress(&namespace, &name, vec![owner_reference("Service", &name, &uid, true)])
}

/// Helper to create a reconciler backed by `cluster` with default settings
pub fn create_test_reconciler(cluster: &MockCluster) -> Reconciler {
    Reconciler::new(
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        IngressSettings::default(),
    )
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
