//! Reconciliation logic for annotated Services.
//!
//! Level-triggered: every call looks only at the Service and Ingress as they
//! are now, never at the event that caused the call, so replaying a key any
//! number of times is safe.
//!
//! | wants Ingress | Ingress exists | action |
//! |---|---|---|
//! | yes | no  | create |
//! | yes | yes | nothing (existing specs are never diffed) |
//! | no  | yes | delete |
//! | no  | no  | nothing |
//!
//! A Service that no longer exists is left alone: its Ingress carries a
//! controller owner reference and is reaped by the garbage collector.

use crate::config::IngressSettings;
use crate::error::ControllerError;
use crate::key::Key;
use cluster_client::{ResourceCache, ResourceClient};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// What a successful reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The Ingress was created (or someone else created it first)
    Created,
    /// The Ingress was deleted (or was already gone)
    Deleted,
    /// Actual state already matched the Service
    InSync,
    /// The Service is gone; nothing to decide
    ServiceAbsent,
}

impl ReconcileOutcome {
    /// Label used in metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deleted => "deleted",
            Self::InSync => "in_sync",
            Self::ServiceAbsent => "service_absent",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything the worker pool can drive with keys.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Bring the object named by `key` to its desired state.
    async fn reconcile(&self, key: &Key) -> Result<ReconcileOutcome, ControllerError>;
}

/// Reconciles the Ingress owned by each Service.
pub struct Reconciler {
    cache: Arc<dyn ResourceCache>,
    client: Arc<dyn ResourceClient>,
    settings: IngressSettings,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        cache: Arc<dyn ResourceCache>,
        client: Arc<dyn ResourceClient>,
        settings: IngressSettings,
    ) -> Self {
        Self {
            cache,
            client,
            settings,
        }
    }

    /// Whether the Service asks for an Ingress
    pub fn wants_ingress(&self, service: &Service) -> bool {
        service.annotations().contains_key(&self.settings.trigger_annotation)
    }

    /// Reconciles the Service named by `key`.
    ///
    /// This method:
    /// 1. Splits the key into namespace and name
    /// 2. Looks up the Service; a missing Service is a no-op
    /// 3. Looks up the Ingress of the same name
    /// 4. Creates or deletes the Ingress if it disagrees with the annotation
    ///
    /// Already-exists on create and not-found on delete mean another actor got
    /// there first and count as success.
    pub async fn reconcile_service(&self, key: &Key) -> Result<ReconcileOutcome, ControllerError> {
        let (namespace, name) = key.split()?;

        let Some(service) = self.cache.get_service(namespace, name).await? else {
            debug!("Service {} no longer exists, skipping", key);
            return Ok(ReconcileOutcome::ServiceAbsent);
        };

        let wants_ingress = self.wants_ingress(&service);
        let has_ingress = self.cache.get_ingress(namespace, name).await?.is_some();

        match (wants_ingress, has_ingress) {
            (true, false) => {
                let ingress = self.build_ingress(&service)?;
                match self.client.create_ingress(namespace, &ingress).await {
                    Ok(()) => info!("Created Ingress {}", key),
                    Err(e) if e.is_already_exists() => {
                        info!("Ingress {} already exists, nothing to create", key);
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(ReconcileOutcome::Created)
            }
            (false, true) => {
                match self.client.delete_ingress(namespace, name).await {
                    Ok(()) => info!("Deleted Ingress {}", key),
                    Err(e) if e.is_not_found() => {
                        info!("Ingress {} already gone, nothing to delete", key);
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(ReconcileOutcome::Deleted)
            }
            _ => {
                debug!("Service {} in sync (wants ingress: {})", key, wants_ingress);
                Ok(ReconcileOutcome::InSync)
            }
        }
    }

    /// Build the Ingress for `service`.
    ///
    /// Deterministic: the same Service always yields the same object. One rule
    /// routes `host/` (prefix match) to the Service's backend port, and the
    /// Service is set as controlling owner.
    pub fn build_ingress(&self, service: &Service) -> Result<Ingress, ControllerError> {
        let owner = service.controller_owner_ref(&()).ok_or_else(|| {
            ControllerError::Reconciliation(format!(
                "Service {} has no uid, cannot own an Ingress",
                service.name_any()
            ))
        })?;

        Ok(Ingress {
            metadata: ObjectMeta {
                name: service.metadata.name.clone(),
                namespace: service.metadata.namespace.clone(),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some(self.settings.ingress_class.clone()),
                rules: Some(vec![IngressRule {
                    host: Some(self.settings.host.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service.name_any(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(self.settings.backend_port),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &Key) -> Result<ReconcileOutcome, ControllerError> {
        self.reconcile_service(key).await
    }
}
