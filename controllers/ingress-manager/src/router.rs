//! Event routing.
//!
//! Turns cache notifications into work queue keys. The router only ever
//! enqueues; it never talks to the API server, and it applies two filters:
//!
//! - a Service update whose old and new objects are identical (resyncs,
//!   re-lists) produces no work;
//! - an Ingress deletion matters only when the Ingress had a controlling
//!   owner of kind Service.
//!
//! The owner's UID is not compared with the Service cached under the same
//! name. After a Service is deleted and recreated, the old Ingress still
//! carries the old UID, and its garbage collection is exactly what the new
//! Service needs to hear about.

use crate::key::Key;
use crate::metrics::Metrics;
use crate::queue::WorkQueue;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error};

/// Kind recorded in the owner reference of every managed Ingress
pub const SERVICE_KIND: &str = "Service";

/// Change notifications the router understands.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A Service appeared in the cache
    ServiceAdded(Arc<Service>),
    /// A cached Service was replaced
    ServiceUpdated {
        /// Previously cached object
        old: Arc<Service>,
        /// Newly observed object
        new: Arc<Service>,
    },
    /// An Ingress was deleted
    IngressDeleted(Arc<Ingress>),
}

impl Notification {
    fn label(&self) -> &'static str {
        match self {
            Self::ServiceAdded(_) => "service_added",
            Self::ServiceUpdated { .. } => "service_updated",
            Self::IngressDeleted(_) => "ingress_deleted",
        }
    }
}

/// Routes notifications into the work queue.
pub struct EventRouter {
    queue: WorkQueue,
    metrics: Metrics,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter").field("queue", &self.queue).finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Creates a new router feeding `queue`.
    pub fn new(queue: WorkQueue, metrics: Metrics) -> Self {
        Self { queue, metrics }
    }

    /// Route one notification. Returns the key that was enqueued, if any.
    pub fn route(&self, notification: Notification) -> Option<Key> {
        let event = notification.label();
        let key = match &notification {
            Notification::ServiceAdded(service) => key_for(&**service),
            Notification::ServiceUpdated { old, new } => {
                if old == new {
                    debug!("Service {} unchanged, ignoring update", new.name_any());
                    None
                } else {
                    key_for(&**new)
                }
            }
            Notification::IngressDeleted(ingress) => {
                if is_managed(ingress) {
                    key_for(&**ingress)
                } else {
                    debug!(
                        "Ingress {} has no controlling Service, ignoring deletion",
                        ingress.name_any()
                    );
                    None
                }
            }
        };

        let decision = if key.is_some() { "enqueued" } else { "ignored" };
        self.metrics.events.with_label_values(&[event, decision]).inc();

        let key = key?;
        debug!("{}: enqueueing {}", event, key);
        self.queue.add(key.clone());
        self.metrics.queue_depth.set(i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
        Some(key)
    }
}

/// Whether `ingress` had a controlling owner of kind Service
fn is_managed(ingress: &Ingress) -> bool {
    ingress
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true))
        .is_some_and(|owner| owner.kind == SERVICE_KIND)
}

fn key_for<K: Resource>(obj: &K) -> Option<Key> {
    let key = Key::for_object(obj);
    if key.is_none() {
        error!("Couldn't get key for object {:?}", obj.meta());
    }
    key
}
