//! Kubernetes resource watchers.
//!
//! Each watcher drives one `kube_runtime` watch stream, keeps its reflector
//! store current and turns the events into [`Notification`]s for the
//! [`EventRouter`]. Notifications are computed against the store *before* an
//! event is applied (so an update still sees the previous object) and routed
//! *after* (so a worker picking up the key already sees the new state).
//!
//! During a re-list the writer buffers `InitApply` objects and only swaps
//! them into the store at `InitDone`, so notifications derived from a re-list
//! are held back until that event has been applied.

use crate::error::ControllerError;
use crate::router::{EventRouter, Notification};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::{Api, ResourceExt};
use kube_runtime::reflector::{ObjectRef, Store, store::Writer};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watches Services and Ingresses and feeds the router.
pub struct Watcher {
    router: Arc<EventRouter>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self { router }
    }

    /// Starts watching Services.
    ///
    /// Additions and real updates are routed. Deletions are only logged: the
    /// owned Ingress is removed by the garbage collector.
    pub async fn watch_services(
        &self,
        api: Api<Service>,
        mut writer: Writer<Service>,
    ) -> Result<(), ControllerError> {
        info!("Starting Service watcher");
        let cache = writer.as_reader();
        let mut tracker = ServiceTracker::default();

        let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Service watch error, retrying: {}", e);
                    continue;
                }
            };
            let notifications = tracker.notifications(&cache, &event);
            writer.apply_watcher_event(&event);
            self.route_all(notifications);
        }

        Err(ControllerError::Watch("Service watch stream ended".to_string()))
    }

    /// Starts watching Ingresses.
    ///
    /// Only deletions are routed. A deletion missed while the watch was
    /// disconnected is recovered on the next re-list.
    pub async fn watch_ingresses(
        &self,
        api: Api<Ingress>,
        mut writer: Writer<Ingress>,
    ) -> Result<(), ControllerError> {
        info!("Starting Ingress watcher");
        let cache = writer.as_reader();
        let mut tracker = IngressTracker::default();

        let mut stream = watcher(api, watcher::Config::default()).default_backoff().boxed();
        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Ingress watch error, retrying: {}", e);
                    continue;
                }
            };
            let notifications = tracker.notifications(&cache, &event);
            writer.apply_watcher_event(&event);
            self.route_all(notifications);
        }

        Err(ControllerError::Watch("Ingress watch stream ended".to_string()))
    }

    fn route_all(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.router.route(notification);
        }
    }
}

/// Turns Service events into addition and update notifications.
///
/// Each object is compared with the cached copy before the event is
/// applied. Notifications from a re-list are released at `InitDone`.
#[derive(Debug, Default)]
pub(crate) struct ServiceTracker {
    /// Notifications held back since the current re-list started
    relisted: Option<Vec<Notification>>,
}

impl ServiceTracker {
    /// Notifications to route once `event` has been applied to `cache`.
    pub(crate) fn notifications(
        &mut self,
        cache: &Store<Service>,
        event: &watcher::Event<Service>,
    ) -> Vec<Notification> {
        match event {
            watcher::Event::Apply(service) => vec![compare_with_cache(cache, service)],
            watcher::Event::InitApply(service) => {
                let notification = compare_with_cache(cache, service);
                match self.relisted.as_mut() {
                    Some(pending) => {
                        pending.push(notification);
                        Vec::new()
                    }
                    None => vec![notification],
                }
            }
            watcher::Event::Delete(service) => {
                info!(
                    "Service {}/{} deleted",
                    service.namespace().unwrap_or_default(),
                    service.name_any()
                );
                Vec::new()
            }
            watcher::Event::Init => {
                debug!("Service watcher initialized");
                self.relisted = Some(Vec::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                info!("Service watcher initialization complete");
                self.relisted.take().unwrap_or_default()
            }
        }
    }
}

fn compare_with_cache(cache: &Store<Service>, service: &Service) -> Notification {
    let new = Arc::new(service.clone());
    match cache.get(&ObjectRef::from_obj(service)) {
        Some(old) => Notification::ServiceUpdated { old, new },
        None => Notification::ServiceAdded(new),
    }
}

/// Turns Ingress events into deletion notifications.
///
/// A re-list replaces the whole store. Ingresses cached before the re-list
/// but absent from it were deleted while nobody was watching; they are
/// reported when the re-list completes.
#[derive(Debug, Default)]
struct IngressTracker {
    /// Objects seen since the current re-list started
    relisted: Option<HashSet<ObjectRef<Ingress>>>,
}

impl IngressTracker {
    fn notifications(
        &mut self,
        cache: &Store<Ingress>,
        event: &watcher::Event<Ingress>,
    ) -> Vec<Notification> {
        match event {
            watcher::Event::Delete(ingress) => {
                debug!(
                    "Ingress {}/{} deleted",
                    ingress.namespace().unwrap_or_default(),
                    ingress.name_any()
                );
                vec![Notification::IngressDeleted(Arc::new(ingress.clone()))]
            }
            watcher::Event::Apply(_) => Vec::new(),
            watcher::Event::Init => {
                debug!("Ingress watcher initialized");
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(ingress) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(ObjectRef::from_obj(ingress));
                }
                Vec::new()
            }
            watcher::Event::InitDone => {
                info!("Ingress watcher initialization complete");
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                cache
                    .state()
                    .into_iter()
                    .filter(|ingress| !relisted.contains(&ObjectRef::from_obj(&**ingress)))
                    .map(Notification::IngressDeleted)
                    .collect()
            }
        }
    }
}
