//! Controller configuration.
//!
//! Everything is read from environment variables once at startup. Unset
//! variables fall back to defaults; set-but-invalid ones are rejected.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 5;
/// Default retry ceiling per key
pub const DEFAULT_MAX_RETRIES: u32 = 10;
/// Annotation whose presence on a Service requests an Ingress
pub const DEFAULT_TRIGGER_ANNOTATION: &str = "ingress/http";
/// Ingress class set on every constructed Ingress
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";
/// Host of the single routing rule
pub const DEFAULT_INGRESS_HOST: &str = "example.com";
/// Backend port of the single routing rule
pub const DEFAULT_BACKEND_PORT: i32 = 80;

/// Shape of the Ingress built for each annotated Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressSettings {
    /// Annotation key that requests an Ingress; its value is ignored
    pub trigger_annotation: String,
    /// `spec.ingressClassName`
    pub ingress_class: String,
    /// Rule host
    pub host: String,
    /// Backend service port number
    pub backend_port: i32,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            trigger_annotation: DEFAULT_TRIGGER_ANNOTATION.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            host: DEFAULT_INGRESS_HOST.to_string(),
            backend_port: DEFAULT_BACKEND_PORT,
        }
    }
}

/// Full controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Number of concurrent workers
    pub workers: usize,
    /// Retries per key before it is dropped
    pub max_retries: u32,
    /// First requeue delay
    pub backoff_base: Duration,
    /// Requeue delay cap
    pub backoff_max: Duration,
    /// How long to wait for the initial cache sync
    pub cache_sync_timeout: Duration,
    /// Listen address for `/metrics`, `/healthz` and `/readyz`
    pub metrics_addr: SocketAddr,
    /// Constructed Ingress shape
    pub ingress: IngressSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            cache_sync_timeout: Duration::from_secs(60),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ingress: IngressSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let workers = parse_or(&lookup, "WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ControllerError::InvalidConfig("WORKERS must be at least 1".to_string()));
        }
        let backend_port = parse_or(&lookup, "INGRESS_BACKEND_PORT", defaults.ingress.backend_port)?;
        if !(1..=65535).contains(&backend_port) {
            return Err(ControllerError::InvalidConfig(format!(
                "INGRESS_BACKEND_PORT out of range: {}",
                backend_port
            )));
        }

        Ok(Self {
            namespace: lookup("WATCH_NAMESPACE"),
            workers,
            max_retries: parse_or(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            backoff_base: Duration::from_millis(parse_or(&lookup, "BACKOFF_BASE_MS", 5)?),
            backoff_max: Duration::from_secs(parse_or(&lookup, "BACKOFF_MAX_SECS", 1000)?),
            cache_sync_timeout: Duration::from_secs(parse_or(&lookup, "CACHE_SYNC_TIMEOUT_SECS", 60)?),
            metrics_addr: parse_or(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
            ingress: IngressSettings {
                trigger_annotation: lookup("TRIGGER_ANNOTATION").unwrap_or(defaults.ingress.trigger_annotation),
                ingress_class: lookup("INGRESS_CLASS").unwrap_or(defaults.ingress.ingress_class),
                host: lookup("INGRESS_HOST").unwrap_or(defaults.ingress.host),
                backend_port,
            },
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{}={:?}: {}", name, raw, e))),
        None => Ok(default),
    }
}
