//! Work queue keys.
//!
//! A key names one Service and the Ingress derived from it; both share the
//! same namespace and name. Keys are `namespace/name`, or just `name` for an
//! empty namespace, and split back at the first `/`.

use crate::error::ControllerError;
use kube::Resource;
use std::fmt;

/// Stable identifier for one unit of reconcile work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(String);

impl Key {
    /// Join a namespace and name into a key
    pub fn new(namespace: &str, name: &str) -> Self {
        if namespace.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", namespace, name))
        }
    }

    /// Key for a watched object; `None` when the object carries no name
    pub fn for_object<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        let name = meta.name.as_deref().filter(|name| !name.is_empty())?;
        Some(Self::new(meta.namespace.as_deref().unwrap_or_default(), name))
    }

    /// Split into `(namespace, name)`.
    ///
    /// Everything after the first `/` belongs to the name.
    pub fn split(&self) -> Result<(&str, &str), ControllerError> {
        match self.0.split_once('/') {
            None if !self.0.is_empty() => Ok(("", self.0.as_str())),
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => Ok((namespace, name)),
            _ => Err(ControllerError::MalformedKey(self.0.clone())),
        }
    }

    /// The raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}
