use chrono::{DateTime, Utc};
use k8s_openapi::serde_json::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a watched object: `namespace/name`, or just `name` for
/// cluster-scoped resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    #[must_use]
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}")),
            _ => Self(name.to_string()),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Snapshot of a resource as last observed from the source.
///
/// The cache owns these; everybody else sees them through an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedObject {
    pub key: ObjectKey,
    pub namespace: Option<String>,
    pub name: String,
    /// Opaque ordering token; only compared for equality
    pub resource_version: String,
    pub labels: BTreeMap<String, String>,
    pub payload: Value,
    pub observed_at: DateTime<Utc>,
}

impl WatchedObject {
    #[must_use]
    pub fn new(
        namespace: Option<&str>,
        name: &str,
        resource_version: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            key: ObjectKey::new(namespace, name),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(ToString::to_string),
            name: name.to_string(),
            resource_version: resource_version.into(),
            labels: BTreeMap::new(),
            payload,
            observed_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}
