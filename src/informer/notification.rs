use super::object::{ObjectKey, WatchedObject};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One observed transition of a cached object.
#[derive(Debug, Clone)]
pub enum ChangeNotification {
    Added(Arc<WatchedObject>),
    Updated {
        old: Arc<WatchedObject>,
        new: Arc<WatchedObject>,
    },
    /// Carries the last state the cache held for the key
    Deleted(Arc<WatchedObject>),
}

impl ChangeNotification {
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Added(obj) | Self::Deleted(obj) | Self::Updated { new: obj, .. } => &obj.key,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Added(_) => ChangeKind::Added,
            Self::Updated { .. } => ChangeKind::Updated,
            Self::Deleted(_) => ChangeKind::Deleted,
        }
    }

    /// The most recent object state this notification describes
    #[must_use]
    pub fn object(&self) -> &Arc<WatchedObject> {
        match self {
            Self::Added(obj) | Self::Deleted(obj) | Self::Updated { new: obj, .. } => obj,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors a handler can report back to the informer.
///
/// Queued handlers are retried through the rate limiter on any of these.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HandlerResult = core::result::Result<(), HandlerError>;

/// Callbacks a consumer registers with an informer.
///
/// Every method has a no-op default so handlers only implement what they need.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, _obj: Arc<WatchedObject>) -> HandlerResult {
        Ok(())
    }

    async fn on_update(&self, _old: Arc<WatchedObject>, _new: Arc<WatchedObject>) -> HandlerResult {
        Ok(())
    }

    async fn on_delete(&self, _obj: Arc<WatchedObject>) -> HandlerResult {
        Ok(())
    }
}

/// Route a notification to the matching callback
pub(crate) async fn invoke(
    handler: &dyn EventHandler,
    notification: ChangeNotification,
) -> HandlerResult {
    match notification {
        ChangeNotification::Added(obj) => handler.on_add(obj).await,
        ChangeNotification::Updated { old, new } => handler.on_update(old, new).await,
        ChangeNotification::Deleted(obj) => handler.on_delete(obj).await,
    }
}

/// Where a handler runs relative to the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Called on the dispatch path; must be fast and must not block
    Inline,
    /// Wrapped as a work item, run by the worker pool and retried on error
    #[default]
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(String);

impl HandlerId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Queue key for queued delivery: one lane per handler and object.
///
/// Deduplication and the single-attempt-in-flight guarantee hold per
/// (handler, object). For one handler an object is never processed twice at
/// once, but two handlers may work on the same object concurrently, so a
/// handler that keeps failing or blocking on a key never holds up the others.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub handler: HandlerId,
    pub object: ObjectKey,
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.handler, self.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;

    #[test]
    fn test_notification_key_and_kind() {
        let old = Arc::new(WatchedObject::new(Some("ns"), "a", "1", json!({})));
        let new = Arc::new(WatchedObject::new(Some("ns"), "a", "2", json!({})));
        let n = ChangeNotification::Updated {
            old,
            new: new.clone(),
        };
        assert_eq!(n.key().as_str(), "ns/a");
        assert_eq!(n.kind(), ChangeKind::Updated);
        assert_eq!(n.object().resource_version, "2");
        assert_eq!(ChangeKind::Deleted.to_string(), "deleted");
    }

    #[test]
    fn test_handler_ids_are_unique() {
        assert_ne!(HandlerId::new(), HandlerId::new());
    }
}
