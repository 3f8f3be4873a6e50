use super::object::WatchedObject;
use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Which slice of the collection an informer watches
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    /// `None` watches every namespace
    pub namespace: Option<String>,
    /// Label selector in the usual `k=v,k2!=v2` syntax
    pub label_selector: Option<String>,
}

impl Selector {
    #[must_use]
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            label_selector: None,
        }
    }

    #[must_use]
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Client-side evaluation for sources that cannot filter server-side.
    ///
    /// Supports equality (`k=v`, `k==v`), inequality (`k!=v`), existence (`k`)
    /// and non-existence (`!k`) terms.
    #[must_use]
    pub fn matches(&self, obj: &WatchedObject) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        let Some(selector) = &self.label_selector else {
            return true;
        };
        selector
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .all(|term| {
                if let Some((k, v)) = term.split_once("!=") {
                    obj.labels.get(k.trim()).map(String::as_str) != Some(v.trim())
                } else if let Some((k, v)) =
                    term.split_once("==").or_else(|| term.split_once('='))
                {
                    obj.labels.get(k.trim()).map(String::as_str) == Some(v.trim())
                } else if let Some(k) = term.strip_prefix('!') {
                    !obj.labels.contains_key(k.trim())
                } else {
                    obj.labels.contains_key(term)
                }
            })
    }
}

/// Result of a full list
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<WatchedObject>,
    /// Collection version to resume a watch from
    pub resource_version: String,
}

/// Incremental change reported by a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(WatchedObject),
    Modified(WatchedObject),
    Deleted(WatchedObject),
    /// Progress marker carrying a newer collection version
    Bookmark(String),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// A transport that can list and watch a resource collection.
///
/// The informer only depends on this capability; cluster APIs, webhook relays
/// and pollers all plug in here.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<ListResult>;

    /// Open a watch starting after `resource_version`.
    ///
    /// Errors returned here are attach failures; errors yielded by the stream are
    /// disconnects. A stream that ends is a server-side close.
    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream>;
}

#[async_trait]
impl<T: WatchSource + ?Sized> WatchSource for Arc<T> {
    async fn list(&self, selector: &Selector) -> Result<ListResult> {
        (**self).list(selector).await
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream> {
        (**self).watch(selector, resource_version).await
    }
}

/// Anything that can produce a full snapshot, e.g. a ConfigMap scan
#[async_trait]
pub trait Lister: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<Vec<WatchedObject>>;
}

#[async_trait]
impl<T: Lister + ?Sized> Lister for Arc<T> {
    async fn list(&self, selector: &Selector) -> Result<Vec<WatchedObject>> {
        (**self).list(selector).await
    }
}

/// Turns a `Lister` into a `WatchSource`.
///
/// The watch stream carries no events and simply closes after the poll
/// interval, so the informer re-lists and diffs on every tick.
pub struct PollingSource<L> {
    lister: L,
    interval: Duration,
}

impl<L: Lister> PollingSource<L> {
    #[must_use]
    pub const fn new(lister: L, interval: Duration) -> Self {
        Self { lister, interval }
    }
}

#[async_trait]
impl<L: Lister> WatchSource for PollingSource<L> {
    async fn list(&self, selector: &Selector) -> Result<ListResult> {
        let items = self.lister.list(selector).await?;
        debug!("📥 Poll listed {} objects", items.len());
        Ok(ListResult {
            items,
            resource_version: chrono::Utc::now().timestamp_millis().to_string(),
        })
    }

    async fn watch(&self, _selector: &Selector, _resource_version: &str) -> Result<WatchStream> {
        let interval = self.interval;
        let closes_after_interval = futures::stream::once(async move {
            tokio::time::sleep(interval).await;
        })
        .filter_map(|()| async { None::<Result<WatchEvent>> });
        Ok(closes_after_interval.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;

    struct FixedLister;

    #[async_trait]
    impl Lister for FixedLister {
        async fn list(&self, _selector: &Selector) -> Result<Vec<WatchedObject>> {
            Ok(vec![WatchedObject::new(Some("kube-bench"), "cis", "1", json!({}))])
        }
    }

    #[test]
    fn test_selector_matching() {
        let obj = WatchedObject::new(Some("security"), "r", "1", json!({}))
            .with_label("app", "trivy")
            .with_label("tier", "scan");

        assert!(Selector::default().matches(&obj));
        assert!(Selector::namespaced("security").matches(&obj));
        assert!(!Selector::namespaced("default").matches(&obj));
        assert!(Selector::default().with_labels("app=trivy,tier").matches(&obj));
        assert!(Selector::default().with_labels("app==trivy").matches(&obj));
        assert!(!Selector::default().with_labels("app!=trivy").matches(&obj));
        assert!(!Selector::default().with_labels("!tier").matches(&obj));
        assert!(Selector::default().with_labels("owner!=x").matches(&obj));
    }

    #[tokio::test]
    async fn test_polling_watch_closes_after_interval() {
        let source = PollingSource::new(FixedLister, Duration::from_millis(20));
        let listed = source.list(&Selector::default()).await.unwrap();
        assert_eq!(listed.items.len(), 1);

        let mut stream = source
            .watch(&Selector::default(), &listed.resource_version)
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(matches!(next, Ok(None)));
    }
}
