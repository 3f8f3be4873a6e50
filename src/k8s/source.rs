/**
 * Cluster API watch source
 *
 * Lists and watches any resource kind through the dynamic API. The watch
 * stream is pumped by a spawned task into a bounded channel, so the stream
 * handed to the informer owns everything it needs.
 */
use crate::error::{Error, Result};
use crate::informer::config::{WATCH_CHANNEL_CAPACITY, WATCH_TIMEOUT_SECONDS};
use crate::informer::errors::watch_error;
use crate::informer::{ListResult, Selector, WatchEvent, WatchSource, WatchStream, WatchedObject};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::serde_json;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchParams};
use kube::core::GroupVersionKind;
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

const GONE: u16 = 410;

#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    resource: ApiResource,
}

impl std::fmt::Debug for KubeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSource")
            .field("api_version", &self.resource.api_version)
            .field("kind", &self.resource.kind)
            .finish_non_exhaustive()
    }
}

impl KubeSource {
    #[must_use]
    pub const fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    /// Watch `kind` in `api_version`, e.g. `("apps/v1", "Deployment")` or
    /// `("v1", "ConfigMap")`. The plural is derived from the kind.
    #[must_use]
    pub fn for_kind(client: Client, api_version: &str, kind: &str) -> Self {
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        let gvk = GroupVersionKind::gvk(group, version, kind);
        Self::new(client, ApiResource::from_gvk(&gvk))
    }

    fn api(&self, selector: &Selector) -> Api<DynamicObject> {
        match &selector.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl WatchSource for KubeSource {
    async fn list(&self, selector: &Selector) -> Result<ListResult> {
        let mut params = ListParams::default();
        if let Some(labels) = &selector.label_selector {
            params = params.labels(labels);
        }

        let listed = self
            .api(selector)
            .list(&params)
            .await
            .map_err(|e| from_kube_error(e, "list"))?;
        let resource_version = listed.metadata.resource_version.clone().unwrap_or_default();
        let items = listed
            .items
            .into_iter()
            .map(to_watched)
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "📥 Listed {} {} at version {}",
            items.len(),
            self.resource.kind,
            resource_version
        );

        Ok(ListResult {
            items,
            resource_version,
        })
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream> {
        let api = self.api(selector);
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        if let Some(labels) = &selector.label_selector {
            params = params.labels(labels);
        }
        let version = resource_version.to_string();
        let kind = self.resource.kind.clone();

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let (attached_tx, attached_rx) = oneshot::channel();

        tokio::spawn(async move {
            let stream = match api.watch(&params, &version).await {
                Ok(stream) => {
                    let _ = attached_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = attached_tx.send(Err(from_kube_error(e, &version)));
                    return;
                }
            };
            info!("🔍 Watching {} from version {}", kind, version);
            futures::pin_mut!(stream);

            loop {
                let item = tokio::select! {
                    () = tx.closed() => break,
                    item = stream.next() => item,
                };
                let Some(item) = item else {
                    debug!("🔍 {} watch closed by server", kind);
                    break;
                };
                let event = item
                    .map_err(|e| from_kube_error(e, &version))
                    .and_then(|event| from_kube_event(event, &version));
                let failed = event.is_err();
                if tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });

        attached_rx
            .await
            .map_err(|_| watch_error("watch task exited before attaching"))??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn from_kube_event(
    event: kube::api::WatchEvent<DynamicObject>,
    version: &str,
) -> Result<WatchEvent> {
    Ok(match event {
        kube::api::WatchEvent::Added(obj) => WatchEvent::Added(to_watched(obj)?),
        kube::api::WatchEvent::Modified(obj) => WatchEvent::Modified(to_watched(obj)?),
        kube::api::WatchEvent::Deleted(obj) => WatchEvent::Deleted(to_watched(obj)?),
        kube::api::WatchEvent::Bookmark(bookmark) => {
            WatchEvent::Bookmark(bookmark.metadata.resource_version)
        }
        kube::api::WatchEvent::Error(response) if response.code == GONE => {
            return Err(Error::Expired(version.to_string()));
        }
        kube::api::WatchEvent::Error(response) => {
            return Err(watch_error(format!("{} ({})", response.message, response.code)));
        }
    })
}

fn from_kube_error(error: kube::Error, version: &str) -> Error {
    match error {
        kube::Error::Api(response) if response.code == GONE => Error::Expired(version.to_string()),
        other => Error::Kube(other),
    }
}

/// Flatten a dynamic object into the cache representation
///
/// # Errors
///
/// Returns an error if the object cannot be serialized back to JSON.
pub fn to_watched(obj: DynamicObject) -> Result<WatchedObject> {
    let name = obj.name_any();
    let namespace = obj.namespace();
    let resource_version = obj.resource_version().unwrap_or_default();
    let labels = obj.labels().clone();
    let payload = serde_json::to_value(&obj)?;

    Ok(
        WatchedObject::new(namespace.as_deref(), &name, resource_version, payload)
            .with_labels(labels),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::serde_json::json;
    use std::collections::BTreeMap;

    fn dynamic(name: &str) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "aquasecurity.github.io",
            "v1alpha1",
            "VulnerabilityReport",
        ));
        let mut obj = DynamicObject::new(name, &resource).within("security");
        obj.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("security".to_string()),
            resource_version: Some("42".to_string()),
            labels: Some(BTreeMap::from([("app".to_string(), "trivy".to_string())])),
            ..ObjectMeta::default()
        };
        obj.data = json!({ "report": { "summary": { "criticalCount": 1 } } });
        obj
    }

    #[test]
    fn test_dynamic_object_conversion() {
        let watched = to_watched(dynamic("nginx-report")).unwrap();
        assert_eq!(watched.key.as_str(), "security/nginx-report");
        assert_eq!(watched.resource_version, "42");
        assert_eq!(watched.labels.get("app").map(String::as_str), Some("trivy"));
        assert_eq!(watched.payload["report"]["summary"]["criticalCount"], 1);
        assert_eq!(watched.payload["kind"], "VulnerabilityReport");
    }

    #[test]
    fn test_watch_events_map_to_informer_events() {
        let added = from_kube_event(kube::api::WatchEvent::Added(dynamic("a")), "1").unwrap();
        assert!(matches!(added, WatchEvent::Added(o) if o.name == "a"));

        let deleted = from_kube_event(kube::api::WatchEvent::Deleted(dynamic("a")), "1").unwrap();
        assert!(matches!(deleted, WatchEvent::Deleted(_)));
    }
}
