#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::serde_json::json;
use kube_informer::informer::{
    BackoffConfig, ChangeKind, EventHandler, HandlerError, HandlerResult, Informer, InformerConfig,
    MemorySource, WatchedObject,
};
use kube_informer::metrics::InformerMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Small delays everywhere so recovery paths run quickly
pub fn fast_config(name: &str) -> InformerConfig {
    InformerConfig::new(name)
        .with_resync_period(Duration::ZERO)
        .with_worker_count(4)
        .with_rate_limiter(Duration::from_millis(1), Duration::from_millis(10))
        .with_max_retries(3)
        .with_watch_backoff(BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: 0.0,
        })
        .with_stop_grace_period(Duration::from_secs(2))
}

pub fn object(namespace: &str, name: &str) -> WatchedObject {
    WatchedObject::new(Some(namespace), name, "", json!({ "name": name }))
}

pub fn informer(source: &Arc<MemorySource>, config: InformerConfig) -> Informer {
    let metrics = Arc::new(InformerMetrics::unregistered(&config.name).unwrap());
    Informer::new(source.clone(), config, metrics)
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Async flavour of `wait_until`
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Wait until every queued notification has been handled
pub async fn drained(informer: &Informer) {
    wait_until("queued work to drain", || informer.pending_work() == 0).await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub kind: ChangeKind,
    pub key: String,
    pub old_version: Option<String>,
    pub version: String,
}

/// Handler that remembers every notification it receives
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> Vec<Seen> {
        self.seen().into_iter().filter(|s| s.kind == kind).collect()
    }

    fn push(&self, kind: ChangeKind, obj: &WatchedObject, old: Option<&WatchedObject>) {
        self.seen.lock().unwrap().push(Seen {
            kind,
            key: obj.key.to_string(),
            old_version: old.map(|o| o.resource_version.clone()),
            version: obj.resource_version.clone(),
        });
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_add(&self, obj: Arc<WatchedObject>) -> HandlerResult {
        self.push(ChangeKind::Added, &obj, None);
        Ok(())
    }

    async fn on_update(&self, old: Arc<WatchedObject>, new: Arc<WatchedObject>) -> HandlerResult {
        self.push(ChangeKind::Updated, &new, Some(&old));
        Ok(())
    }

    async fn on_delete(&self, obj: Arc<WatchedObject>) -> HandlerResult {
        self.push(ChangeKind::Deleted, &obj, None);
        Ok(())
    }
}

/// Handler that fails every call
#[derive(Default)]
pub struct AlwaysFails {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl EventHandler for AlwaysFails {
    async fn on_add(&self, _obj: Arc<WatchedObject>) -> HandlerResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed("downstream unavailable".to_string()))
    }
}
