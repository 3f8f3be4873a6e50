/**
 * In-process watch source
 *
 * Holds a collection in memory and fans changes out to live watchers. Each
 * change bumps a collection-wide resource version and is kept in a bounded
 * history so a watch can resume from an older version. Used as the sink for
 * webhook relays and as the fixture in tests.
 */
use super::errors::watch_error;
use super::object::{ObjectKey, WatchedObject};
use super::source::{ListResult, Selector, WatchEvent, WatchSource, WatchStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Events remembered for resuming watches
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

pub struct MemorySource {
    state: Mutex<MemoryState>,
    history_limit: usize,
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, WatchedObject>,
    version: u64,
    history: VecDeque<(u64, WatchEvent)>,
    // watches from versions at or below this have missed events
    compacted: u64,
    watchers: Vec<Watcher>,
    failing_lists: usize,
    failing_watches: usize,
    lists: usize,
}

struct Watcher {
    selector: Selector,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemorySource")
            .field("objects", &state.objects.len())
            .field("version", &state.version)
            .field("watchers", &state.watchers.len())
            .finish_non_exhaustive()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    #[must_use]
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            history_limit: history_limit.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or replace an object. The stored copy gets a fresh resource version,
    /// which is returned.
    pub fn apply(&self, mut obj: WatchedObject) -> String {
        let mut state = self.lock();
        state.version += 1;
        obj.resource_version = state.version.to_string();

        let event = if state.objects.insert(obj.key.clone(), obj.clone()).is_some() {
            WatchEvent::Modified(obj)
        } else {
            WatchEvent::Added(obj)
        };
        self.publish(&mut state, event);
        state.version.to_string()
    }

    /// Remove an object, returning the last stored copy
    pub fn delete(&self, key: &ObjectKey) -> Option<WatchedObject> {
        let mut state = self.lock();
        let mut removed = state.objects.remove(key)?;
        state.version += 1;
        removed.resource_version = state.version.to_string();
        self.publish(&mut state, WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    fn publish(&self, state: &mut MemoryState, event: WatchEvent) {
        let version = state.version;
        state.watchers.retain(|w| {
            !event_matches(&w.selector, &event) || w.tx.send(Ok(event.clone())).is_ok()
        });

        state.history.push_back((version, event));
        while state.history.len() > self.history_limit {
            if let Some((dropped, _)) = state.history.pop_front() {
                state.compacted = dropped;
            }
        }
    }

    /// Break every open watch with a transport error
    pub fn disconnect_watchers(&self) {
        let mut state = self.lock();
        debug!("🔌 Disconnecting {} watchers", state.watchers.len());
        for watcher in state.watchers.drain(..) {
            let _ = watcher.tx.send(Err(watch_error("connection reset by peer")));
        }
    }

    /// Close every open watch cleanly, as a server-side timeout would
    pub fn close_watchers(&self) {
        self.lock().watchers.clear();
    }

    /// Forget all history, so any watch resuming from an older version expires
    pub fn compact(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.compacted = state.version;
    }

    /// Make the next `n` list calls fail
    pub fn fail_next_lists(&self, n: usize) {
        self.lock().failing_lists = n;
    }

    /// Make the next `n` watch attach attempts fail
    pub fn fail_next_watches(&self, n: usize) {
        self.lock().failing_watches = n;
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.lock().lists
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    #[must_use]
    pub fn version(&self) -> String {
        self.lock().version.to_string()
    }
}

#[async_trait]
impl WatchSource for MemorySource {
    async fn list(&self, selector: &Selector) -> Result<ListResult> {
        let mut state = self.lock();
        state.lists += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(watch_error("list unavailable"));
        }

        Ok(ListResult {
            items: state
                .objects
                .values()
                .filter(|obj| selector.matches(obj))
                .cloned()
                .collect(),
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(&self, selector: &Selector, resource_version: &str) -> Result<WatchStream> {
        let from: u64 = resource_version
            .parse()
            .map_err(|_| watch_error(format!("invalid resource version {resource_version:?}")))?;

        let mut state = self.lock();
        if state.failing_watches > 0 {
            state.failing_watches -= 1;
            return Err(watch_error("watch unavailable"));
        }
        if from < state.compacted {
            return Err(Error::Expired(resource_version.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (version, event) in &state.history {
            if *version > from && event_matches(selector, event) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        state.watchers.push(Watcher {
            selector: selector.clone(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

fn event_matches(selector: &Selector, event: &WatchEvent) -> bool {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
            selector.matches(obj)
        }
        WatchEvent::Bookmark(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;
    use std::time::Duration;

    fn obj(name: &str) -> WatchedObject {
        WatchedObject::new(Some("ns"), name, "", json!({ "name": name }))
    }

    async fn next(stream: &mut WatchStream) -> Option<Result<WatchEvent>> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_list_and_live_watch() {
        let source = MemorySource::new();
        source.apply(obj("a"));
        let listed = source.list(&Selector::default()).await.unwrap();
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.resource_version, "1");

        let mut stream = source
            .watch(&Selector::default(), &listed.resource_version)
            .await
            .unwrap();
        source.apply(obj("a"));
        source.delete(&ObjectKey::new(Some("ns"), "a"));

        assert!(matches!(
            next(&mut stream).await,
            Some(Ok(WatchEvent::Modified(o))) if o.resource_version == "2"
        ));
        assert!(matches!(next(&mut stream).await, Some(Ok(WatchEvent::Deleted(_)))));
    }

    #[tokio::test]
    async fn test_watch_replays_missed_history() {
        let source = MemorySource::new();
        source.apply(obj("a"));
        source.apply(obj("b"));
        source.apply(obj("c"));

        let mut stream = source.watch(&Selector::default(), "1").await.unwrap();
        let mut names = Vec::new();
        for _ in 0..2 {
            if let Some(Ok(WatchEvent::Added(o))) = next(&mut stream).await {
                names.push(o.name);
            }
        }
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_compacted_history_expires_old_versions() {
        let source = MemorySource::with_history_limit(2);
        for name in ["a", "b", "c", "d"] {
            source.apply(obj(name));
        }
        assert!(matches!(
            source.watch(&Selector::default(), "1").await,
            Err(Error::Expired(_))
        ));
        assert!(source.watch(&Selector::default(), "2").await.is_ok());

        source.compact();
        assert!(matches!(
            source.watch(&Selector::default(), "3").await,
            Err(Error::Expired(_))
        ));
        assert!(source.watch(&Selector::default(), "4").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_and_injected_failures() {
        let source = MemorySource::new();
        let mut stream = source.watch(&Selector::default(), "0").await.unwrap();
        source.disconnect_watchers();
        assert!(matches!(next(&mut stream).await, Some(Err(Error::Watch(_)))));
        assert!(next(&mut stream).await.is_none());

        source.fail_next_lists(1);
        assert!(source.list(&Selector::default()).await.is_err());
        assert!(source.list(&Selector::default()).await.is_ok());
        assert_eq!(source.list_calls(), 2);

        source.fail_next_watches(1);
        assert!(source.watch(&Selector::default(), "0").await.is_err());
        assert!(source.watch(&Selector::default(), "0").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_filters_by_selector() {
        let source = MemorySource::new();
        let mut stream = source.watch(&Selector::namespaced("other"), "0").await.unwrap();
        source.apply(obj("a"));
        source.apply(WatchedObject::new(Some("other"), "b", "", json!({})));

        assert!(matches!(next(&mut stream).await, Some(Ok(WatchEvent::Added(o))) if o.name == "b"));
    }
}
