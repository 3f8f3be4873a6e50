use super::errors::{index_exists_error, unknown_index_error};
use super::notification::ChangeNotification;
use super::object::{ObjectKey, WatchedObject};
use crate::error::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Derives zero or more secondary keys from an object
pub type IndexFn = Arc<dyn Fn(&WatchedObject) -> Vec<String> + Send + Sync>;

/// Registered on every store
pub const NAMESPACE_INDEX: &str = "namespace";

/// The informer's in-memory mirror of the watched collection.
///
/// The primary map and every index live behind one lock, so an index can never
/// point at a key that is missing from the primary map.
pub struct Store {
    state: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    items: HashMap<ObjectKey, Arc<WatchedObject>>,
    indexers: HashMap<String, IndexFn>,
    // index name -> index value -> keys
    indices: HashMap<String, HashMap<String, HashSet<ObjectKey>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        let mut state = StoreState::default();
        state
            .indexers
            .insert(NAMESPACE_INDEX.to_string(), namespace_index());
        state
            .indices
            .insert(NAMESPACE_INDEX.to_string(), HashMap::new());
        Self {
            state: RwLock::new(state),
        }
    }

    /// Create a store with extra indexes on top of the namespace index
    ///
    /// # Errors
    ///
    /// Returns `IndexExists` if an index is named `namespace`.
    pub fn with_indexers(indexers: HashMap<String, IndexFn>) -> Result<Self> {
        let mut store = Self::new();
        {
            let state = store.state.get_mut();
            for (name, index_fn) in indexers {
                if name == NAMESPACE_INDEX {
                    return Err(index_exists_error(&name));
                }
                state.indices.insert(name.clone(), HashMap::new());
                state.indexers.insert(name, index_fn);
            }
        }
        Ok(store)
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<WatchedObject>> {
        self.state.read().await.items.get(key).cloned()
    }

    /// Objects whose `index_name` index produced `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if no index named `index_name` is registered.
    pub async fn list(&self, index_name: &str, value: &str) -> Result<Vec<Arc<WatchedObject>>> {
        let state = self.state.read().await;
        let index = state
            .indices
            .get(index_name)
            .ok_or_else(|| unknown_index_error(index_name))?;

        Ok(index
            .get(value)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.items.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn list_all(&self) -> Vec<Arc<WatchedObject>> {
        self.state.read().await.items.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Register a new index and build it over the current contents before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if an index with the same name already exists.
    pub async fn add_index(&self, name: &str, index_fn: IndexFn) -> Result<()> {
        let mut state = self.state.write().await;
        if state.indexers.contains_key(name) {
            return Err(index_exists_error(name));
        }

        let mut index: HashMap<String, HashSet<ObjectKey>> = HashMap::new();
        for (key, obj) in &state.items {
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        debug!("🗂️  Index {} built over {} objects", name, state.items.len());

        state.indices.insert(name.to_string(), index);
        state.indexers.insert(name.to_string(), index_fn);
        Ok(())
    }

    /// Insert or replace an object.
    ///
    /// Returns `None` when the cached copy already has the same resource version.
    pub(crate) async fn upsert(&self, obj: WatchedObject) -> Option<ChangeNotification> {
        let mut state = self.state.write().await;
        state.upsert(obj)
    }

    /// Remove an object; `None` if it was not cached.
    pub(crate) async fn delete(&self, key: &ObjectKey) -> Option<ChangeNotification> {
        let mut state = self.state.write().await;
        state.remove(key).map(ChangeNotification::Deleted)
    }

    /// Swap in a full listing and return the difference to the previous contents.
    ///
    /// Readers observe either the old set or the new one, never a mix.
    pub(crate) async fn replace(&self, objects: Vec<WatchedObject>) -> Vec<ChangeNotification> {
        let mut state = self.state.write().await;

        let listed: HashSet<ObjectKey> = objects.iter().map(|o| o.key.clone()).collect();
        let vanished: Vec<ObjectKey> = state
            .items
            .keys()
            .filter(|key| !listed.contains(*key))
            .cloned()
            .collect();

        let mut notifications = Vec::new();
        for obj in objects {
            if let Some(n) = state.upsert(obj) {
                notifications.push(n);
            }
        }
        for key in vanished {
            if let Some(last) = state.remove(&key) {
                notifications.push(ChangeNotification::Deleted(last));
            }
        }
        notifications
    }
}

impl StoreState {
    fn upsert(&mut self, obj: WatchedObject) -> Option<ChangeNotification> {
        let key = obj.key.clone();
        let new = Arc::new(obj);

        match self.items.get(&key).cloned() {
            Some(old) if old.resource_version == new.resource_version => None,
            Some(old) => {
                self.unindex(&key, &old);
                self.index(&key, &new);
                self.items.insert(key, new.clone());
                Some(ChangeNotification::Updated { old, new })
            }
            None => {
                self.index(&key, &new);
                self.items.insert(key, new.clone());
                Some(ChangeNotification::Added(new))
            }
        }
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<Arc<WatchedObject>> {
        let old = self.items.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    fn index(&mut self, key: &ObjectKey, obj: &WatchedObject) {
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex(&mut self, key: &ObjectKey, obj: &WatchedObject) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

fn namespace_index() -> IndexFn {
    Arc::new(|obj: &WatchedObject| obj.namespace.iter().cloned().collect())
}

/// Index objects by the value of one label
#[must_use]
pub fn label_index(label: &str) -> IndexFn {
    let label = label.to_string();
    Arc::new(move |obj: &WatchedObject| obj.labels.get(&label).cloned().into_iter().collect())
}
