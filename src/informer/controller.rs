/**
 * Informer: list, watch, resync and restart over a `WatchSource`
 *
 * `start` performs the initial list, attaches the watch and only then returns,
 * leaving a background loop that applies watch events to the store, forces a
 * re-list on the resync timer, and re-lists and re-attaches whenever the watch
 * breaks. Every store mutation and the dispatch that follows it happen under one
 * mutation lock, so handlers see per-key changes in order and the cache already
 * reflects a change when its notification is delivered.
 */
use super::backoff::Backoff;
use super::config::InformerConfig;
use super::dispatcher::{Dispatcher, Registration};
use super::errors::{already_started_error, initial_sync_error};
use super::notification::{ChangeNotification, DeliveryMode, EventHandler, WorkKey};
use super::object::{ObjectKey, WatchedObject};
use super::queue::WorkQueue;
use super::source::{WatchEvent, WatchSource, WatchStream};
use super::store::{IndexFn, Store};
use super::worker::{Processor, WorkerPool};
use crate::error::{Error, Result};
use crate::metrics::InformerMetrics;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle to a running (or not yet started) informer. Cheap to clone.
#[derive(Clone)]
pub struct Informer {
    shared: Arc<Shared>,
}

struct Shared {
    config: InformerConfig,
    source: Arc<dyn WatchSource>,
    store: Store,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<WorkQueue<WorkKey>>,
    metrics: Arc<InformerMetrics>,
    synced: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    resync: Notify,
    // serializes store mutation + dispatch against handler registration
    mutation: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum Step {
    Event(WatchEvent),
    Resync(&'static str),
    Restart(Option<Error>),
    Shutdown,
}

impl std::fmt::Debug for Informer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("name", &self.shared.config.name)
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl Informer {
    #[must_use]
    pub fn new(
        source: Arc<dyn WatchSource>,
        config: InformerConfig,
        metrics: Arc<InformerMetrics>,
    ) -> Self {
        Self::build(source, config, metrics, Store::new())
    }

    /// Create an informer whose store maintains `indexers` in addition to the
    /// namespace index
    ///
    /// # Errors
    ///
    /// Returns `IndexExists` if one of `indexers` is named `namespace`.
    pub fn with_indexers(
        source: Arc<dyn WatchSource>,
        config: InformerConfig,
        metrics: Arc<InformerMetrics>,
        indexers: HashMap<String, IndexFn>,
    ) -> Result<Self> {
        let store = Store::with_indexers(indexers)?;
        Ok(Self::build(source, config, metrics, store))
    }

    fn build(
        source: Arc<dyn WatchSource>,
        config: InformerConfig,
        metrics: Arc<InformerMetrics>,
        store: Store,
    ) -> Self {
        let queue = Arc::new(
            WorkQueue::new(config.rate_limiter).with_depth_gauge(metrics.queue_depth.clone()),
        );
        let dispatcher = Arc::new(Dispatcher::new(&config.name, queue.clone(), metrics.clone()));

        Self {
            shared: Arc::new(Shared {
                store,
                source,
                dispatcher,
                queue,
                metrics,
                synced: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                resync: Notify::new(),
                mutation: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    #[must_use]
    pub fn config(&self) -> &InformerConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<InformerMetrics> {
        &self.shared.metrics
    }

    /// Read access to the cache
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    pub async fn get(&self, key: &ObjectKey) -> Option<Arc<WatchedObject>> {
        self.shared.store.get(key).await
    }

    /// # Errors
    ///
    /// Returns an error if `index_name` is not registered.
    pub async fn list(&self, index_name: &str, value: &str) -> Result<Vec<Arc<WatchedObject>>> {
        self.shared.store.list(index_name, value).await
    }

    pub async fn list_all(&self) -> Vec<Arc<WatchedObject>> {
        self.shared.store.list_all().await
    }

    /// Add an index; existing objects are indexed before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if an index with the same name exists.
    pub async fn add_index(&self, name: &str, index_fn: IndexFn) -> Result<()> {
        let _guard = self.shared.mutation.lock().await;
        self.shared.store.add_index(name, index_fn).await
    }

    /// Register a handler.
    ///
    /// A handler added while objects are already cached first receives an
    /// `Added` notification for each of them, before any later change.
    /// Inline handlers must not call back into `register`.
    pub async fn register(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
        mode: DeliveryMode,
    ) -> Arc<Registration> {
        let _guard = self.shared.mutation.lock().await;
        let registration = self.shared.dispatcher.register(name, handler, mode);

        let cached = self.shared.store.list_all().await;
        if !cached.is_empty() {
            debug!(
                "🔁 Replaying {} cached objects to late handler {} on {}",
                cached.len(),
                name,
                self.name()
            );
        }
        for obj in cached {
            self.shared
                .dispatcher
                .deliver(&registration, ChangeNotification::Added(obj))
                .await;
        }

        registration
    }

    /// True once the initial list is cached and the watch is attached. Never reverts.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.shared.synced.load(Ordering::Acquire)
    }

    /// Ask the watch loop for an immediate full re-list
    pub fn request_resync(&self) {
        self.shared.resync.notify_one();
    }

    /// Queued work not yet completed: waiting keys, keys being processed and
    /// undelivered notifications
    #[must_use]
    pub fn pending_work(&self) -> usize {
        self.shared.queue.len() + self.shared.queue.processing() + self.shared.dispatcher.pending()
    }

    /// Start workers, perform the initial sync and attach the watch.
    ///
    /// Returns once the informer has synced. Cancelling `token` stops the
    /// informer, both during start-up and afterwards.
    ///
    /// # Errors
    ///
    /// Returns `InitialSync` if the first list fails, `Cancelled` if `token` is
    /// cancelled before the sync completes, and `AlreadyStarted` on a second call.
    pub async fn start(&self, token: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(already_started_error(&shared.config.name));
        }
        if shared.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!(
            "🚀 Starting informer {} ({} workers, resync {:?})",
            shared.config.name, shared.config.worker_count, shared.config.resync_period
        );

        let processor: Arc<dyn Processor<WorkKey>> = shared.dispatcher.clone();
        let workers = WorkerPool::new(
            &shared.config.name,
            shared.queue.clone(),
            processor,
            shared.config.worker_count,
            shared.config.max_retries,
            shared.metrics.clone(),
        )
        .start(&shared.shutdown);
        shared.lock_tasks().extend(workers);
        self.link(token);

        let mut backoff = Backoff::new(shared.config.watch_backoff);
        let stream = match shared.initial_sync(&mut backoff).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("❌ Informer {} failed to sync: {}", shared.config.name, e);
                self.stop().await;
                return Err(e);
            }
        };

        shared.synced.store(true, Ordering::Release);
        info!(
            "✅ Informer {} synced with {} objects",
            shared.config.name,
            shared.store.len().await
        );

        let run = tokio::spawn(shared.clone().run(stream, backoff));
        shared.lock_tasks().push(run);
        Ok(())
    }

    /// Stop on external cancellation
    fn link(&self, token: &CancellationToken) {
        let informer = self.clone();
        let external = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = external.cancelled() => informer.stop().await,
                () = informer.shared.shutdown.cancelled() => {}
            }
        });
    }

    /// Stop the watch loop and workers. Idempotent.
    ///
    /// Tasks get the configured grace period to finish the item they hold and
    /// are aborted after that.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 Stopping informer {}", shared.config.name);
        shared.shutdown.cancel();
        shared.queue.shut_down();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *shared.lock_tasks());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let grace = shared.config.stop_grace_period;
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                "⏱️  Informer {} tasks did not finish within {:?}, aborting",
                shared.config.name, grace
            );
            for handle in aborts {
                handle.abort();
            }
        }
        debug!("🛑 Informer {} stopped", shared.config.name);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl Shared {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `fut` unless shutdown comes first
    async fn until_shutdown<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// First list plus watch attach. A failed list is fatal; a failed attach is
    /// retried with backoff.
    async fn initial_sync(&self, backoff: &mut Backoff) -> Result<WatchStream> {
        let (resource_version, count) = match self.relist().await {
            Ok(listed) => listed,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Err(initial_sync_error(e)),
        };
        debug!(
            "📥 Informer {} listed {} changes at version {}",
            self.config.name, count, resource_version
        );

        loop {
            let attached = self
                .until_shutdown(self.source.watch(&self.config.selector, &resource_version))
                .await
                .ok_or(Error::Cancelled)?;
            match attached {
                Ok(stream) => {
                    backoff.reset();
                    return Ok(stream);
                }
                Err(Error::Expired(rv)) => {
                    warn!(
                        "⌛ Informer {} version {} expired before the watch attached",
                        self.config.name, rv
                    );
                    return self.relist_and_watch(backoff).await.ok_or(Error::Cancelled);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "🔄 Informer {} watch attach failed, retrying in {:?}: {}",
                        self.config.name, delay, e
                    );
                    self.until_shutdown(tokio::time::sleep(delay))
                        .await
                        .ok_or(Error::Cancelled)?;
                }
            }
        }
    }

    async fn run(self: Arc<Self>, mut stream: WatchStream, mut backoff: Backoff) {
        let mut timer = resync_timer(&self.config);

        loop {
            let step = tokio::select! {
                () = self.shutdown.cancelled() => Step::Shutdown,
                () = self.resync.notified() => Step::Resync("requested"),
                () = tick(timer.as_mut()) => Step::Resync("periodic"),
                event = stream.next() => match event {
                    Some(Ok(event)) => Step::Event(event),
                    Some(Err(e)) => Step::Restart(Some(e)),
                    None => Step::Restart(None),
                },
            };

            match step {
                Step::Shutdown => break,
                Step::Event(event) => {
                    self.apply(event).await;
                    continue;
                }
                Step::Resync(reason) => {
                    info!("🔄 Informer {} {} resync", self.config.name, reason);
                }
                Step::Restart(cause) => {
                    self.metrics.watch_restarts_total.inc();
                    match cause {
                        Some(e) => {
                            warn!("⚠️  Informer {} watch failed: {}", self.config.name, e);
                        }
                        None => debug!("Informer {} watch closed by server", self.config.name),
                    }
                }
            }

            match self.relist_and_watch(&mut backoff).await {
                Some(next) => stream = next,
                None => break,
            }
        }

        debug!("Informer {} watch loop exited", self.config.name);
    }

    /// Re-list and re-attach until both succeed. `None` once shutting down.
    async fn relist_and_watch(&self, backoff: &mut Backoff) -> Option<WatchStream> {
        loop {
            match self.relist().await {
                Ok((resource_version, changes)) => {
                    self.metrics.resync_count_total.inc();
                    debug!(
                        "📥 Informer {} re-listed at version {} with {} changes",
                        self.config.name, resource_version, changes
                    );
                    let attached = self
                        .until_shutdown(self.source.watch(&self.config.selector, &resource_version))
                        .await?;
                    match attached {
                        Ok(stream) => {
                            backoff.reset();
                            return Some(stream);
                        }
                        Err(e) => {
                            warn!(
                                "⚠️  Informer {} watch attach failed: {}",
                                self.config.name, e
                            );
                        }
                    }
                }
                Err(Error::Cancelled) => return None,
                Err(e) if e.is_transient() => {
                    warn!("⚠️  Informer {} re-list failed: {}", self.config.name, e);
                }
                Err(e) => error!("❌ Informer {} re-list failed: {}", self.config.name, e),
            }

            let delay = backoff.next_delay();
            debug!(
                "Informer {} recovering in {:?} (attempt {})",
                self.config.name,
                delay,
                backoff.attempts()
            );
            self.until_shutdown(tokio::time::sleep(delay)).await?;
        }
    }

    /// Replace the store with a full listing and dispatch the difference.
    /// Returns the list version and how many notifications it produced.
    ///
    /// Only the list call gives way to shutdown. Once the store is replaced,
    /// every resulting notification is dispatched.
    async fn relist(&self) -> Result<(String, usize)> {
        let listed = self
            .until_shutdown(self.source.list(&self.config.selector))
            .await
            .ok_or(Error::Cancelled)??;

        let _guard = self.mutation.lock().await;
        let notifications = self.store.replace(listed.items).await;
        self.metrics.set_cache_size(self.store.len().await);
        for notification in &notifications {
            self.dispatcher.dispatch(notification).await;
        }

        Ok((listed.resource_version, notifications.len()))
    }

    async fn apply(&self, event: WatchEvent) {
        let _guard = self.mutation.lock().await;
        let notification = match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.store.upsert(obj).await,
            WatchEvent::Deleted(obj) => self.store.delete(&obj.key).await,
            WatchEvent::Bookmark(rv) => {
                debug!("🔖 Informer {} bookmark at {}", self.config.name, rv);
                return;
            }
        };
        self.metrics.set_cache_size(self.store.len().await);

        if let Some(notification) = notification {
            self.dispatcher.dispatch(&notification).await;
        }
    }
}

fn resync_timer(config: &InformerConfig) -> Option<Interval> {
    let period = config.resync_period;
    if period.is_zero() {
        return None;
    }
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(timer)
}

async fn tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
