/**
 * Rate-limited, deduplicating work queue
 *
 * A key is in at most one of three places: queued, processing, or neither.
 * Adding a key that is already queued is a no-op; adding a key that is being
 * processed marks it dirty so it is queued again once `done` is called.
 */
use super::config::RateLimiterConfig;
use prometheus::IntGauge;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    rate_limiter: RateLimiterConfig,
    shutdown: CancellationToken,
    depth: Option<IntGauge>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    // queued or waiting to be re-queued after processing
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
        }
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("rate_limiter", &self.rate_limiter)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
{
    #[must_use]
    pub fn new(rate_limiter: RateLimiterConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
            shutdown: CancellationToken::new(),
            depth: None,
        }
    }

    /// Report the number of queued keys through `gauge`
    #[must_use]
    pub fn with_depth_gauge(mut self, gauge: IntGauge) -> Self {
        self.depth = Some(gauge);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_depth(&self, state: &QueueState<K>) {
        if let Some(gauge) = &self.depth {
            gauge.set(i64::try_from(state.queue.len()).unwrap_or(i64::MAX));
        }
    }

    /// Mark `key` as needing processing. Ignored after shutdown.
    pub fn add(&self, key: K) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut state = self.lock();
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            // picked up again by `done`
            return;
        }
        state.queue.push_back(key);
        self.update_depth(&state);
        drop(state);

        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls `done`.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.update_depth(&state);
                    return Some(key);
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Release a key obtained from `get`
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !self.shutdown.is_cancelled() {
            state.queue.push_back(key.clone());
            self.update_depth(&state);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` after its per-key backoff, then grow that backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        debug!("⏳ Requeue {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key),
                () = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Clear the backoff history for `key`
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    /// How many times `key` went through `add_rate_limited` since the last `forget`
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be picked up
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Keys currently handed out by `get`
    pub fn processing(&self) -> usize {
        self.lock().processing.len()
    }

    /// Wake every waiter and make `get` return `None` from now on
    pub fn shut_down(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1_u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.rate_limiter
            .base_delay
            .saturating_mul(factor)
            .min(self.rate_limiter.max_delay)
    }
}
