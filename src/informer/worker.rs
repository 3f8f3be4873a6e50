use super::notification::{HandlerError, HandlerResult};
use super::queue::WorkQueue;
use crate::metrics::InformerMetrics;
use async_trait::async_trait;
use futures::FutureExt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work performed for a queue key
#[async_trait]
pub trait Processor<K>: Send + Sync {
    async fn process(&self, key: &K) -> HandlerResult;

    /// Called when `key` ran out of retries. Returns `true` if the key still has
    /// work left and should be queued again.
    fn abandon(&self, _key: &K) -> bool {
        false
    }
}

/// N consumers draining one `WorkQueue`
pub struct WorkerPool<K> {
    name: String,
    queue: Arc<WorkQueue<K>>,
    processor: Arc<dyn Processor<K>>,
    worker_count: usize,
    max_retries: u32,
    metrics: Arc<InformerMetrics>,
}

impl<K> std::fmt::Debug for WorkerPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<K> WorkerPool<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
{
    #[must_use]
    pub fn new(
        name: &str,
        queue: Arc<WorkQueue<K>>,
        processor: Arc<dyn Processor<K>>,
        worker_count: usize,
        max_retries: u32,
        metrics: Arc<InformerMetrics>,
    ) -> Self {
        Self {
            name: name.to_string(),
            queue,
            processor,
            worker_count: worker_count.max(1),
            max_retries,
            metrics,
        }
    }

    /// Spawn the workers. They exit when `token` is cancelled or the queue shuts
    /// down, after finishing the item they hold.
    #[must_use]
    pub fn start(self, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!("👷 Starting {} workers for {}", self.worker_count, self.name);
        let pool = Arc::new(self);
        (0..pool.worker_count)
            .map(|id| {
                let pool = pool.clone();
                let token = token.clone();
                tokio::spawn(async move { pool.run_worker(id, token).await })
            })
            .collect()
    }

    async fn run_worker(&self, id: usize, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                () = token.cancelled() => None,
                key = self.queue.get() => key,
            };
            let Some(key) = next else {
                break;
            };
            self.process_item(key).await;
        }
        debug!("👷 Worker {} for {} stopped", id, self.name);
    }

    /// Run the processor for one key and apply the retry policy
    pub async fn process_item(&self, key: K) {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.processor.process(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Panicked(format!("processing {key}"))));

        let mut requeue = false;
        match outcome {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                self.metrics.processing_errors_total.inc();
                let requeues = self.queue.num_requeues(&key);
                if requeues < self.max_retries {
                    warn!(
                        "🔄 {} failed for {} (retry {}/{}): {}",
                        self.name,
                        key,
                        requeues + 1,
                        self.max_retries,
                        e
                    );
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        "💀 {} giving up on {} after {} attempts: {}",
                        self.name,
                        key,
                        requeues + 1,
                        e
                    );
                    self.metrics.items_dropped_total.inc();
                    self.queue.forget(&key);
                    requeue = self.processor.abandon(&key);
                }
            }
        }
        debug!("{} processed {} in {:?}", self.name, key, start.elapsed());

        self.queue.done(&key);
        if requeue {
            self.queue.add(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::config::RateLimiterConfig;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct AlwaysFails {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Processor<String> for AlwaysFails {
        async fn process(&self, _key: &String) -> HandlerResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::Failed("nope".to_string()))
        }
    }

    /// Fails if two invocations for the same key overlap
    #[derive(Default)]
    struct OverlapDetector {
        in_flight: Mutex<HashSet<String>>,
        overlaps: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor<String> for OverlapDetector {
        async fn process(&self, key: &String) -> HandlerResult {
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.lock().unwrap().remove(key);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor<String> for PanicsOnce {
        async fn process(&self, _key: &String) -> HandlerResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first call explodes");
            }
            Ok(())
        }
    }

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new(RateLimiterConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }))
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_retry_ceiling_then_drop() {
        let q = queue();
        let metrics = Arc::new(InformerMetrics::unregistered("test").unwrap());
        let processor = Arc::new(AlwaysFails {
            attempts: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new("test", q.clone(), processor.clone(), 2, 3, metrics.clone());
        let token = CancellationToken::new();
        let handles = pool.start(&token);

        q.add("ns/a".to_string());
        wait_for(|| metrics.items_dropped_total.get() == 1).await;

        // one initial attempt plus three retries
        assert_eq!(processor.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.processing_errors_total.get(), 4);
        assert_eq!(q.num_requeues(&"ns/a".to_string()), 0);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_never_two_in_flight_for_one_key() {
        let q = queue();
        let metrics = Arc::new(InformerMetrics::unregistered("test").unwrap());
        let processor = Arc::new(OverlapDetector::default());
        let pool = WorkerPool::new("test", q.clone(), processor.clone(), 8, 3, metrics);
        let token = CancellationToken::new();
        let handles = pool.start(&token);

        for _ in 0..50 {
            q.add("ns/hot".to_string());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wait_for(|| q.is_empty() && q.processing() == 0).await;

        assert_eq!(processor.overlaps.load(Ordering::SeqCst), 0);
        assert!(processor.calls.load(Ordering::SeqCst) >= 1);

        q.shut_down();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_panic_is_retried_not_fatal() {
        let q = queue();
        let metrics = Arc::new(InformerMetrics::unregistered("test").unwrap());
        let processor = Arc::new(PanicsOnce {
            calls: AtomicUsize::new(0),
        });
        let pool = WorkerPool::new("test", q.clone(), processor.clone(), 1, 3, metrics.clone());
        let token = CancellationToken::new();
        let handles = pool.start(&token);

        q.add("ns/a".to_string());
        wait_for(|| processor.calls.load(Ordering::SeqCst) == 2).await;
        wait_for(|| q.processing() == 0).await;

        assert_eq!(metrics.processing_errors_total.get(), 1);
        assert_eq!(metrics.items_dropped_total.get(), 0);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
