/**
 * Fans change notifications out to registered handlers
 *
 * The registration list is copy-on-write: `register` publishes a new list and
 * dispatch iterates whatever snapshot it loaded, without holding a lock while
 * handlers run. Queued handlers get a mailbox per object key; the worker pool
 * drains a mailbox in order, one key at a time.
 */
use super::notification::{
    ChangeNotification, DeliveryMode, EventHandler, HandlerError, HandlerId, HandlerResult, WorkKey,
    invoke,
};
use super::queue::WorkQueue;
use super::worker::Processor;
use crate::metrics::InformerMetrics;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, error, warn};

pub struct Registration {
    pub id: HandlerId,
    pub name: String,
    pub mode: DeliveryMode,
    handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub struct Dispatcher {
    informer: String,
    registrations: ArcSwap<Vec<Arc<Registration>>>,
    mailboxes: Mutex<HashMap<WorkKey, VecDeque<ChangeNotification>>>,
    queue: Arc<WorkQueue<WorkKey>>,
    metrics: Arc<InformerMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("informer", &self.informer)
            .field("handlers", &self.registrations.load().len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        informer: &str,
        queue: Arc<WorkQueue<WorkKey>>,
        metrics: Arc<InformerMetrics>,
    ) -> Self {
        Self {
            informer: informer.to_string(),
            registrations: ArcSwap::from_pointee(Vec::new()),
            mailboxes: Mutex::new(HashMap::new()),
            queue,
            metrics,
        }
    }

    /// Append a handler and return its registration
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn EventHandler>,
        mode: DeliveryMode,
    ) -> Arc<Registration> {
        let registration = Arc::new(Registration {
            id: HandlerId::new(),
            name: name.to_string(),
            mode,
            handler,
        });

        self.registrations.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(registration.clone());
            next
        });
        debug!(
            "🔌 Handler {} ({:?}) registered on {}",
            name, mode, self.informer
        );

        registration
    }

    /// Deliver one notification to every registered handler
    pub async fn dispatch(&self, notification: &ChangeNotification) {
        self.metrics.record_event(notification.kind());
        let snapshot = self.registrations.load_full();
        for registration in snapshot.iter() {
            self.deliver(registration, notification.clone()).await;
        }
    }

    /// Deliver to a single handler, honoring its delivery mode
    pub async fn deliver(&self, registration: &Registration, notification: ChangeNotification) {
        match registration.mode {
            DeliveryMode::Inline => {
                let key = notification.key().clone();
                if let Err(e) = self.run_handler(registration, notification).await {
                    self.metrics.processing_errors_total.inc();
                    warn!(
                        "⚠️  Inline handler {} failed for {} on {}: {}",
                        registration.name, key, self.informer, e
                    );
                }
            }
            DeliveryMode::Queued => {
                let work_key = WorkKey {
                    handler: registration.id.clone(),
                    object: notification.key().clone(),
                };
                self.lock_mailboxes()
                    .entry(work_key.clone())
                    .or_default()
                    .push_back(notification);
                self.queue.add(work_key);
            }
        }
    }

    async fn run_handler(
        &self,
        registration: &Registration,
        notification: ChangeNotification,
    ) -> HandlerResult {
        let start = Instant::now();
        let outcome = AssertUnwindSafe(invoke(registration.handler.as_ref(), notification))
            .catch_unwind()
            .await;
        self.metrics.observe_processing(start.elapsed());

        outcome.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic.as_ref()))))
    }

    fn lock_mailboxes(&self) -> MutexGuard<'_, HashMap<WorkKey, VecDeque<ChangeNotification>>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registration(&self, id: &HandlerId) -> Option<Arc<Registration>> {
        self.registrations.load().iter().find(|r| &r.id == id).cloned()
    }

    /// Notifications waiting for queued handlers
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_mailboxes().values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl Processor<WorkKey> for Dispatcher {
    async fn process(&self, key: &WorkKey) -> HandlerResult {
        let Some(registration) = self.registration(&key.handler) else {
            error!("❌ No handler {} registered on {}", key.handler, self.informer);
            self.lock_mailboxes().remove(key);
            return Ok(());
        };

        loop {
            // only this worker pops from this mailbox; dispatch only appends
            let head = self
                .lock_mailboxes()
                .get(key)
                .and_then(|mailbox| mailbox.front().cloned());
            let Some(notification) = head else {
                break;
            };

            self.run_handler(&registration, notification).await?;

            {
                let mut mailboxes = self.lock_mailboxes();
                if let Some(mailbox) = mailboxes.get_mut(key) {
                    mailbox.pop_front();
                    if mailbox.is_empty() {
                        mailboxes.remove(key);
                    }
                }
            }
            // the next notification starts with a fresh retry budget
            self.queue.forget(key);
        }

        Ok(())
    }

    fn abandon(&self, key: &WorkKey) -> bool {
        let mut mailboxes = self.lock_mailboxes();
        let Some(mailbox) = mailboxes.get_mut(key) else {
            return false;
        };
        if let Some(dropped) = mailbox.pop_front() {
            error!(
                "💀 Dropping {} notification for {} on {} after exhausting retries",
                dropped.kind(),
                key.object,
                self.informer
            );
        }
        if mailbox.is_empty() {
            mailboxes.remove(key);
            false
        } else {
            true
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::config::RateLimiterConfig;
    use crate::informer::object::WatchedObject;
    use k8s_openapi::serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_add(&self, obj: Arc<WatchedObject>) -> HandlerResult {
            self.seen.lock().unwrap().push(format!("add {}", obj.key));
            Ok(())
        }

        async fn on_update(
            &self,
            _old: Arc<WatchedObject>,
            new: Arc<WatchedObject>,
        ) -> HandlerResult {
            self.seen.lock().unwrap().push(format!("update {}", new.key));
            Ok(())
        }
    }

    struct Panics;

    #[async_trait]
    impl EventHandler for Panics {
        async fn on_add(&self, _obj: Arc<WatchedObject>) -> HandlerResult {
            panic!("boom");
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<WorkQueue<WorkKey>>, Arc<InformerMetrics>) {
        let queue = Arc::new(WorkQueue::new(RateLimiterConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        }));
        let metrics = Arc::new(InformerMetrics::unregistered("test").unwrap());
        (Dispatcher::new("test", queue.clone(), metrics.clone()), queue, metrics)
    }

    fn added(name: &str, rv: &str) -> ChangeNotification {
        ChangeNotification::Added(Arc::new(WatchedObject::new(Some("ns"), name, rv, json!({}))))
    }

    #[tokio::test]
    async fn test_inline_delivery_runs_immediately() {
        let (dispatcher, queue, metrics) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register("rec", recorder.clone(), DeliveryMode::Inline);

        dispatcher.dispatch(&added("a", "1")).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["add ns/a"]);
        assert!(queue.is_empty());
        assert_eq!(metrics.events(crate::informer::ChangeKind::Added), 1);
    }

    #[tokio::test]
    async fn test_queued_delivery_drains_mailbox_in_order() {
        let (dispatcher, queue, _metrics) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register("rec", recorder.clone(), DeliveryMode::Queued);

        let first = added("a", "1");
        let old = first.object().clone();
        dispatcher.dispatch(&first).await;
        dispatcher
            .dispatch(&ChangeNotification::Updated {
                old,
                new: Arc::new(WatchedObject::new(Some("ns"), "a", "2", json!({}))),
            })
            .await;

        // both notifications collapse into one work item
        assert_eq!(queue.len(), 1);
        assert_eq!(dispatcher.pending(), 2);

        let key = queue.get().await.unwrap();
        dispatcher.process(&key).await.unwrap();
        queue.done(&key);

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["add ns/a", "update ns/a"]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_inline_panic_is_contained() {
        let (dispatcher, _queue, metrics) = dispatcher();
        dispatcher.register("panics", Arc::new(Panics), DeliveryMode::Inline);
        let recorder = Arc::new(Recorder::default());
        dispatcher.register("rec", recorder.clone(), DeliveryMode::Inline);

        dispatcher.dispatch(&added("a", "1")).await;

        assert_eq!(metrics.processing_errors_total.get(), 1);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    /// Fails rv "1" once, then fails rv "2" forever
    #[derive(Default)]
    struct FlakyThenBroken {
        attempts: Mutex<HashMap<String, usize>>,
    }

    impl FlakyThenBroken {
        fn attempts(&self, rv: &str) -> usize {
            self.attempts.lock().unwrap().get(rv).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl EventHandler for FlakyThenBroken {
        async fn on_add(&self, obj: Arc<WatchedObject>) -> HandlerResult {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(obj.resource_version.clone()).or_default();
                *count += 1;
                *count
            };
            match obj.resource_version.as_str() {
                "1" if attempt == 1 => Err(HandlerError::Failed("first try".to_string())),
                "1" => Ok(()),
                _ => Err(HandlerError::Failed("always".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_each_notification_gets_its_own_retry_budget() {
        use crate::informer::worker::WorkerPool;
        use tokio_util::sync::CancellationToken;

        let (dispatcher, queue, metrics) = dispatcher();
        let dispatcher = Arc::new(dispatcher);
        let handler = Arc::new(FlakyThenBroken::default());
        dispatcher.register("flaky", handler.clone(), DeliveryMode::Queued);

        // both notifications wait in one mailbox before any worker runs
        dispatcher.dispatch(&added("a", "1")).await;
        dispatcher.dispatch(&added("a", "2")).await;

        let token = CancellationToken::new();
        let handles = WorkerPool::new(
            "flaky",
            queue.clone(),
            dispatcher.clone(),
            1,
            3,
            metrics.clone(),
        )
        .start(&token);

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.items_dropped_total.get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(handler.attempts("1"), 2);
        assert_eq!(handler.attempts("2"), 4);
        assert_eq!(metrics.processing_errors_total.get(), 5);
        assert_eq!(metrics.items_dropped_total.get(), 1);
        assert_eq!(dispatcher.pending(), 0);

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_abandon_drops_only_the_head() {
        let (dispatcher, queue, _metrics) = dispatcher();
        let registration = dispatcher.register("panics", Arc::new(Panics), DeliveryMode::Queued);

        dispatcher.dispatch(&added("a", "1")).await;
        dispatcher.dispatch(&added("a", "2")).await;

        let key = queue.get().await.unwrap();
        assert_eq!(key.handler, registration.id);
        assert!(dispatcher.process(&key).await.is_err());
        assert!(dispatcher.abandon(&key));
        assert!(!dispatcher.abandon(&key));
        assert_eq!(dispatcher.pending(), 0);
    }
}
