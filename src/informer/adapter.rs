//! Source adapters: one lifecycle interface over every kind of event source,
//! producing normalized `Observation` records.
use super::config::OBSERVATION_CHANNEL_CAPACITY;
use super::controller::Informer;
use super::notification::{
    ChangeKind, ChangeNotification, DeliveryMode, EventHandler, HandlerResult,
};
use super::object::{ObjectKey, WatchedObject};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::serde_json::Value;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Crd,
    Webhook,
    Log,
    ConfigMap,
}

impl SourceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crd => "crd",
            Self::Webhook => "webhook",
            Self::Log => "log",
            Self::ConfigMap => "configmap",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceHealth {
    Pending,
    Starting,
    Healthy,
    Degraded(String),
    Stopped,
}

impl SourceHealth {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for SourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Starting => f.write_str("starting"),
            Self::Healthy => f.write_str("healthy"),
            Self::Degraded(reason) => write!(f, "degraded: {reason}"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

/// Canonical record emitted for every observed change, whatever the source
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub source: String,
    pub kind: SourceKind,
    pub change: ChangeKind,
    pub key: ObjectKey,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    pub observed_at: DateTime<Utc>,
    pub payload: Value,
}

impl Observation {
    #[must_use]
    pub fn from_notification(
        source: &str,
        kind: SourceKind,
        notification: &ChangeNotification,
    ) -> Self {
        let obj: &WatchedObject = notification.object();
        Self {
            source: source.to_string(),
            kind,
            change: notification.kind(),
            key: obj.key.clone(),
            namespace: obj.namespace.clone(),
            name: obj.name.clone(),
            resource_version: obj.resource_version.clone(),
            observed_at: obj.observed_at,
            payload: obj.payload.clone(),
        }
    }
}

/// Lifecycle every event source exposes to the manager
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// One-time setup before `start`
    async fn initialize(&self) -> Result<()>;

    /// Begin producing observations. Returns once the source is ready.
    async fn start(&self, token: &CancellationToken) -> Result<()>;

    async fn stop(&self);

    /// Take the observation receiver. Only the first call gets it.
    fn observations(&self) -> Option<mpsc::Receiver<Observation>>;

    fn health(&self) -> SourceHealth;
}

/// `SourceAdapter` over an `Informer`, whatever transport it watches
pub struct InformerAdapter {
    kind: SourceKind,
    informer: Informer,
    tx: mpsc::Sender<Observation>,
    rx: Mutex<Option<mpsc::Receiver<Observation>>>,
    health: Mutex<SourceHealth>,
    initialized: AtomicBool,
}

impl fmt::Debug for InformerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InformerAdapter")
            .field("name", &self.informer.name())
            .field("kind", &self.kind)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl InformerAdapter {
    #[must_use]
    pub fn new(kind: SourceKind, informer: Informer) -> Self {
        Self::with_capacity(kind, informer, OBSERVATION_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(kind: SourceKind, informer: Informer, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            kind,
            informer,
            tx,
            rx: Mutex::new(Some(rx)),
            health: Mutex::new(SourceHealth::Pending),
            initialized: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn informer(&self) -> &Informer {
        &self.informer
    }

    fn set_health(&self, health: SourceHealth) {
        *self.lock_health() = health;
    }

    fn lock_health(&self) -> MutexGuard<'_, SourceHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SourceAdapter for InformerAdapter {
    fn name(&self) -> &str {
        self.informer.name()
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let forwarder = ObservationForwarder {
            source: self.informer.name().to_string(),
            kind: self.kind,
            tx: self.tx.clone(),
        };
        self.informer
            .register("observations", Arc::new(forwarder), DeliveryMode::Queued)
            .await;
        debug!("📡 Source {} ({}) initialized", self.name(), self.kind);
        Ok(())
    }

    async fn start(&self, token: &CancellationToken) -> Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(Error::Custom(format!(
                "source {} started before initialize",
                self.name()
            )));
        }
        self.set_health(SourceHealth::Starting);
        match self.informer.start(token).await {
            Ok(()) => {
                self.set_health(SourceHealth::Healthy);
                info!("📡 Source {} ({}) healthy", self.name(), self.kind);
                Ok(())
            }
            Err(e) => {
                warn!("📡 Source {} failed to start: {}", self.name(), e);
                self.set_health(SourceHealth::Degraded(e.to_string()));
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        self.informer.stop().await;
        self.set_health(SourceHealth::Stopped);
    }

    fn observations(&self) -> Option<mpsc::Receiver<Observation>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn health(&self) -> SourceHealth {
        let health = self.lock_health().clone();
        if health.is_healthy() && self.informer.is_stopped() {
            return SourceHealth::Stopped;
        }
        health
    }
}

/// Queued handler turning notifications into observations
struct ObservationForwarder {
    source: String,
    kind: SourceKind,
    tx: mpsc::Sender<Observation>,
}

impl ObservationForwarder {
    async fn forward(&self, notification: &ChangeNotification) -> HandlerResult {
        let observation = Observation::from_notification(&self.source, self.kind, notification);
        if self.tx.send(observation).await.is_err() {
            // nobody is listening; dropping is the only option
            debug!("No observation consumer for {}", self.source);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ObservationForwarder {
    async fn on_add(&self, obj: Arc<WatchedObject>) -> HandlerResult {
        self.forward(&ChangeNotification::Added(obj)).await
    }

    async fn on_update(&self, old: Arc<WatchedObject>, new: Arc<WatchedObject>) -> HandlerResult {
        self.forward(&ChangeNotification::Updated { old, new }).await
    }

    async fn on_delete(&self, obj: Arc<WatchedObject>) -> HandlerResult {
        self.forward(&ChangeNotification::Deleted(obj)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::{self, json};

    #[test]
    fn test_observation_serializes_flat() {
        let obj = Arc::new(WatchedObject::new(
            Some("security"),
            "report-1",
            "7",
            json!({ "severity": "HIGH" }),
        ));
        let observation = Observation::from_notification(
            "reports",
            SourceKind::ConfigMap,
            &ChangeNotification::Added(obj),
        );
        let value = serde_json::to_value(&observation).unwrap();

        assert_eq!(value["source"], "reports");
        assert_eq!(value["kind"], "configmap");
        assert_eq!(value["change"], "added");
        assert_eq!(value["key"], "security/report-1");
        assert_eq!(value["resource_version"], "7");
        assert_eq!(value["payload"]["severity"], "HIGH");
    }

    #[test]
    fn test_health_display() {
        assert_eq!(SourceHealth::Degraded("no list".into()).to_string(), "degraded: no list");
        assert!(SourceHealth::Healthy.is_healthy());
        assert!(!SourceHealth::Starting.is_healthy());
    }
}
