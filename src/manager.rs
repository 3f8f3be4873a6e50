/**
Source manager

Owns the metrics registry, the root cancellation token and every registered
source adapter. Sources are started in registration order and stopped together.
*/
use crate::error::{Error, Result};
use crate::informer::{Observation, SourceAdapter, SourceHealth, SourceKind};
use crate::metrics::{self, InformerMetrics};
use prometheus::Registry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Point-in-time status of one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: String,
    pub kind: SourceKind,
    pub health: SourceHealth,
}

pub struct SourceManager {
    registry: Registry,
    token: CancellationToken,
    sources: Vec<Arc<dyn SourceAdapter>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceManager")
            .field("sources", &self.sources.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SourceManager {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl SourceManager {
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            token: CancellationToken::new(),
            sources: Vec::new(),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Token cancelled by `shutdown`; informers started by the manager stop with it
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Create and register the metric set for a new informer
    ///
    /// # Errors
    ///
    /// Returns an error if an informer with the same name already registered metrics.
    pub fn informer_metrics(&self, name: &str) -> Result<Arc<InformerMetrics>> {
        Ok(Arc::new(InformerMetrics::new(&self.registry, name)?))
    }

    /// Register a source. Names must be unique.
    ///
    /// # Errors
    ///
    /// Returns an error if a source with the same name is already registered.
    pub fn add(&mut self, source: Arc<dyn SourceAdapter>) -> Result<()> {
        if self.sources.iter().any(|s| s.name() == source.name()) {
            return Err(Error::Custom(format!(
                "source {} already registered",
                source.name()
            )));
        }
        info!("➕ Source {} ({}) registered", source.name(), source.kind());
        self.sources.push(source);
        Ok(())
    }

    #[must_use]
    pub fn sources(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.sources
    }

    /// Observation receivers of every source that still has one
    pub fn take_observations(&self) -> Vec<mpsc::Receiver<Observation>> {
        self.sources.iter().filter_map(|s| s.observations()).collect()
    }

    /// Initialize and start every source in order.
    ///
    /// # Errors
    ///
    /// Returns the first initialization or start failure. Sources started
    /// before it keep running until `shutdown`.
    pub async fn start_all(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        for source in &self.sources {
            source.initialize().await?;
            if let Err(e) = source.start(&self.token).await {
                error!("❌ Source {} failed to start: {}", source.name(), e);
                return Err(e);
            }
        }
        info!("✅ {} sources running", self.sources.len());
        Ok(())
    }

    #[must_use]
    pub fn health(&self) -> Vec<SourceStatus> {
        self.sources
            .iter()
            .map(|s| SourceStatus {
                name: s.name().to_string(),
                kind: s.kind(),
                health: s.health(),
            })
            .collect()
    }

    /// Stop every source. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 Shutting down {} sources", self.sources.len());
        futures::future::join_all(self.sources.iter().map(|s| s.stop())).await;
        self.token.cancel();
    }

    /// Everything in the registry, in the Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn render_metrics(&self) -> Result<String> {
        metrics::render(&self.registry)
    }
}
