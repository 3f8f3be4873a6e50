//! Prometheus instrumentation for informers.
//!
//! Nothing here is global: the caller owns the `Registry` and hands each
//! informer its own `InformerMetrics`, labelled with the informer name.
use crate::error::{Error, Result};
use crate::informer::ChangeKind;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, exponential_buckets,
};
use std::time::Duration;

const INFORMER_LABEL: &str = "informer";

#[derive(Debug, Clone)]
pub struct InformerMetrics {
    pub cache_size: IntGauge,
    pub queue_depth: IntGauge,
    pub events_total: IntCounterVec,
    pub processing_duration_seconds: Histogram,
    pub processing_errors_total: IntCounter,
    pub resync_count_total: IntCounter,
    pub items_dropped_total: IntCounter,
    pub watch_restarts_total: IntCounter,
}

impl InformerMetrics {
    /// Create the metric set for informer `name` and register it.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric with the same name and `informer` label is
    /// already registered.
    pub fn new(registry: &Registry, name: &str) -> Result<Self> {
        let opts =
            |metric: &str, help: &str| Opts::new(metric, help).const_label(INFORMER_LABEL, name);

        let metrics = Self {
            cache_size: IntGauge::with_opts(opts(
                "informer_cache_size",
                "Number of objects held in the informer cache",
            ))?,
            queue_depth: IntGauge::with_opts(opts(
                "informer_queue_depth",
                "Number of work items waiting to be processed",
            ))?,
            events_total: IntCounterVec::new(
                opts("informer_events_total", "Change notifications dispatched, by type"),
                &["type"],
            )?,
            processing_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "informer_processing_duration_seconds",
                    "Time spent in handler callbacks",
                )
                .const_label(INFORMER_LABEL, name)
                .buckets(exponential_buckets(0.000_5, 2.0, 16)?),
            )?,
            processing_errors_total: IntCounter::with_opts(opts(
                "informer_processing_errors_total",
                "Handler invocations that returned an error or panicked",
            ))?,
            resync_count_total: IntCounter::with_opts(opts(
                "informer_resync_count_total",
                "Full re-lists performed after the initial sync",
            ))?,
            items_dropped_total: IntCounter::with_opts(opts(
                "informer_items_dropped_total",
                "Work items abandoned after exhausting their retries",
            ))?,
            watch_restarts_total: IntCounter::with_opts(opts(
                "informer_watch_restarts_total",
                "Watch streams that disconnected and had to be re-established",
            ))?,
        };

        registry.register(Box::new(metrics.cache_size.clone()))?;
        registry.register(Box::new(metrics.queue_depth.clone()))?;
        registry.register(Box::new(metrics.events_total.clone()))?;
        registry.register(Box::new(metrics.processing_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.processing_errors_total.clone()))?;
        registry.register(Box::new(metrics.resync_count_total.clone()))?;
        registry.register(Box::new(metrics.items_dropped_total.clone()))?;
        registry.register(Box::new(metrics.watch_restarts_total.clone()))?;

        Ok(metrics)
    }

    /// Metrics that are not attached to any registry, handy for tests
    ///
    /// # Errors
    ///
    /// Returns an error if a metric cannot be constructed.
    pub fn unregistered(name: &str) -> Result<Self> {
        Self::new(&Registry::new(), name)
    }

    pub fn record_event(&self, kind: ChangeKind) {
        self.events_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn observe_processing(&self, elapsed: Duration) {
        self.processing_duration_seconds.observe(elapsed.as_secs_f64());
    }

    pub fn set_cache_size(&self, size: usize) {
        self.cache_size.set(i64::try_from(size).unwrap_or(i64::MAX));
    }

    #[must_use]
    pub fn events(&self, kind: ChangeKind) -> u64 {
        self.events_total.with_label_values(&[kind.as_str()]).get()
    }
}

/// Render everything in `registry` in the Prometheus text format
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Custom(format!("metrics are not utf-8: {e}")))
}
