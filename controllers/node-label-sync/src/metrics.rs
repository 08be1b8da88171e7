//! Prometheus metrics for the label sync controller.
//!
//! ## Metrics
//! - `node_label_sync_reconciliations_total{kind, outcome}` - Counter of processed queue keys
//! - `node_label_sync_reconcile_duration_seconds{kind}` - Histogram of per-key sync time
//! - `node_label_sync_pod_updates_total{outcome}` - Counter of pod label writes
//! - `node_label_sync_queue_depth{kind}` - Gauge of keys waiting in each work queue
//!
//! All labels are bounded: `kind` is "Pod" or "Node", `outcome` is
//! "success", "error" or "dropped".

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, proto::MetricFamily};
use std::sync::Arc;
use std::time::Duration;

/// Outcome label for a processed key or a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    /// Key could never succeed and was not retried
    Dropped,
}

impl Outcome {
    fn as_label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Dropped => "dropped",
        }
    }
}

/// Metrics handle, cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    pod_updates: IntCounterVec,
    queue_depth: IntGaugeVec,
    registry: Arc<Registry>,
}

impl Metrics {
    /// Create the metrics and register them with `registry`.
    pub fn new_with_registry(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Total number of processed reconcile keys")
                .namespace("node_label_sync"),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(reconciliations.clone()))?;

        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Time spent syncing one key")
                .namespace("node_label_sync")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["kind"],
        )?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        let pod_updates = IntCounterVec::new(
            Opts::new("pod_updates_total", "Total number of pod label writes").namespace("node_label_sync"),
            &["outcome"],
        )?;
        registry.register(Box::new(pod_updates.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Keys waiting in the work queue").namespace("node_label_sync"),
            &["kind"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            reconciliations,
            reconcile_duration,
            pod_updates,
            queue_depth,
            registry,
        })
    }

    /// Create the metrics with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::new_with_registry(Arc::new(Registry::new()))
    }

    pub fn record_reconcile(&self, kind: &str, outcome: Outcome, elapsed: Duration) {
        self.reconciliations
            .with_label_values(&[kind, outcome.as_label()])
            .inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_pod_update(&self, outcome: Outcome) {
        self.pod_updates.with_label_values(&[outcome.as_label()]).inc();
    }

    pub fn set_queue_depth(&self, kind: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[kind])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Gather all metrics for exposition.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    #[cfg(test)]
    pub(crate) fn queue_depth(&self, kind: &str) -> i64 {
        self.queue_depth.with_label_values(&[kind]).get()
    }
}
