use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
    pub decision: Decision,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MergeLabels {
    pub outcome: MergeOutcomeLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MergeOutcomeLabel {
    Merged,
    Conflict,
    CiFailed,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- gate --
    pub gate_decisions: Family<DecisionLabels, Counter>,

    // -- queue --
    pub merges_total: Family<MergeLabels, Counter>,
    pub merge_duration_seconds: Histogram,
    pub queue_depth: Gauge,
    pub stale_reclaimed_total: Counter,

    // -- lookahead --
    pub lookahead_branches_total: Counter,
    pub lookahead_conflicts_total: Counter,
    pub lookahead_hits_total: Counter,

    // -- leases --
    pub lease_acquisitions: Counter,
    pub lease_waits: Counter,
    pub lease_timeouts: Counter,

    // -- storage sync --
    pub bundle_upload_bytes: Counter,
    pub bundle_download_bytes: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let gate_decisions = Family::<DecisionLabels, Counter>::default();
        registry.register(
            "forgegate_gate_decisions_total",
            "Pre-receive gate decisions by outcome",
            gate_decisions.clone(),
        );

        let merges_total = Family::<MergeLabels, Counter>::default();
        registry.register(
            "forgegate_merges_total",
            "Queue item integrations by outcome",
            merges_total.clone(),
        );

        let merge_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 12));
        registry.register(
            "forgegate_merge_duration_seconds",
            "Queue item integration latency in seconds",
            merge_duration_seconds.clone(),
        );

        let queue_depth: Gauge = Gauge::default();
        registry.register(
            "forgegate_queue_depth",
            "Queued items across all repositories at last drain",
            queue_depth.clone(),
        );

        let stale_reclaimed_total = Counter::default();
        registry.register(
            "forgegate_stale_reclaimed_total",
            "Running items force-failed by the staleness threshold",
            stale_reclaimed_total.clone(),
        );

        let lookahead_branches_total = Counter::default();
        registry.register(
            "forgegate_lookahead_branches_total",
            "Speculative merge branches created",
            lookahead_branches_total.clone(),
        );

        let lookahead_conflicts_total = Counter::default();
        registry.register(
            "forgegate_lookahead_conflicts_total",
            "Speculative chains stopped by a merge conflict",
            lookahead_conflicts_total.clone(),
        );

        let lookahead_hits_total = Counter::default();
        registry.register(
            "forgegate_lookahead_hits_total",
            "Integrations that reused a speculative merge result",
            lookahead_hits_total.clone(),
        );

        let lease_acquisitions = Counter::default();
        registry.register(
            "forgegate_lease_acquisitions_total",
            "Repository lease acquisitions",
            lease_acquisitions.clone(),
        );

        let lease_waits = Counter::default();
        registry.register(
            "forgegate_lease_waits_total",
            "Lease acquisitions that had to wait for another holder",
            lease_waits.clone(),
        );

        let lease_timeouts = Counter::default();
        registry.register(
            "forgegate_lease_timeouts_total",
            "Lease acquisitions that timed out",
            lease_timeouts.clone(),
        );

        let bundle_upload_bytes = Counter::default();
        registry.register(
            "forgegate_bundle_upload_bytes_total",
            "Total bundle bytes synced to blob storage",
            bundle_upload_bytes.clone(),
        );

        let bundle_download_bytes = Counter::default();
        registry.register(
            "forgegate_bundle_download_bytes_total",
            "Total bundle bytes fetched from blob storage",
            bundle_download_bytes.clone(),
        );

        Self {
            gate_decisions,
            merges_total,
            merge_duration_seconds,
            queue_depth,
            stale_reclaimed_total,
            lookahead_branches_total,
            lookahead_conflicts_total,
            lookahead_hits_total,
            lease_acquisitions,
            lease_waits,
            lease_timeouts,
            bundle_upload_bytes,
            bundle_download_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
