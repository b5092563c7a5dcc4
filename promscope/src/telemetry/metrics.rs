//! Service metrics.
//!
//! All families are registered once into a process-wide registry under the
//! `promscope` prefix and encoded in OpenMetrics text format for the
//! `GET /metrics` endpoint.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::text::{encode, Encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::register);

/// Labels of proxied request counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Encode)]
pub struct ProxyLabels {
    /// Intercepted endpoint (`query`, `query_range`) or `passthrough`.
    pub endpoint: String,
    /// Upstream HTTP status code.
    pub status: String,
}

/// Outcome label used by flush/run counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Encode)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl OutcomeLabels {
    pub fn ok() -> Self {
        Self {
            outcome: "ok".into(),
        }
    }

    pub fn error() -> Self {
        Self {
            outcome: "error".into(),
        }
    }
}

/// Labels of syncer step failure counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Encode)]
pub struct StepLabels {
    pub step: String,
}

/// All service metric families.
pub struct Metrics {
    /// Proxied requests by endpoint and upstream status.
    pub proxy_requests: Family<ProxyLabels, Counter>,
    /// Upstream forwarding failures.
    pub proxy_upstream_errors: Counter,

    /// Records accepted into the ingestion queue.
    pub ingest_enqueued: Counter,
    /// Records rejected with backpressure or validation errors.
    pub ingest_rejected: Counter,
    /// Records dropped at shutdown after the grace period expired.
    pub ingest_dropped: Counter,
    /// Batch flushes by outcome.
    pub ingest_flushes: Family<OutcomeLabels, Counter>,
    /// Rows successfully written by the batch flusher.
    pub ingest_flushed_rows: Counter,
    /// Current depth of the ingestion queue.
    pub ingest_queue_depth: Gauge<i64, AtomicI64>,

    /// Syncer runs by outcome.
    pub syncer_runs: Family<OutcomeLabels, Counter>,
    /// Syncer step failures by step.
    pub syncer_step_failures: Family<StepLabels, Counter>,
    /// Size of the job index produced by the last successful run.
    pub syncer_job_index_pairs: Gauge<i64, AtomicI64>,

    /// OTLP export requests received.
    pub otlp_requests: Counter,
    /// Data points seen in inbound OTLP requests.
    pub otlp_datapoints_received: Counter,
    /// Data points removed (or counted in dry-run) by the filter.
    pub otlp_datapoints_dropped: Counter,
    /// Metrics removed (or counted in dry-run) by the filter.
    pub otlp_metrics_dropped: Counter,
    /// Catalog lookups that failed, cancelling drop decisions.
    pub otlp_lookup_failures: Counter,
    /// Downstream export retries after UNAVAILABLE.
    pub otlp_downstream_retries: Counter,
    /// Downstream exports that ultimately failed.
    pub otlp_downstream_failures: Counter,

    /// Observations dropped because the catalog buffer was full.
    pub catalog_buffer_dropped: Counter,
    /// Catalog flushes by outcome.
    pub catalog_flushes: Family<OutcomeLabels, Counter>,
    /// Seen-set store operations that failed.
    pub catalog_seen_store_errors: Counter,
}

impl Metrics {
    fn register() -> Self {
        let mut registry = REGISTRY.write();
        let registry = registry.sub_registry_with_prefix("promscope");

        let metrics = Self {
            proxy_requests: Family::default(),
            proxy_upstream_errors: Counter::default(),
            ingest_enqueued: Counter::default(),
            ingest_rejected: Counter::default(),
            ingest_dropped: Counter::default(),
            ingest_flushes: Family::default(),
            ingest_flushed_rows: Counter::default(),
            ingest_queue_depth: Gauge::default(),
            syncer_runs: Family::default(),
            syncer_step_failures: Family::default(),
            syncer_job_index_pairs: Gauge::default(),
            otlp_requests: Counter::default(),
            otlp_datapoints_received: Counter::default(),
            otlp_datapoints_dropped: Counter::default(),
            otlp_metrics_dropped: Counter::default(),
            otlp_lookup_failures: Counter::default(),
            otlp_downstream_retries: Counter::default(),
            otlp_downstream_failures: Counter::default(),
            catalog_buffer_dropped: Counter::default(),
            catalog_flushes: Family::default(),
            catalog_seen_store_errors: Counter::default(),
        };

        registry.register(
            "proxy_requests",
            "Proxied requests by endpoint and upstream status",
            metrics.proxy_requests.clone(),
        );
        registry.register(
            "proxy_upstream_errors",
            "Upstream forwarding failures",
            metrics.proxy_upstream_errors.clone(),
        );
        registry.register(
            "ingest_enqueued",
            "Records accepted into the ingestion queue",
            metrics.ingest_enqueued.clone(),
        );
        registry.register(
            "ingest_rejected",
            "Records rejected with backpressure or validation errors",
            metrics.ingest_rejected.clone(),
        );
        registry.register(
            "ingest_dropped",
            "Records dropped at shutdown after the grace period expired",
            metrics.ingest_dropped.clone(),
        );
        registry.register(
            "ingest_flushes",
            "Batch flushes by outcome",
            metrics.ingest_flushes.clone(),
        );
        registry.register(
            "ingest_flushed_rows",
            "Rows successfully written by the batch flusher",
            metrics.ingest_flushed_rows.clone(),
        );
        registry.register(
            "ingest_queue_depth",
            "Current depth of the ingestion queue",
            metrics.ingest_queue_depth.clone(),
        );
        registry.register(
            "syncer_runs",
            "Syncer runs by outcome",
            metrics.syncer_runs.clone(),
        );
        registry.register(
            "syncer_step_failures",
            "Syncer step failures by step",
            metrics.syncer_step_failures.clone(),
        );
        registry.register(
            "syncer_job_index_pairs",
            "Size of the job index produced by the last successful run",
            metrics.syncer_job_index_pairs.clone(),
        );
        registry.register(
            "otlp_requests",
            "OTLP export requests received",
            metrics.otlp_requests.clone(),
        );
        registry.register(
            "otlp_datapoints_received",
            "Data points seen in inbound OTLP requests",
            metrics.otlp_datapoints_received.clone(),
        );
        registry.register(
            "otlp_datapoints_dropped",
            "Data points removed by the unused-metrics filter",
            metrics.otlp_datapoints_dropped.clone(),
        );
        registry.register(
            "otlp_metrics_dropped",
            "Metrics removed by the unused-metrics filter",
            metrics.otlp_metrics_dropped.clone(),
        );
        registry.register(
            "otlp_lookup_failures",
            "Catalog lookups that failed, cancelling drop decisions",
            metrics.otlp_lookup_failures.clone(),
        );
        registry.register(
            "otlp_downstream_retries",
            "Downstream export retries after UNAVAILABLE",
            metrics.otlp_downstream_retries.clone(),
        );
        registry.register(
            "otlp_downstream_failures",
            "Downstream exports that ultimately failed",
            metrics.otlp_downstream_failures.clone(),
        );
        registry.register(
            "catalog_buffer_dropped",
            "Observations dropped because the catalog buffer was full",
            metrics.catalog_buffer_dropped.clone(),
        );
        registry.register(
            "catalog_flushes",
            "Catalog flushes by outcome",
            metrics.catalog_flushes.clone(),
        );
        registry.register(
            "catalog_seen_store_errors",
            "Seen-set store operations that failed",
            metrics.catalog_seen_store_errors.clone(),
        );

        metrics
    }
}

/// Forces registration of all metric families so they are present in the
/// very first scrape.
pub(crate) fn init() {
    Lazy::force(&METRICS);
}

/// Returns the service metric families.
pub fn metrics() -> &'static Metrics {
    &METRICS
}

/// Encodes the registry in OpenMetrics text format.
pub fn collect() -> Result<String, std::io::Error> {
    let mut buffer = String::new();
    let registry = REGISTRY.read();

    encode(&mut buffer, &registry).map_err(std::io::Error::other)?;

    Ok(buffer)
}
