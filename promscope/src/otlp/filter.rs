//! Drop decisions over inbound OTLP metric batches.
//!
//! The invariant throughout: a metric is dropped only when its catalog
//! lookup succeeded, all four usage counts are zero, histogram variant
//! reconciliation passed, and the resource job is permitted by the
//! allow/deny lists. Every uncertain condition keeps data.

use crate::settings::JobGateSettings;
use crate::storage::{MetricCatalogItem, MetricType, MetricUsageCounts};
use chrono::Utc;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::metrics::v1::{metric, Metric, ResourceMetrics};
use std::collections::{HashMap, HashSet};

/// Suffixes of the series a histogram explodes into on the Prometheus
/// side.
const HISTOGRAM_SUFFIXES: [&str; 3] = ["_bucket", "_count", "_sum"];

const JOB_ATTRIBUTE: &str = "job";
const SERVICE_NAME_ATTRIBUTE: &str = "service.name";

/// Result of walking the resource/scope/metric tree.
#[derive(Clone, Debug, Default)]
pub struct NameExtraction {
    /// Unique names to resolve against the catalog, histogram variants
    /// included.
    pub lookup_names: Vec<String>,

    /// Base names of histogram metrics present in the request.
    pub histogram_bases: HashSet<String>,

    /// Total data points in the request.
    pub datapoints: u64,
}

/// Walks the request and collects lookup names plus data-point counts.
///
/// Histogram metrics contribute their base name and the three derived
/// variants.
pub fn extract_names(req: &ExportMetricsServiceRequest) -> NameExtraction {
    let mut extraction = NameExtraction::default();
    let mut seen: HashSet<String> = HashSet::new();

    for resource in &req.resource_metrics {
        for scope in &resource.scope_metrics {
            for metric in &scope.metrics {
                extraction.datapoints += datapoint_count(metric);

                if seen.insert(metric.name.clone()) {
                    extraction.lookup_names.push(metric.name.clone());
                }

                if is_histogram(metric) {
                    extraction.histogram_bases.insert(metric.name.clone());

                    for suffix in HISTOGRAM_SUFFIXES {
                        let variant = format!("{}{}", metric.name, suffix);

                        if seen.insert(variant.clone()) {
                            extraction.lookup_names.push(variant);
                        }
                    }
                }
            }
        }
    }

    extraction
}

/// Number of data points carried by one metric.
pub fn datapoint_count(metric: &Metric) -> u64 {
    match &metric.data {
        Some(metric::Data::Gauge(gauge)) => gauge.data_points.len() as u64,
        Some(metric::Data::Sum(sum)) => sum.data_points.len() as u64,
        Some(metric::Data::Histogram(histogram)) => histogram.data_points.len() as u64,
        Some(metric::Data::ExponentialHistogram(histogram)) => histogram.data_points.len() as u64,
        Some(metric::Data::Summary(summary)) => summary.data_points.len() as u64,
        None => 0,
    }
}

fn is_histogram(metric: &Metric) -> bool {
    matches!(
        metric.data,
        Some(metric::Data::Histogram(_)) | Some(metric::Data::ExponentialHistogram(_))
    )
}

/// Catalog type of one OTLP metric.
pub fn metric_kind(metric: &Metric) -> MetricType {
    match &metric.data {
        Some(metric::Data::Gauge(_)) => MetricType::Gauge,
        Some(metric::Data::Sum(sum)) if sum.is_monotonic => MetricType::Counter,
        Some(metric::Data::Sum(_)) => MetricType::Gauge,
        Some(metric::Data::Histogram(_)) | Some(metric::Data::ExponentialHistogram(_)) => {
            MetricType::Histogram
        }
        Some(metric::Data::Summary(_)) => MetricType::Summary,
        None => MetricType::Unknown,
    }
}

/// Catalog items for every metric observed in the request.
pub fn observed_catalog_items(req: &ExportMetricsServiceRequest) -> Vec<MetricCatalogItem> {
    let now = Utc::now();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut items = vec![];

    for resource in &req.resource_metrics {
        for scope in &resource.scope_metrics {
            for metric in &scope.metrics {
                if !seen.insert(metric.name.as_str()) {
                    continue;
                }

                items.push(MetricCatalogItem {
                    name: metric.name.clone(),
                    metric_type: metric_kind(metric),
                    help: metric.description.clone(),
                    unit: metric.unit.clone(),
                    last_synced_at: now,
                });
            }
        }
    }

    items
}

/// Tracks which histogram variants were seen in the catalog and whether
/// each is unused.
#[derive(Clone, Copy, Debug, Default)]
struct HistogramVariants {
    bucket: Option<bool>,
    count: Option<bool>,
    sum: Option<bool>,
}

impl HistogramVariants {
    /// The base is unused only when all three variants were seen and all
    /// three are unused.
    fn all_unused(&self) -> bool {
        self.bucket == Some(true) && self.count == Some(true) && self.sum == Some(true)
    }
}

/// Accumulates drop candidates across lookup chunks.
///
/// Results are processed chunk-by-chunk to bound memory; the accumulator
/// holds only per-name booleans.
#[derive(Debug)]
pub struct DropAccumulator {
    histogram_bases: HashSet<String>,
    unused: HashSet<String>,
    histograms: HashMap<String, HistogramVariants>,
}

impl DropAccumulator {
    pub fn new(histogram_bases: HashSet<String>) -> Self {
        Self {
            histogram_bases,
            unused: HashSet::new(),
            histograms: HashMap::new(),
        }
    }

    /// Folds one chunk of catalog rows into the accumulator.
    pub fn observe(&mut self, rows: &[MetricUsageCounts]) {
        for row in rows {
            if let Some((base, suffix)) = self.histogram_variant(&row.name) {
                let state = self.histograms.entry(base).or_default();
                let unused = row.is_unused();

                match suffix {
                    "_bucket" => state.bucket = Some(unused),
                    "_count" => state.count = Some(unused),
                    _ => state.sum = Some(unused),
                }
            } else if self.histogram_bases.contains(&row.name) {
                // The base row itself carries no decision; the variants
                // reconcile it.
            } else if row.is_unused() {
                self.unused.insert(row.name.clone());
            }
        }
    }

    /// Matches a catalog row name against the histogram bases of the
    /// request.
    fn histogram_variant(&self, name: &str) -> Option<(String, &'static str)> {
        for suffix in HISTOGRAM_SUFFIXES {
            if let Some(base) = name.strip_suffix(suffix) {
                if self.histogram_bases.contains(base) {
                    return Some((base.to_owned(), suffix));
                }
            }
        }

        None
    }

    /// The set of request metric names flagged unused. A histogram base
    /// with any variant missing from the catalog fails open.
    pub fn finalize(self) -> HashSet<String> {
        let mut unused = self.unused;

        for (base, variants) in self.histograms {
            if variants.all_unused() {
                unused.insert(base);
            }
        }

        unused
    }
}

/// Allow/deny job gating of drop decisions.
#[derive(Clone, Debug, Default)]
pub struct JobGate {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl JobGate {
    pub fn from_settings(settings: &JobGateSettings) -> Self {
        Self {
            allow: settings.allow.iter().cloned().collect(),
            deny: settings.deny.iter().cloned().collect(),
        }
    }

    /// Whether metrics of this job may be dropped.
    pub fn permits(&self, job: &str) -> bool {
        (self.allow.is_empty() || self.allow.contains(job)) && !self.deny.contains(job)
    }
}

/// Resolves the job of a resource from its attributes: `job`, falling back
/// to `service.name`.
pub fn resolve_job(resource: &ResourceMetrics) -> Option<String> {
    let attributes = &resource.resource.as_ref()?.attributes;

    attribute_str(attributes, JOB_ATTRIBUTE)
        .or_else(|| attribute_str(attributes, SERVICE_NAME_ATTRIBUTE))
}

fn attribute_str(
    attributes: &[opentelemetry_proto::tonic::common::v1::KeyValue],
    key: &str,
) -> Option<String> {
    attributes.iter().find(|kv| kv.key == key).and_then(|kv| {
        match kv.value.as_ref()?.value.as_ref()? {
            any_value::Value::StringValue(s) => Some(s.clone()),
            _ => None,
        }
    })
}

/// What the filter removed (or would remove in dry-run).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    pub metrics_dropped: u64,
    pub datapoints_dropped: u64,
}

/// Removes unused metrics in place, honoring the job gate. Empty scopes
/// and resources are elided. In dry-run mode no mutation occurs; only the
/// counts advance.
pub fn apply_drops(
    req: &mut ExportMetricsServiceRequest,
    unused: &HashSet<String>,
    gate: &JobGate,
    dry_run: bool,
) -> FilterOutcome {
    let mut outcome = FilterOutcome::default();

    if unused.is_empty() {
        return outcome;
    }

    for resource in &mut req.resource_metrics {
        // No resolvable job means no drop decision for this resource.
        let Some(job) = resolve_job(resource) else {
            continue;
        };

        if !gate.permits(&job) {
            continue;
        }

        for scope in &mut resource.scope_metrics {
            if dry_run {
                for metric in &scope.metrics {
                    if unused.contains(&metric.name) {
                        outcome.metrics_dropped += 1;
                        outcome.datapoints_dropped += datapoint_count(metric);
                    }
                }
            } else {
                scope.metrics.retain(|metric| {
                    if unused.contains(&metric.name) {
                        outcome.metrics_dropped += 1;
                        outcome.datapoints_dropped += datapoint_count(metric);

                        false
                    } else {
                        true
                    }
                });
            }
        }

        if !dry_run {
            resource.scope_metrics.retain(|scope| !scope.metrics.is_empty());
        }
    }

    if !dry_run {
        req.resource_metrics
            .retain(|resource| !resource.scope_metrics.is_empty());
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue};
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Histogram, HistogramDataPoint, NumberDataPoint, ScopeMetrics,
    };
    use opentelemetry_proto::tonic::resource::v1::Resource;

    fn counts(name: &str, queries: i64) -> MetricUsageCounts {
        MetricUsageCounts {
            name: name.to_owned(),
            alert_count: 0,
            record_count: 0,
            dashboard_count: 0,
            query_count: queries,
        }
    }

    fn gauge_metric(name: &str, points: usize) -> Metric {
        Metric {
            name: name.to_owned(),
            data: Some(metric::Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint::default(); points],
            })),
            ..Default::default()
        }
    }

    fn histogram_metric(name: &str, points: usize) -> Metric {
        Metric {
            name: name.to_owned(),
            data: Some(metric::Data::Histogram(Histogram {
                data_points: vec![HistogramDataPoint::default(); points],
                ..Default::default()
            })),
            ..Default::default()
        }
    }

    fn request(job: Option<&str>, metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
        let attributes = job
            .map(|job| {
                vec![KeyValue {
                    key: "job".to_owned(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue(job.to_owned())),
                    }),
                }]
            })
            .unwrap_or_default();

        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes,
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn histograms_contribute_their_variants() {
        let req = request(
            Some("api"),
            vec![histogram_metric("http_request_duration_seconds", 3)],
        );

        let extraction = extract_names(&req);

        assert_eq!(extraction.datapoints, 3);
        assert!(extraction
            .histogram_bases
            .contains("http_request_duration_seconds"));
        assert_eq!(
            extraction.lookup_names,
            vec![
                "http_request_duration_seconds",
                "http_request_duration_seconds_bucket",
                "http_request_duration_seconds_count",
                "http_request_duration_seconds_sum",
            ]
        );
    }

    #[test]
    fn plain_unused_metrics_are_flagged() {
        let mut acc = DropAccumulator::new(HashSet::new());

        acc.observe(&[counts("idle_metric", 0), counts("busy_metric", 7)]);

        let unused = acc.finalize();

        assert!(unused.contains("idle_metric"));
        assert!(!unused.contains("busy_metric"));
    }

    #[test]
    fn histogram_base_needs_all_three_variants_unused() {
        let base = "http_request_duration_seconds";
        let mut acc = DropAccumulator::new(HashSet::from([base.to_owned()]));

        acc.observe(&[
            counts(&format!("{base}_bucket"), 0),
            counts(&format!("{base}_count"), 0),
            counts(&format!("{base}_sum"), 0),
        ]);

        assert!(acc.finalize().contains(base));
    }

    #[test]
    fn histogram_base_fails_open_on_a_missing_variant() {
        let base = "http_request_duration_seconds";
        let mut acc = DropAccumulator::new(HashSet::from([base.to_owned()]));

        // `_sum` is absent from the catalog.
        acc.observe(&[
            counts(&format!("{base}_bucket"), 0),
            counts(&format!("{base}_count"), 0),
        ]);

        assert!(acc.finalize().is_empty());
    }

    #[test]
    fn histogram_base_stays_when_one_variant_is_used() {
        let base = "http_request_duration_seconds";
        let mut acc = DropAccumulator::new(HashSet::from([base.to_owned()]));

        acc.observe(&[
            counts(&format!("{base}_bucket"), 0),
            counts(&format!("{base}_count"), 5),
            counts(&format!("{base}_sum"), 0),
        ]);

        assert!(acc.finalize().is_empty());
    }

    #[test]
    fn variant_suffix_without_a_histogram_in_the_request_is_a_plain_name() {
        let mut acc = DropAccumulator::new(HashSet::new());

        acc.observe(&[counts("goroutines_count", 0)]);

        assert!(acc.finalize().contains("goroutines_count"));
    }

    #[test]
    fn drops_remove_metrics_and_elide_empty_nodes() {
        let mut req = request(
            Some("api"),
            vec![gauge_metric("unused_metric", 2), gauge_metric("used_metric", 1)],
        );
        let unused = HashSet::from(["unused_metric".to_owned()]);

        let outcome = apply_drops(&mut req, &unused, &JobGate::default(), false);

        assert_eq!(outcome.metrics_dropped, 1);
        assert_eq!(outcome.datapoints_dropped, 2);
        assert_eq!(req.resource_metrics[0].scope_metrics[0].metrics.len(), 1);

        // Dropping the last metric elides the whole tree.
        let mut req = request(Some("api"), vec![gauge_metric("unused_metric", 1)]);
        let outcome = apply_drops(&mut req, &unused, &JobGate::default(), false);

        assert_eq!(outcome.metrics_dropped, 1);
        assert!(req.resource_metrics.is_empty());
    }

    #[test]
    fn dry_run_counts_without_mutating() {
        let mut req = request(Some("api"), vec![gauge_metric("unused_metric", 2)]);
        let unused = HashSet::from(["unused_metric".to_owned()]);

        let outcome = apply_drops(&mut req, &unused, &JobGate::default(), true);

        assert_eq!(outcome.metrics_dropped, 1);
        assert_eq!(outcome.datapoints_dropped, 2);
        assert_eq!(req.resource_metrics[0].scope_metrics[0].metrics.len(), 1);
    }

    #[test]
    fn job_gating_blocks_drops() {
        let unused = HashSet::from(["unused_metric".to_owned()]);

        // Job absent from a non-empty allow list.
        let gate = JobGate {
            allow: HashSet::from(["batch".to_owned()]),
            deny: HashSet::new(),
        };
        let mut req = request(Some("api"), vec![gauge_metric("unused_metric", 1)]);

        assert_eq!(
            apply_drops(&mut req, &unused, &gate, false),
            FilterOutcome::default()
        );

        // Job present in the deny list.
        let gate = JobGate {
            allow: HashSet::new(),
            deny: HashSet::from(["api".to_owned()]),
        };
        let mut req = request(Some("api"), vec![gauge_metric("unused_metric", 1)]);

        assert_eq!(
            apply_drops(&mut req, &unused, &gate, false),
            FilterOutcome::default()
        );
    }

    #[test]
    fn missing_job_fails_open() {
        let unused = HashSet::from(["unused_metric".to_owned()]);
        let mut req = request(None, vec![gauge_metric("unused_metric", 1)]);

        assert_eq!(
            apply_drops(&mut req, &unused, &JobGate::default(), false),
            FilterOutcome::default()
        );
    }

    #[test]
    fn service_name_is_the_job_fallback() {
        let mut req = request(None, vec![]);
        req.resource_metrics[0]
            .resource
            .as_mut()
            .unwrap()
            .attributes
            .push(KeyValue {
                key: "service.name".to_owned(),
                value: Some(AnyValue {
                    value: Some(any_value::Value::StringValue("checkout".to_owned())),
                }),
            });

        assert_eq!(
            resolve_job(&req.resource_metrics[0]).as_deref(),
            Some("checkout")
        );
    }

    #[test]
    fn monotonic_sums_are_counters() {
        use opentelemetry_proto::tonic::metrics::v1::Sum;

        let counter = Metric {
            name: "requests_total".to_owned(),
            data: Some(metric::Data::Sum(Sum {
                is_monotonic: true,
                ..Default::default()
            })),
            ..Default::default()
        };

        assert_eq!(metric_kind(&counter), MetricType::Counter);
        assert_eq!(metric_kind(&gauge_metric("g", 0)), MetricType::Gauge);
        assert_eq!(
            metric_kind(&histogram_metric("h", 0)),
            MetricType::Histogram
        );
    }
}
