//! Export RPC tests over a real catalog: histogram reconciliation and job
//! gating drive the dropped-datapoints accounting end to end.

use chrono::Utc;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::MetricsService;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, Histogram, HistogramDataPoint, Metric, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use promscope::otlp::MetricsIngester;
use promscope::settings::OtlpSettings;
use promscope::storage::sqlite::SqliteStore;
use promscope::storage::{MetricCatalogItem, MetricType, Store};
use promscope::telemetry::metrics::metrics;
use std::sync::Arc;

const BASE: &str = "http_request_duration_seconds";

fn catalog_item(name: &str) -> MetricCatalogItem {
    MetricCatalogItem {
        name: name.to_owned(),
        metric_type: MetricType::Histogram,
        help: String::new(),
        unit: "s".to_owned(),
        last_synced_at: Utc::now(),
    }
}

fn histogram_request(job: &str, points: usize) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "job".to_owned(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue(job.to_owned())),
                    }),
                }],
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                metrics: vec![Metric {
                    name: BASE.to_owned(),
                    data: Some(metric::Data::Histogram(Histogram {
                        data_points: vec![HistogramDataPoint::default(); points],
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn ingester(store: Arc<dyn Store>, settings: &OtlpSettings) -> MetricsIngester {
    MetricsIngester::new(
        store,
        None,
        None,
        settings,
        slog::Logger::root(slog::Discard, slog::o!()),
    )
}

async fn dropped_datapoints_for(
    catalog: &[MetricCatalogItem],
    settings: &OtlpSettings,
) -> u64 {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());

    // Catalog entries without any recorded usage report all-zero counts.
    store.upsert_metrics_catalog(catalog).await.unwrap();

    let ingester = ingester(store, settings);

    let before = metrics().otlp_datapoints_dropped.get();

    ingester
        .export(tonic::Request::new(histogram_request("api", 3)))
        .await
        .unwrap();

    metrics().otlp_datapoints_dropped.get() - before
}

// A single test keeps the global drop counters free of interleaving.
#[tokio::test]
async fn histogram_reconciliation_drives_drop_accounting() {
    let settings = OtlpSettings::default();

    // All three variants are known and unused: the base is dropped and its
    // three data points are counted.
    let full_catalog = [
        catalog_item(&format!("{BASE}_bucket")),
        catalog_item(&format!("{BASE}_count")),
        catalog_item(&format!("{BASE}_sum")),
    ];

    assert_eq!(dropped_datapoints_for(&full_catalog, &settings).await, 3);

    // `_sum` is missing from the catalog: the base fails open and nothing
    // is counted.
    let partial_catalog = [
        catalog_item(&format!("{BASE}_bucket")),
        catalog_item(&format!("{BASE}_count")),
    ];

    assert_eq!(dropped_datapoints_for(&partial_catalog, &settings).await, 0);

    // A deny-listed job blocks the drop even though the catalog marks the
    // metric unused.
    let mut denied = OtlpSettings::default();
    denied.jobs.deny = vec!["api".to_owned()];

    assert_eq!(dropped_datapoints_for(&full_catalog, &denied).await, 0);

    // An allow list that does not include the job blocks the drop too.
    let mut gated = OtlpSettings::default();
    gated.jobs.allow = vec!["batch".to_owned()];

    assert_eq!(dropped_datapoints_for(&full_catalog, &gated).await, 0);
}
