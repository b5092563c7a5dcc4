//! Round-trip tests of the persistence contract over the embedded
//! adapter. Both adapters share their SQL shapes; the embedded one runs
//! without external infrastructure.

use chrono::{Duration, Utc};
use promscope::storage::sqlite::SqliteStore;
use promscope::storage::{
    DashboardUsageItem, Dialect, JobIndexPair, MetricCatalogItem, MetricType, PageParams,
    QueryRecord, QueryType, RuleKind, RulesUsageItem, SeriesMetadataParams, SortOrder, SortSpec,
    Store, TimeRange,
};
use std::collections::BTreeMap;

fn range() -> TimeRange {
    TimeRange::last_days(1)
}

fn page(page: u64, page_size: u64) -> PageParams {
    PageParams { page, page_size }
}

fn sort(by: &str, order: SortOrder) -> SortSpec {
    SortSpec {
        by: by.to_owned(),
        order,
    }
}

fn record(expr: &str, fingerprint: &str, metric: &str) -> QueryRecord {
    QueryRecord {
        ts: Utc::now(),
        fingerprint: fingerprint.to_owned(),
        query_param: expr.to_owned(),
        query_type: QueryType::Instant,
        time_param: Some(Utc::now()),
        start: None,
        end: None,
        step: None,
        status_code: 200,
        duration_ms: 12.5,
        body_size: 128,
        total_queryable_samples: 100,
        peak_samples: 42,
        label_matchers: vec![BTreeMap::from([
            ("__name__".to_owned(), metric.to_owned()),
            ("job".to_owned(), "*".to_owned()),
        ])],
    }
}

fn catalog_item(name: &str, metric_type: MetricType) -> MetricCatalogItem {
    MetricCatalogItem {
        name: name.to_owned(),
        metric_type,
        help: format!("{name} help"),
        unit: String::new(),
        last_synced_at: Utc::now(),
    }
}

async fn store() -> SqliteStore {
    SqliteStore::connect_in_memory().await.unwrap()
}

#[tokio::test]
async fn ingest_roundtrip_preserves_fields() {
    let store = store().await;

    store.ingest_batch(&[record("up", "fp-up", "up")]).await.unwrap();

    let types = store.query_types(range(), None).await.unwrap();
    assert_eq!(types.total_queries, 1);
    assert_eq!(types.instant_percent, 100.0);

    let executions = store
        .query_executions(range(), "fp-up", page(1, 10))
        .await
        .unwrap();

    assert_eq!(executions.total, 1);

    let row = &executions.data[0];
    assert_eq!(row.status_code, 200);
    assert_eq!(row.duration_ms, 12.5);
    assert_eq!(row.total_queryable_samples, 100);
    assert_eq!(row.peak_samples, 42);
}

#[tokio::test]
async fn dialect_is_reported() {
    assert_eq!(store().await.dialect(), Dialect::Sqlite);
}

#[tokio::test]
async fn duplicates_are_allowed() {
    let store = store().await;
    let record = record("up", "fp-up", "up");

    store
        .ingest_batch(&[record.clone(), record])
        .await
        .unwrap();

    assert_eq!(store.query_types(range(), None).await.unwrap().total_queries, 2);
}

#[tokio::test]
async fn fingerprint_filter_scopes_aggregates() {
    let store = store().await;

    store
        .ingest_batch(&[
            record("up", "fp-a", "up"),
            record("up", "fp-a", "up"),
            record("rate(x[5m])", "fp-b", "x"),
        ])
        .await
        .unwrap();

    let all = store.query_types(range(), None).await.unwrap();
    assert_eq!(all.total_queries, 3);

    let scoped = store.query_types(range(), Some("fp-a")).await.unwrap();
    assert_eq!(scoped.total_queries, 2);
}

#[tokio::test]
async fn bucketed_aggregates_cover_the_window() {
    let store = store().await;

    let mut error = record("up", "fp-a", "up");
    error.status_code = 500;

    store
        .ingest_batch(&[record("up", "fp-a", "up"), error])
        .await
        .unwrap();

    let rates = store.query_rate(range(), None).await.unwrap();
    assert_eq!(rates.iter().map(|p| p.success).sum::<i64>(), 1);
    assert_eq!(rates.iter().map(|p| p.error).sum::<i64>(), 1);

    let statuses = store.status_distribution(range(), None).await.unwrap();
    assert_eq!(statuses.iter().map(|p| p.status_2xx).sum::<i64>(), 1);
    assert_eq!(statuses.iter().map(|p| p.status_5xx).sum::<i64>(), 1);

    let throughput = store.throughput_analysis(range(), None).await.unwrap();
    assert_eq!(throughput.iter().map(|p| p.count).sum::<i64>(), 2);

    let durations = store.average_duration(range(), None).await.unwrap();
    assert!(!durations.is_empty());
    assert!(durations.iter().all(|p| p.value > 0.0));

    let latency = store.latency_trends(range(), None).await.unwrap();
    assert!(!latency.is_empty());

    let errors = store.error_analysis(range(), None).await.unwrap();
    assert_eq!(errors.iter().map(|p| p.errors).sum::<i64>(), 1);
}

#[tokio::test]
async fn range_spans_land_in_their_buckets() {
    let store = store().await;
    let now = Utc::now();

    let mut short = record("rate(up[1m])", "fp-r", "up");
    short.query_type = QueryType::Range;
    short.start = Some(now - Duration::minutes(30));
    short.end = Some(now);
    short.step = Some(15.0);

    let mut long = short.clone();
    long.start = Some(now - Duration::days(3));

    store.ingest_batch(&[short, long]).await.unwrap();

    let buckets = store.time_range_distribution(range()).await.unwrap();

    let count_of = |label: &str| {
        buckets
            .iter()
            .find(|b| b.range == label)
            .map(|b| b.count)
            .unwrap_or(0)
    };

    assert_eq!(count_of("<1h"), 1);
    assert_eq!(count_of("1d-7d"), 1);
    assert_eq!(count_of(">7d"), 0);
}

#[tokio::test]
async fn expressions_aggregate_by_fingerprint() {
    let store = store().await;

    store
        .ingest_batch(&[
            record("up", "fp-a", "up"),
            record("up", "fp-a", "up"),
            record("absent(up)", "fp-b", "up"),
            // Unparsable expressions are excluded from the listing.
            record("sum(rate(", "", "up"),
        ])
        .await
        .unwrap();

    let expressions = store
        .query_expressions(range(), page(1, 10), sort("executions", SortOrder::Desc))
        .await
        .unwrap();

    assert_eq!(expressions.total, 2);
    assert_eq!(expressions.data[0].fingerprint, "fp-a");
    assert_eq!(expressions.data[0].executions, 2);
}

#[tokio::test]
async fn catalog_upsert_preserves_richer_metadata() {
    let store = store().await;

    store
        .upsert_metrics_catalog(&[catalog_item("up", MetricType::Gauge)])
        .await
        .unwrap();

    // A later observation with no metadata must not clobber the entry.
    let mut bare = catalog_item("up", MetricType::Unknown);
    bare.help = String::new();

    store.upsert_metrics_catalog(&[bare]).await.unwrap();

    let params = SeriesMetadataParams {
        page: page(1, 10),
        sort: sort("name", SortOrder::Asc),
        filter: None,
        metric_type: None,
        unused: None,
        job: None,
    };

    let rows = store.series_metadata(&params).await.unwrap();

    assert_eq!(rows.total, 1);
    assert_eq!(rows.data[0].metric_type, MetricType::Gauge);
    assert_eq!(rows.data[0].help, "up help");
}

#[tokio::test]
async fn usage_summary_drives_the_unused_flag() {
    let store = store().await;

    store
        .upsert_metrics_catalog(&[
            catalog_item("up", MetricType::Gauge),
            catalog_item("idle_metric", MetricType::Counter),
        ])
        .await
        .unwrap();

    store
        .replace_rules_usage(
            RuleKind::Alert,
            &[RulesUsageItem {
                serie: "up".to_owned(),
                group_name: "node".to_owned(),
                name: "InstanceDown".to_owned(),
                expression: "up == 0".to_owned(),
                kind: RuleKind::Alert,
            }],
        )
        .await
        .unwrap();

    store.ingest_batch(&[record("up", "fp-up", "up")]).await.unwrap();

    store.refresh_usage_summary(range()).await.unwrap();

    let unused_only = SeriesMetadataParams {
        page: page(1, 10),
        sort: sort("name", SortOrder::Asc),
        filter: None,
        metric_type: None,
        unused: Some(true),
        job: None,
    };

    let rows = store.series_metadata(&unused_only).await.unwrap();

    assert_eq!(rows.total, 1);
    assert_eq!(rows.data[0].name, "idle_metric");

    let counts = store
        .series_metadata_by_names(&["up".to_owned(), "idle_metric".to_owned()], None)
        .await
        .unwrap();

    let up = counts.iter().find(|c| c.name == "up").unwrap();
    assert_eq!(up.alert_count, 1);
    assert_eq!(up.query_count, 1);
    assert!(!up.is_unused());

    let idle = counts.iter().find(|c| c.name == "idle_metric").unwrap();
    assert!(idle.is_unused());
}

#[tokio::test]
async fn usage_tables_are_replaced_wholesale() {
    let store = store().await;

    let rule = |serie: &str, name: &str| RulesUsageItem {
        serie: serie.to_owned(),
        group_name: "g".to_owned(),
        name: name.to_owned(),
        expression: String::new(),
        kind: RuleKind::Record,
    };

    store
        .replace_rules_usage(RuleKind::Record, &[rule("up", "old_rule")])
        .await
        .unwrap();
    store
        .replace_rules_usage(RuleKind::Record, &[rule("up", "new_rule")])
        .await
        .unwrap();

    let rows = store
        .rules_usage("up", RuleKind::Record, page(1, 10))
        .await
        .unwrap();

    assert_eq!(rows.total, 1);
    assert_eq!(rows.data[0].name, "new_rule");

    store
        .replace_dashboard_usage(&[DashboardUsageItem {
            serie: "up".to_owned(),
            id: "dash-1".to_owned(),
            name: "Node overview".to_owned(),
            url: "https://grafana/d/1".to_owned(),
        }])
        .await
        .unwrap();
    store.replace_dashboard_usage(&[]).await.unwrap();

    let dashboards = store.dashboard_usage("up", page(1, 10)).await.unwrap();

    assert_eq!(dashboards.total, 0);
}

#[tokio::test]
async fn job_index_is_rebuilt_not_merged() {
    let store = store().await;

    let pair = |job: &str, metric: &str| JobIndexPair {
        job: job.to_owned(),
        metric_name: metric.to_owned(),
    };

    store
        .upsert_job_index(&[pair("node", "up"), pair("api", "up")])
        .await
        .unwrap();
    store.upsert_job_index(&[pair("api", "up")]).await.unwrap();

    assert_eq!(store.list_jobs().await.unwrap(), vec!["api"]);

    // The job filter keeps only metrics indexed under the job.
    store
        .upsert_metrics_catalog(&[catalog_item("up", MetricType::Gauge)])
        .await
        .unwrap();

    let scoped = store
        .series_metadata_by_names(&["up".to_owned()], Some("api"))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 1);

    let other_job = store
        .series_metadata_by_names(&["up".to_owned()], Some("batch"))
        .await
        .unwrap();
    assert!(other_job.is_empty());
}

#[tokio::test]
async fn pagination_obeys_bounds() {
    let store = store().await;

    let items: Vec<MetricCatalogItem> = (0..25)
        .map(|i| catalog_item(&format!("metric_{i:02}"), MetricType::Gauge))
        .collect();

    store.upsert_metrics_catalog(&items).await.unwrap();

    let params = |p: u64| SeriesMetadataParams {
        page: page(p, 10),
        sort: sort("name", SortOrder::Asc),
        filter: None,
        metric_type: None,
        unused: None,
        job: None,
    };

    let first = store.series_metadata(&params(1)).await.unwrap();
    assert_eq!(first.total, 25);
    assert_eq!(first.total_pages, 3);
    assert_eq!(first.data.len(), 10);
    assert_eq!(first.data[0].name, "metric_00");

    let last = store.series_metadata(&params(3)).await.unwrap();
    assert_eq!(last.data.len(), 5);

    let beyond = store.series_metadata(&params(4)).await.unwrap();
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.total_pages, 3);
}

#[tokio::test]
async fn name_filter_escapes_like_metacharacters() {
    let store = store().await;

    store
        .upsert_metrics_catalog(&[
            catalog_item("http_requests_total", MetricType::Counter),
            catalog_item("httpxrequestsxtotal", MetricType::Counter),
        ])
        .await
        .unwrap();

    let params = SeriesMetadataParams {
        page: page(1, 10),
        sort: sort("name", SortOrder::Asc),
        filter: Some("http_requests".to_owned()),
        metric_type: None,
        unused: None,
        job: None,
    };

    let rows = store.series_metadata(&params).await.unwrap();

    assert_eq!(rows.total, 1);
    assert_eq!(rows.data[0].name, "http_requests_total");
}

#[tokio::test]
async fn metric_statistics_attribute_queries_by_name_matcher() {
    let store = store().await;

    store
        .upsert_metrics_catalog(&[catalog_item("a_b", MetricType::Gauge)])
        .await
        .unwrap();

    store
        .ingest_batch(&[record("axb", "fp-x", "axb"), record("a_b", "fp-y", "a_b")])
        .await
        .unwrap();

    // The underscore must not act as a LIKE wildcard.
    let stats = store.metric_statistics("a_b", range()).await.unwrap();
    assert_eq!(stats.query_count, 1);

    let perf = store.metric_query_performance("a_b", range()).await.unwrap();
    assert_eq!(perf.total_executions, 1);
    assert_eq!(perf.error_rate, 0.0);

    let expressions = store
        .queries_by_serie_name("a_b", range(), page(1, 10))
        .await
        .unwrap();
    assert_eq!(expressions.total, 1);
    assert_eq!(expressions.data[0].query_param, "a_b");
}

#[tokio::test]
async fn series_count_is_filled_on_demand() {
    let store = store().await;

    store
        .upsert_metrics_catalog(&[catalog_item("up", MetricType::Gauge)])
        .await
        .unwrap();

    store.set_series_count("up", 17).await.unwrap();

    let stats = store.metric_statistics("up", range()).await.unwrap();
    assert_eq!(stats.series_count, 17);

    // A summary refresh must not clobber the on-demand value.
    store.refresh_usage_summary(range()).await.unwrap();

    let stats = store.metric_statistics("up", range()).await.unwrap();
    assert_eq!(stats.series_count, 17);
}
