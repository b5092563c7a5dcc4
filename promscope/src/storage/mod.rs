//! Dialect-agnostic persistence contract.
//!
//! All other subsystems consume the [`Store`] trait; dialect-specific SQL
//! stays encapsulated behind the two adapters ([`postgres`], [`sqlite`]).
//! Embedded numbered migrations are the only writer of DDL and run to the
//! latest version at startup.

pub mod postgres;
pub mod sqlite;

use crate::settings::{DatabaseProvider, DatabaseSettings};
use crate::BootstrapResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Number of names resolved per metadata lookup chunk on the OTLP path.
pub const LOOKUP_CHUNK_SIZE: usize = 500;

/// Maximum page size accepted by any paged read.
pub const MAX_PAGE_SIZE: u64 = 100;

/// Storage dialect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// Server-grade PostgreSQL adapter.
    Postgres,
    /// Embedded SQLite adapter.
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => f.write_str("postgres"),
            Dialect::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Storage operation error.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("storage operation timed out")]
    Timeout,
}

/// PromQL query kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Instant,
    Range,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Instant => "instant",
            QueryType::Range => "range",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instant" => Some(QueryType::Instant),
            "range" => Some(QueryType::Range),
            _ => None,
        }
    }
}

/// One proxied PromQL request. Append-only; retention is the operator's
/// concern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// UTC timestamp of arrival.
    pub ts: DateTime<Utc>,

    /// Stable identifier of the query shape; empty when the expression
    /// failed to parse.
    pub fingerprint: String,

    /// Raw expression text.
    pub query_param: String,

    #[serde(rename = "type")]
    pub query_type: QueryType,

    /// Evaluation timestamp of an instant query.
    pub time_param: Option<DateTime<Utc>>,

    /// Range window of a range query.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,

    /// Range step in seconds.
    pub step: Option<f64>,

    /// HTTP status observed on the upstream call.
    pub status_code: u16,

    /// Wall time spent on the upstream call, in milliseconds.
    pub duration_ms: f64,

    /// Response size in bytes.
    pub body_size: i64,

    /// Sample counts from the upstream stats block, zero when absent.
    pub total_queryable_samples: i64,
    pub peak_samples: i64,

    /// One name→value map per vector selector, with non-`__name__` values
    /// masked.
    pub label_matchers: Vec<BTreeMap<String, String>>,
}

impl QueryRecord {
    /// Serialized form of `label_matchers` as stored in the database.
    pub fn label_matchers_json(&self) -> String {
        serde_json::to_string(&self.label_matchers).unwrap_or_else(|_| "[]".into())
    }
}

/// Metric type as reported by upstream metadata or inferred from OTLP data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    #[default]
    Unknown,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "summary" => MetricType::Summary,
            _ => MetricType::Unknown,
        }
    }
}

/// One row of the metric catalog. `name` is the primary identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricCatalogItem {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub help: String,
    pub unit: String,
    pub last_synced_at: DateTime<Utc>,
}

/// Kind of a rule referencing a metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Alert,
    Record,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Alert => "alert",
            RuleKind::Record => "record",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "alert" => Some(RuleKind::Alert),
            "record" => Some(RuleKind::Record),
            _ => None,
        }
    }
}

/// A rule (alert or recording) referencing a metric.
///
/// Unique on `(serie, group_name, name, kind)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RulesUsageItem {
    pub serie: String,
    pub group_name: String,
    pub name: String,
    pub expression: String,
    pub kind: RuleKind,
}

/// A dashboard panel referencing a metric. Unique on `(serie, id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DashboardUsageItem {
    pub serie: String,
    pub id: String,
    pub name: String,
    pub url: String,
}

/// One `(job, metric_name)` pair of the job index.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIndexPair {
    pub job: String,
    pub metric_name: String,
}

/// Inclusive time range of an analytics read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    /// The trailing `days`-day window ending now.
    pub fn last_days(days: i64) -> Self {
        let to = Utc::now();

        Self {
            from: to - Duration::days(days),
            to,
        }
    }

    pub fn span(&self) -> Duration {
        self.to - self.from
    }

    /// Width of the aggregation bucket for this span, in seconds.
    pub fn bucket_secs(&self) -> i64 {
        bucket_width(self.span()).num_seconds()
    }
}

/// Selects the time-bucket width from the request span.
pub fn bucket_width(span: Duration) -> Duration {
    if span <= Duration::hours(2) {
        Duration::minutes(1)
    } else if span <= Duration::hours(6) {
        Duration::minutes(5)
    } else if span <= Duration::hours(24) {
        Duration::minutes(15)
    } else if span <= Duration::days(7) {
        Duration::hours(1)
    } else if span <= Duration::days(30) {
        Duration::hours(6)
    } else {
        Duration::days(1)
    }
}

/// Page selector of a paged read. Invariants are enforced by the HTTP
/// parameter layer: `page >= 1`, `1 <= page_size <= 100`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageParams {
    pub page: u64,
    pub page_size: u64,
}

impl PageParams {
    pub fn offset(&self) -> u64 {
        (self.page - 1) * self.page_size
    }
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
        }
    }
}

/// One page of a paged read.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Paged<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub total_pages: u64,
    pub page: u64,
    pub page_size: u64,
}

impl<T> Paged<T> {
    pub fn new(data: Vec<T>, total: u64, page: PageParams) -> Self {
        Self {
            data,
            total,
            total_pages: total.div_ceil(page.page_size),
            page: page.page,
            page_size: page.page_size,
        }
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(SortOrder::Asc),
            "desc" => Some(SortOrder::Desc),
            _ => None,
        }
    }
}

/// A validated sort specification. `by` is guaranteed to come from the
/// endpoint's whitelist; adapters additionally map it through a fixed
/// column table, so user input never reaches SQL.
#[derive(Clone, Debug, PartialEq)]
pub struct SortSpec {
    pub by: String,
    pub order: SortOrder,
}

/// Sortable fields of `series_metadata`.
pub const SERIES_METADATA_SORT_FIELDS: &[&str] = &[
    "name",
    "type",
    "alert_count",
    "record_count",
    "dashboard_count",
    "query_count",
    "last_queried_at",
    "series_count",
];

/// Sortable fields of `query_expressions`.
pub const EXPRESSIONS_SORT_FIELDS: &[&str] = &["executions", "avg_duration", "peak_samples"];

/// Parameters of the paged `series_metadata` read.
#[derive(Clone, Debug)]
pub struct SeriesMetadataParams {
    pub page: PageParams,
    pub sort: SortSpec,
    /// Substring filter over the metric name.
    pub filter: Option<String>,
    pub metric_type: Option<MetricType>,
    /// When set, keeps only (un)used metrics.
    pub unused: Option<bool>,
    /// When set, keeps only metrics indexed under this job.
    pub job: Option<String>,
}

/// One row of the paged catalog listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesMetadataRow {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub help: String,
    pub unit: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub alert_count: i64,
    pub record_count: i64,
    pub dashboard_count: i64,
    pub query_count: i64,
    pub last_queried_at: Option<DateTime<Utc>>,
    pub series_count: i64,
}

/// Usage counts of one catalog entry, as consumed by the OTLP drop
/// decisions and the unused-metrics endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricUsageCounts {
    pub name: String,
    pub alert_count: i64,
    pub record_count: i64,
    pub dashboard_count: i64,
    pub query_count: i64,
}

impl MetricUsageCounts {
    /// A metric is unused iff all four counts are zero.
    pub fn is_unused(&self) -> bool {
        self.alert_count == 0
            && self.record_count == 0
            && self.dashboard_count == 0
            && self.query_count == 0
    }
}

/// Result of the `query_types` aggregate.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryTypesResult {
    pub total_queries: i64,
    pub instant_percent: f64,
    pub range_percent: f64,
}

/// One time-bucketed scalar sample.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimePoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// One time-bucketed success/error pair.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryRatePoint {
    pub ts: DateTime<Utc>,
    pub success: i64,
    pub error: i64,
}

/// One time-bucketed status class breakdown.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusDistributionPoint {
    pub ts: DateTime<Utc>,
    pub status_2xx: i64,
    pub status_4xx: i64,
    pub status_5xx: i64,
}

/// One time-bucketed latency sample.
///
/// The embedded dialect has no percentile aggregate; there `p95_ms`
/// degrades to the bucket maximum.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LatencyTrendPoint {
    pub ts: DateTime<Utc>,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

/// One time-bucketed error count.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorAnalysisPoint {
    pub ts: DateTime<Utc>,
    pub errors: i64,
    pub total: i64,
}

/// One time-bucketed request count.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThroughputPoint {
    pub ts: DateTime<Utc>,
    pub count: i64,
}

/// One bucket of the range-span histogram.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimeRangeBucket {
    pub range: String,
    pub count: i64,
}

/// One aggregated query shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryExpression {
    pub fingerprint: String,
    pub query_param: String,
    pub executions: i64,
    pub avg_duration_ms: f64,
    pub peak_samples: i64,
}

/// One raw execution of a query shape.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryExecutionRow {
    pub ts: DateTime<Utc>,
    pub status_code: i64,
    pub duration_ms: f64,
    pub total_queryable_samples: i64,
    pub peak_samples: i64,
}

/// Usage statistics of one metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricStatistics {
    pub name: String,
    pub alert_count: i64,
    pub record_count: i64,
    pub dashboard_count: i64,
    pub query_count: i64,
    pub last_queried_at: Option<DateTime<Utc>>,
    pub series_count: i64,
}

/// Query performance statistics of one metric.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricQueryPerformance {
    pub name: String,
    pub total_executions: i64,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
    pub avg_peak_samples: f64,
}

/// One stored rule usage row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RulesUsageRow {
    pub serie: String,
    pub group_name: String,
    pub name: String,
    pub expression: String,
    pub kind: RuleKind,
    pub created_at: Option<DateTime<Utc>>,
}

/// One stored dashboard usage row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DashboardUsageRow {
    pub serie: String,
    pub id: String,
    pub name: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// The persistence contract consumed by every other subsystem.
#[async_trait]
pub trait Store: Send + Sync {
    fn dialect(&self) -> Dialect;

    // Writes.

    /// Bulk-inserts proxied query records. Duplicates are allowed.
    async fn ingest_batch(&self, queries: &[QueryRecord]) -> Result<(), StorageError>;

    /// Upserts catalog items by name, preserving richer existing metadata
    /// over empty or unknown incoming fields.
    async fn upsert_metrics_catalog(
        &self,
        items: &[MetricCatalogItem],
    ) -> Result<(), StorageError>;

    /// Replaces all rule usages of the given kind.
    async fn replace_rules_usage(
        &self,
        kind: RuleKind,
        items: &[RulesUsageItem],
    ) -> Result<(), StorageError>;

    /// Replaces all dashboard usages.
    async fn replace_dashboard_usage(
        &self,
        items: &[DashboardUsageItem],
    ) -> Result<(), StorageError>;

    /// Rebuilds the job index from the given pairs.
    async fn upsert_job_index(&self, pairs: &[JobIndexPair]) -> Result<(), StorageError>;

    /// Rebuilds the usage summary by joining the catalog with the usage
    /// tables and the query stream within `range`. Preserves on-demand
    /// `series_count` values.
    async fn refresh_usage_summary(&self, range: TimeRange) -> Result<(), StorageError>;

    /// Fills `series_count` of one summary row on demand.
    async fn set_series_count(&self, name: &str, count: i64) -> Result<(), StorageError>;

    // Analytics reads.

    async fn query_types(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<QueryTypesResult, StorageError>;

    async fn average_duration(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<TimePoint>, StorageError>;

    async fn query_rate(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<QueryRatePoint>, StorageError>;

    async fn status_distribution(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<StatusDistributionPoint>, StorageError>;

    async fn latency_trends(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<LatencyTrendPoint>, StorageError>;

    async fn error_analysis(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<ErrorAnalysisPoint>, StorageError>;

    async fn time_range_distribution(
        &self,
        range: TimeRange,
    ) -> Result<Vec<TimeRangeBucket>, StorageError>;

    async fn throughput_analysis(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<ThroughputPoint>, StorageError>;

    async fn query_expressions(
        &self,
        range: TimeRange,
        page: PageParams,
        sort: SortSpec,
    ) -> Result<Paged<QueryExpression>, StorageError>;

    async fn query_executions(
        &self,
        range: TimeRange,
        fingerprint: &str,
        page: PageParams,
    ) -> Result<Paged<QueryExecutionRow>, StorageError>;

    // Catalog reads.

    async fn series_metadata(
        &self,
        params: &SeriesMetadataParams,
    ) -> Result<Paged<SeriesMetadataRow>, StorageError>;

    /// Batched usage lookup by names, optionally scoped to metrics indexed
    /// under `job`. Names absent from the catalog produce no row.
    async fn series_metadata_by_names(
        &self,
        names: &[String],
        job: Option<&str>,
    ) -> Result<Vec<MetricUsageCounts>, StorageError>;

    async fn metric_statistics(
        &self,
        name: &str,
        range: TimeRange,
    ) -> Result<MetricStatistics, StorageError>;

    async fn metric_query_performance(
        &self,
        name: &str,
        range: TimeRange,
    ) -> Result<MetricQueryPerformance, StorageError>;

    async fn queries_by_serie_name(
        &self,
        name: &str,
        range: TimeRange,
        page: PageParams,
    ) -> Result<Paged<QueryExpression>, StorageError>;

    async fn rules_usage(
        &self,
        serie: &str,
        kind: RuleKind,
        page: PageParams,
    ) -> Result<Paged<RulesUsageRow>, StorageError>;

    async fn dashboard_usage(
        &self,
        serie: &str,
        page: PageParams,
    ) -> Result<Paged<DashboardUsageRow>, StorageError>;

    async fn list_jobs(&self) -> Result<Vec<String>, StorageError>;
}

/// Connects the adapter selected by the settings and migrates its schema
/// to the latest version.
pub async fn connect(settings: &DatabaseSettings) -> BootstrapResult<Arc<dyn Store>> {
    Ok(match settings.provider {
        DatabaseProvider::Postgres => {
            Arc::new(postgres::PostgresStore::connect(&settings.postgres).await?)
        }
        DatabaseProvider::Sqlite => {
            Arc::new(sqlite::SqliteStore::connect(&settings.sqlite).await?)
        }
    })
}

/// Escapes LIKE pattern metacharacters in user-supplied text.
pub(crate) fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// LIKE pattern matching a serialized label-matcher set referencing the
/// given metric name.
pub(crate) fn name_matcher_pattern(name: &str) -> String {
    format!("%\"__name__\":\"{}\"%", escape_like(name))
}

/// Decoded row shape shared by the two adapters' `series_metadata` reads.
pub(crate) type SeriesRowTuple = (
    String,
    String,
    String,
    String,
    Option<DateTime<Utc>>,
    i64,
    i64,
    i64,
    i64,
    Option<DateTime<Utc>>,
    i64,
);

pub(crate) fn series_row_from_tuple(row: SeriesRowTuple) -> SeriesMetadataRow {
    let (
        name,
        metric_type,
        help,
        unit,
        last_synced_at,
        alert_count,
        record_count,
        dashboard_count,
        query_count,
        last_queried_at,
        series_count,
    ) = row;

    SeriesMetadataRow {
        name,
        metric_type: MetricType::parse(&metric_type),
        help,
        unit,
        last_synced_at,
        alert_count,
        record_count,
        dashboard_count,
        query_count,
        last_queried_at,
        series_count,
    }
}

/// Converts an epoch-second bucket computed in SQL back to a timestamp.
pub(crate) fn bucket_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// The canonical order of the range-span buckets.
pub(crate) const TIME_RANGE_BUCKETS: &[&str] = &["<1h", "1h-6h", "6h-24h", "1d-7d", ">7d"];

/// Reorders the SQL bucket counts into canonical order, filling gaps with
/// zeroes.
pub(crate) fn fill_time_range_buckets(rows: Vec<(String, i64)>) -> Vec<TimeRangeBucket> {
    TIME_RANGE_BUCKETS
        .iter()
        .map(|label| TimeRangeBucket {
            range: (*label).to_owned(),
            count: rows
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, c)| *c)
                .unwrap_or(0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(range: TimeRange) -> i64 {
        range.bucket_secs()
    }

    fn range_of(hours: i64) -> TimeRange {
        let to = Utc::now();

        TimeRange {
            from: to - Duration::hours(hours),
            to,
        }
    }

    #[test]
    fn bucket_width_follows_the_span_table() {
        assert_eq!(span(range_of(1)), 60);
        assert_eq!(span(range_of(2)), 60);
        assert_eq!(span(range_of(3)), 300);
        assert_eq!(span(range_of(6)), 300);
        assert_eq!(span(range_of(12)), 900);
        assert_eq!(span(range_of(24)), 900);
        assert_eq!(span(range_of(25)), 3600);
        assert_eq!(span(range_of(7 * 24)), 3600);
        assert_eq!(span(range_of(8 * 24)), 6 * 3600);
        assert_eq!(span(range_of(30 * 24)), 6 * 3600);
        assert_eq!(span(range_of(31 * 24)), 86400);
        assert_eq!(span(range_of(90 * 24)), 86400);
        assert_eq!(span(range_of(365 * 24)), 86400);
    }

    #[test]
    fn bucket_selection_is_deterministic() {
        let range = range_of(5);

        assert_eq!(range.bucket_secs(), range.bucket_secs());
    }

    #[test]
    fn paged_computes_total_pages() {
        let page = PageParams {
            page: 1,
            page_size: 10,
        };

        assert_eq!(Paged::<u32>::new(vec![], 0, page).total_pages, 0);
        assert_eq!(Paged::<u32>::new(vec![], 10, page).total_pages, 1);
        assert_eq!(Paged::<u32>::new(vec![], 11, page).total_pages, 2);
        assert_eq!(Paged::<u32>::new(vec![], 100, page).total_pages, 10);
    }

    #[test]
    fn unused_requires_all_four_counts_zero() {
        let mut counts = MetricUsageCounts {
            name: "up".into(),
            alert_count: 0,
            record_count: 0,
            dashboard_count: 0,
            query_count: 0,
        };

        assert!(counts.is_unused());

        counts.dashboard_count = 1;
        assert!(!counts.is_unused());
    }

    #[test]
    fn like_escaping_covers_metacharacters() {
        assert_eq!(escape_like("http_requests"), "http\\_requests");
        assert_eq!(escape_like("50%"), "50\\%");
    }

    #[test]
    fn missing_range_buckets_are_zero_filled() {
        let filled = fill_time_range_buckets(vec![("1h-6h".into(), 3)]);

        assert_eq!(filled.len(), TIME_RANGE_BUCKETS.len());
        assert_eq!(filled[0].count, 0);
        assert_eq!(filled[1].count, 3);
    }
}
