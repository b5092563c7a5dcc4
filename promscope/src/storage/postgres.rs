//! Server-grade PostgreSQL adapter.
//!
//! Numbered placeholders, `date_bin`-based time bucketing, real percentile
//! aggregates.

use super::*;
use crate::settings::PostgresSettings;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::str::FromStr;
use std::time::Duration as StdDuration;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

/// Rows inserted per statement when rebuilding the job index.
const JOB_INDEX_CHUNK: usize = 5000;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects to the database and migrates the schema to the latest
    /// version.
    pub async fn connect(settings: &PostgresSettings) -> Result<Self, StorageError> {
        let options = PgConnectOptions::from_str(&settings.url)
            .map_err(sqlx::Error::from)?
            .application_name("promscope");

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(StdDuration::from_secs(settings.connect_timeout_secs))
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    fn series_sort_expr(by: &str) -> &'static str {
        match by {
            "type" => "c.metric_type",
            "alert_count" => "alert_count",
            "record_count" => "record_count",
            "dashboard_count" => "dashboard_count",
            "query_count" => "query_count",
            "last_queried_at" => "last_queried_at",
            "series_count" => "series_count",
            _ => "c.name",
        }
    }

    fn expressions_sort_expr(by: &str) -> &'static str {
        match by {
            "avg_duration" => "avg_duration_ms",
            "peak_samples" => "peak_samples",
            _ => "executions",
        }
    }
}

/// Epoch-second bucket expression over the `ts` column; `$1` is the bucket
/// width in seconds.
const BUCKET_EXPR: &str =
    "extract(epoch from date_bin(make_interval(secs => $1), ts, 'epoch'::timestamptz))::bigint";

#[async_trait]
impl Store for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn ingest_batch(&self, queries: &[QueryRecord]) -> Result<(), StorageError> {
        if queries.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO queries \
             (ts, fingerprint, query_param, query_type, time_param, start_ts, end_ts, \
              step_sec, status_code, duration_ms, body_size, total_queryable_samples, \
              peak_samples, label_matchers) ",
        );

        qb.push_values(queries, |mut b, q| {
            b.push_bind(q.ts)
                .push_bind(&q.fingerprint)
                .push_bind(&q.query_param)
                .push_bind(q.query_type.as_str())
                .push_bind(q.time_param)
                .push_bind(q.start)
                .push_bind(q.end)
                .push_bind(q.step)
                .push_bind(i32::from(q.status_code))
                .push_bind(q.duration_ms)
                .push_bind(q.body_size)
                .push_bind(q.total_queryable_samples)
                .push_bind(q.peak_samples)
                .push_bind(q.label_matchers_json());
        });

        qb.build().execute(&self.pool).await?;

        Ok(())
    }

    async fn upsert_metrics_catalog(
        &self,
        items: &[MetricCatalogItem],
    ) -> Result<(), StorageError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO metrics_catalog (name, metric_type, help, unit, last_synced_at) ",
        );

        qb.push_values(items, |mut b, item| {
            b.push_bind(&item.name)
                .push_bind(item.metric_type.as_str())
                .push_bind(&item.help)
                .push_bind(&item.unit)
                .push_bind(item.last_synced_at);
        });

        // Keep richer existing metadata over unknown or empty incoming
        // fields.
        qb.push(
            " ON CONFLICT (name) DO UPDATE SET \
             metric_type = CASE WHEN excluded.metric_type <> 'unknown' \
                 THEN excluded.metric_type ELSE metrics_catalog.metric_type END, \
             help = COALESCE(NULLIF(excluded.help, ''), metrics_catalog.help), \
             unit = COALESCE(NULLIF(excluded.unit, ''), metrics_catalog.unit), \
             last_synced_at = excluded.last_synced_at",
        );

        qb.build().execute(&self.pool).await?;

        Ok(())
    }

    async fn replace_rules_usage(
        &self,
        kind: RuleKind,
        items: &[RulesUsageItem],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rules_usage WHERE kind = $1")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;

        if !items.is_empty() {
            let now = Utc::now();
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO rules_usage (serie, group_name, name, expression, kind, created_at) ",
            );

            qb.push_values(items, |mut b, item| {
                b.push_bind(&item.serie)
                    .push_bind(&item.group_name)
                    .push_bind(&item.name)
                    .push_bind(&item.expression)
                    .push_bind(item.kind.as_str())
                    .push_bind(now);
            });
            qb.push(" ON CONFLICT (serie, group_name, name, kind) DO NOTHING");

            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn replace_dashboard_usage(
        &self,
        items: &[DashboardUsageItem],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM dashboard_usage")
            .execute(&mut *tx)
            .await?;

        if !items.is_empty() {
            let now = Utc::now();
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO dashboard_usage (serie, dashboard_id, name, url, created_at) ",
            );

            qb.push_values(items, |mut b, item| {
                b.push_bind(&item.serie)
                    .push_bind(&item.id)
                    .push_bind(&item.name)
                    .push_bind(&item.url)
                    .push_bind(now);
            });
            qb.push(" ON CONFLICT (serie, dashboard_id) DO NOTHING");

            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn upsert_job_index(&self, pairs: &[JobIndexPair]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM job_index").execute(&mut *tx).await?;

        for chunk in pairs.chunks(JOB_INDEX_CHUNK) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO job_index (job, metric_name) ");

            qb.push_values(chunk, |mut b, pair| {
                b.push_bind(&pair.job).push_bind(&pair.metric_name);
            });
            qb.push(" ON CONFLICT (job, metric_name) DO NOTHING");

            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn refresh_usage_summary(&self, range: TimeRange) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO metrics_usage_summary \
             (name, alert_count, record_count, dashboard_count, query_count, \
              last_queried_at, refreshed_at) \
             SELECT c.name, \
                 (SELECT COUNT(*) FROM rules_usage r \
                  WHERE r.serie = c.name AND r.kind = 'alert'), \
                 (SELECT COUNT(*) FROM rules_usage r \
                  WHERE r.serie = c.name AND r.kind = 'record'), \
                 (SELECT COUNT(*) FROM dashboard_usage d WHERE d.serie = c.name), \
                 (SELECT COUNT(*) FROM queries q \
                  WHERE q.ts >= $1 AND q.ts <= $2 AND q.label_matchers LIKE \
                  '%\"__name__\":\"' || REPLACE(c.name, '_', '\\_') || '\"%' ESCAPE '\\'), \
                 (SELECT MAX(q.ts) FROM queries q \
                  WHERE q.ts >= $1 AND q.ts <= $2 AND q.label_matchers LIKE \
                  '%\"__name__\":\"' || REPLACE(c.name, '_', '\\_') || '\"%' ESCAPE '\\'), \
                 $3 \
             FROM metrics_catalog c \
             ON CONFLICT (name) DO UPDATE SET \
                 alert_count = excluded.alert_count, \
                 record_count = excluded.record_count, \
                 dashboard_count = excluded.dashboard_count, \
                 query_count = excluded.query_count, \
                 last_queried_at = excluded.last_queried_at, \
                 refreshed_at = excluded.refreshed_at",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_series_count(&self, name: &str, count: i64) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO metrics_usage_summary (name, series_count) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET series_count = excluded.series_count",
        )
        .bind(name)
        .bind(count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_types(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<QueryTypesResult, StorageError> {
        let (total, instant): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN query_type = 'instant' THEN 1 ELSE 0 END), 0) \
             FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND ($3::text IS NULL OR fingerprint = $3)",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await?;

        Ok(if total == 0 {
            QueryTypesResult::default()
        } else {
            QueryTypesResult {
                total_queries: total,
                instant_percent: instant as f64 * 100.0 / total as f64,
                range_percent: (total - instant) as f64 * 100.0 / total as f64,
            }
        })
    }

    async fn average_duration(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<TimePoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, AVG(duration_ms) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, Option<f64>)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, value)| TimePoint {
                ts: bucket_ts(bucket),
                value: value.unwrap_or(0.0),
            })
            .collect())
    }

    async fn query_rate(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<QueryRatePoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, \
                 COALESCE(SUM(CASE WHEN status_code < 400 THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, success, error)| QueryRatePoint {
                ts: bucket_ts(bucket),
                success,
                error,
            })
            .collect())
    }

    async fn status_distribution(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<StatusDistributionPoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, \
                 COALESCE(SUM(CASE WHEN status_code BETWEEN 200 AND 299 THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN status_code BETWEEN 400 AND 499 THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN status_code >= 500 THEN 1 ELSE 0 END), 0) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(bucket, status_2xx, status_4xx, status_5xx)| StatusDistributionPoint {
                    ts: bucket_ts(bucket),
                    status_2xx,
                    status_4xx,
                    status_5xx,
                },
            )
            .collect())
    }

    async fn latency_trends(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<LatencyTrendPoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, AVG(duration_ms), \
                 percentile_cont(0.95) WITHIN GROUP (ORDER BY duration_ms) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, Option<f64>, Option<f64>)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, avg, p95)| LatencyTrendPoint {
                ts: bucket_ts(bucket),
                avg_ms: avg.unwrap_or(0.0),
                p95_ms: p95.unwrap_or(0.0),
            })
            .collect())
    }

    async fn error_analysis(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<ErrorAnalysisPoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, \
                 COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0), \
                 COUNT(*) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, errors, total)| ErrorAnalysisPoint {
                ts: bucket_ts(bucket),
                errors,
                total,
            })
            .collect())
    }

    async fn time_range_distribution(
        &self,
        range: TimeRange,
    ) -> Result<Vec<TimeRangeBucket>, StorageError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT CASE \
                 WHEN span < 3600 THEN '<1h' \
                 WHEN span < 21600 THEN '1h-6h' \
                 WHEN span < 86400 THEN '6h-24h' \
                 WHEN span < 604800 THEN '1d-7d' \
                 ELSE '>7d' END AS label, \
                 COUNT(*) \
             FROM (SELECT extract(epoch from (end_ts - start_ts)) AS span \
                   FROM queries \
                   WHERE query_type = 'range' AND ts >= $1 AND ts <= $2) AS spans \
             GROUP BY label",
        )
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        Ok(fill_time_range_buckets(rows))
    }

    async fn throughput_analysis(
        &self,
        range: TimeRange,
        fingerprint: Option<&str>,
    ) -> Result<Vec<ThroughputPoint>, StorageError> {
        let sql = format!(
            "SELECT {BUCKET_EXPR} AS bucket, COUNT(*) \
             FROM queries \
             WHERE ts >= $2 AND ts <= $3 AND ($4::text IS NULL OR fingerprint = $4) \
             GROUP BY bucket ORDER BY bucket",
        );

        let rows: Vec<(i64, i64)> = sqlx::query_as(&sql)
            .bind(range.bucket_secs() as f64)
            .bind(range.from)
            .bind(range.to)
            .bind(fingerprint)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, count)| ThroughputPoint {
                ts: bucket_ts(bucket),
                count,
            })
            .collect())
    }

    async fn query_expressions(
        &self,
        range: TimeRange,
        page: PageParams,
        sort: SortSpec,
    ) -> Result<Paged<QueryExpression>, StorageError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT fingerprint) FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND fingerprint <> ''",
        )
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT fingerprint, MIN(query_param), COUNT(*) AS executions, \
                 AVG(duration_ms) AS avg_duration_ms, MAX(peak_samples) AS peak_samples \
             FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND fingerprint <> '' \
             GROUP BY fingerprint \
             ORDER BY {} {} \
             LIMIT $3 OFFSET $4",
            Self::expressions_sort_expr(&sort.by),
            sort.order.as_sql(),
        );

        let rows: Vec<(String, String, i64, Option<f64>, Option<i64>)> = sqlx::query_as(&sql)
            .bind(range.from)
            .bind(range.to)
            .bind(page.page_size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let data = rows
            .into_iter()
            .map(
                |(fingerprint, query_param, executions, avg, peak)| QueryExpression {
                    fingerprint,
                    query_param,
                    executions,
                    avg_duration_ms: avg.unwrap_or(0.0),
                    peak_samples: peak.unwrap_or(0),
                },
            )
            .collect();

        Ok(Paged::new(data, total as u64, page))
    }

    async fn query_executions(
        &self,
        range: TimeRange,
        fingerprint: &str,
        page: PageParams,
    ) -> Result<Paged<QueryExecutionRow>, StorageError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND fingerprint = $3",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(DateTime<Utc>, i64, f64, i64, i64)> = sqlx::query_as(
            "SELECT ts, status_code::bigint, duration_ms, total_queryable_samples, peak_samples \
             FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND fingerprint = $3 \
             ORDER BY ts DESC \
             LIMIT $4 OFFSET $5",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(fingerprint)
        .bind(page.page_size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let data = rows
            .into_iter()
            .map(
                |(ts, status_code, duration_ms, total_queryable_samples, peak_samples)| {
                    QueryExecutionRow {
                        ts,
                        status_code,
                        duration_ms,
                        total_queryable_samples,
                        peak_samples,
                    }
                },
            )
            .collect();

        Ok(Paged::new(data, total as u64, page))
    }

    async fn series_metadata(
        &self,
        params: &SeriesMetadataParams,
    ) -> Result<Paged<SeriesMetadataRow>, StorageError> {
        let mut predicates = String::new();
        let mut next_param = 1;

        if params.filter.is_some() {
            predicates.push_str(&format!(" AND c.name ILIKE ${next_param} ESCAPE '\\'"));
            next_param += 1;
        }
        if params.metric_type.is_some() {
            predicates.push_str(&format!(" AND c.metric_type = ${next_param}"));
            next_param += 1;
        }
        match params.unused {
            Some(true) => predicates.push_str(
                " AND COALESCE(s.alert_count, 0) = 0 AND COALESCE(s.record_count, 0) = 0 \
                 AND COALESCE(s.dashboard_count, 0) = 0 AND COALESCE(s.query_count, 0) = 0",
            ),
            Some(false) => predicates.push_str(
                " AND (COALESCE(s.alert_count, 0) > 0 OR COALESCE(s.record_count, 0) > 0 \
                 OR COALESCE(s.dashboard_count, 0) > 0 OR COALESCE(s.query_count, 0) > 0)",
            ),
            None => {}
        }
        if params.job.is_some() {
            predicates.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM job_index j \
                 WHERE j.metric_name = c.name AND j.job = ${next_param})",
            ));
            next_param += 1;
        }

        let filter_pattern = params
            .filter
            .as_deref()
            .map(|f| format!("%{}%", escape_like(f)));

        let count_sql = format!(
            "SELECT COUNT(*) FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             WHERE true{predicates}",
        );

        let mut count_query = sqlx::query_scalar(&count_sql);
        if let Some(pattern) = &filter_pattern {
            count_query = count_query.bind(pattern);
        }
        if let Some(metric_type) = params.metric_type {
            count_query = count_query.bind(metric_type.as_str());
        }
        if let Some(job) = &params.job {
            count_query = count_query.bind(job);
        }

        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let page_sql = format!(
            "SELECT c.name, c.metric_type, c.help, c.unit, c.last_synced_at, \
                 COALESCE(s.alert_count, 0) AS alert_count, \
                 COALESCE(s.record_count, 0) AS record_count, \
                 COALESCE(s.dashboard_count, 0) AS dashboard_count, \
                 COALESCE(s.query_count, 0) AS query_count, \
                 s.last_queried_at AS last_queried_at, \
                 COALESCE(s.series_count, 0) AS series_count \
             FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             WHERE true{predicates} \
             ORDER BY {} {} \
             LIMIT ${next_param} OFFSET ${}",
            Self::series_sort_expr(&params.sort.by),
            params.sort.order.as_sql(),
            next_param + 1,
        );

        let mut page_query = sqlx::query_as(&page_sql);
        if let Some(pattern) = &filter_pattern {
            page_query = page_query.bind(pattern);
        }
        if let Some(metric_type) = params.metric_type {
            page_query = page_query.bind(metric_type.as_str());
        }
        if let Some(job) = &params.job {
            page_query = page_query.bind(job);
        }

        let rows: Vec<SeriesRowTuple> = page_query
            .bind(params.page.page_size as i64)
            .bind(params.page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let data = rows.into_iter().map(series_row_from_tuple).collect();

        Ok(Paged::new(data, total as u64, params.page))
    }

    async fn series_metadata_by_names(
        &self,
        names: &[String],
        job: Option<&str>,
    ) -> Result<Vec<MetricUsageCounts>, StorageError> {
        if names.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT c.name, COALESCE(s.alert_count, 0), COALESCE(s.record_count, 0), \
             COALESCE(s.dashboard_count, 0), COALESCE(s.query_count, 0) \
             FROM metrics_catalog c \
             LEFT JOIN metrics_usage_summary s ON s.name = c.name \
             WHERE c.name IN (",
        );

        let mut separated = qb.separated(", ");
        for name in names {
            separated.push_bind(name);
        }
        qb.push(")");

        if let Some(job) = job {
            qb.push(
                " AND EXISTS (SELECT 1 FROM job_index j \
                 WHERE j.metric_name = c.name AND j.job = ",
            );
            qb.push_bind(job);
            qb.push(")");
        }

        let rows: Vec<(String, i64, i64, i64, i64)> =
            qb.build_query_as().fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(
                |(name, alert_count, record_count, dashboard_count, query_count)| {
                    MetricUsageCounts {
                        name,
                        alert_count,
                        record_count,
                        dashboard_count,
                        query_count,
                    }
                },
            )
            .collect())
    }

    async fn metric_statistics(
        &self,
        name: &str,
        range: TimeRange,
    ) -> Result<MetricStatistics, StorageError> {
        let pattern = name_matcher_pattern(name);

        type Row = (i64, i64, i64, i64, Option<DateTime<Utc>>, i64);

        let (alert_count, record_count, dashboard_count, query_count, last_queried_at, series_count): Row =
            sqlx::query_as(
                "SELECT \
                     (SELECT COUNT(*) FROM rules_usage WHERE serie = $1 AND kind = 'alert'), \
                     (SELECT COUNT(*) FROM rules_usage WHERE serie = $1 AND kind = 'record'), \
                     (SELECT COUNT(*) FROM dashboard_usage WHERE serie = $1), \
                     (SELECT COUNT(*) FROM queries \
                      WHERE ts >= $2 AND ts <= $3 AND label_matchers LIKE $4 ESCAPE '\\'), \
                     (SELECT MAX(ts) FROM queries \
                      WHERE ts >= $2 AND ts <= $3 AND label_matchers LIKE $4 ESCAPE '\\'), \
                     COALESCE((SELECT series_count FROM metrics_usage_summary WHERE name = $1), 0)",
            )
            .bind(name)
            .bind(range.from)
            .bind(range.to)
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;

        Ok(MetricStatistics {
            name: name.to_owned(),
            alert_count,
            record_count,
            dashboard_count,
            query_count,
            last_queried_at,
            series_count,
        })
    }

    async fn metric_query_performance(
        &self,
        name: &str,
        range: TimeRange,
    ) -> Result<MetricQueryPerformance, StorageError> {
        let pattern = name_matcher_pattern(name);

        let (total, avg, errors, avg_peak): (i64, Option<f64>, i64, Option<f64>) =
            sqlx::query_as(
                "SELECT COUNT(*), AVG(duration_ms), \
                     COALESCE(SUM(CASE WHEN status_code >= 400 THEN 1 ELSE 0 END), 0), \
                     AVG(peak_samples)::double precision \
                 FROM queries \
                 WHERE ts >= $1 AND ts <= $2 AND label_matchers LIKE $3 ESCAPE '\\'",
            )
            .bind(range.from)
            .bind(range.to)
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await?;

        Ok(MetricQueryPerformance {
            name: name.to_owned(),
            total_executions: total,
            avg_duration_ms: avg.unwrap_or(0.0),
            error_rate: if total == 0 {
                0.0
            } else {
                errors as f64 / total as f64
            },
            avg_peak_samples: avg_peak.unwrap_or(0.0),
        })
    }

    async fn queries_by_serie_name(
        &self,
        name: &str,
        range: TimeRange,
        page: PageParams,
    ) -> Result<Paged<QueryExpression>, StorageError> {
        let pattern = name_matcher_pattern(name);

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT fingerprint) FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND label_matchers LIKE $3 ESCAPE '\\'",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(String, String, i64, Option<f64>, Option<i64>)> = sqlx::query_as(
            "SELECT fingerprint, MIN(query_param), COUNT(*) AS executions, \
                 AVG(duration_ms), MAX(peak_samples) \
             FROM queries \
             WHERE ts >= $1 AND ts <= $2 AND label_matchers LIKE $3 ESCAPE '\\' \
             GROUP BY fingerprint \
             ORDER BY executions DESC \
             LIMIT $4 OFFSET $5",
        )
        .bind(range.from)
        .bind(range.to)
        .bind(&pattern)
        .bind(page.page_size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let data = rows
            .into_iter()
            .map(
                |(fingerprint, query_param, executions, avg, peak)| QueryExpression {
                    fingerprint,
                    query_param,
                    executions,
                    avg_duration_ms: avg.unwrap_or(0.0),
                    peak_samples: peak.unwrap_or(0),
                },
            )
            .collect();

        Ok(Paged::new(data, total as u64, page))
    }

    async fn rules_usage(
        &self,
        serie: &str,
        kind: RuleKind,
        page: PageParams,
    ) -> Result<Paged<RulesUsageRow>, StorageError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rules_usage WHERE serie = $1 AND kind = $2",
        )
        .bind(serie)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        let rows: Vec<(String, String, String, String, String, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                "SELECT serie, group_name, name, expression, kind, created_at \
                 FROM rules_usage \
                 WHERE serie = $1 AND kind = $2 \
                 ORDER BY group_name, name \
                 LIMIT $3 OFFSET $4",
            )
            .bind(serie)
            .bind(kind.as_str())
            .bind(page.page_size as i64)
            .bind(page.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let data = rows
            .into_iter()
            .map(
                |(serie, group_name, name, expression, kind, created_at)| RulesUsageRow {
                    serie,
                    group_name,
                    name,
                    expression,
                    kind: RuleKind::parse(&kind).unwrap_or(RuleKind::Record),
                    created_at,
                },
            )
            .collect();

        Ok(Paged::new(data, total as u64, page))
    }

    async fn dashboard_usage(
        &self,
        serie: &str,
        page: PageParams,
    ) -> Result<Paged<DashboardUsageRow>, StorageError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dashboard_usage WHERE serie = $1")
                .bind(serie)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<(String, String, String, String, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT serie, dashboard_id, name, url, created_at \
             FROM dashboard_usage \
             WHERE serie = $1 \
             ORDER BY name, dashboard_id \
             LIMIT $2 OFFSET $3",
        )
        .bind(serie)
        .bind(page.page_size as i64)
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let data = rows
            .into_iter()
            .map(|(serie, id, name, url, created_at)| DashboardUsageRow {
                serie,
                id,
                name,
                url,
                created_at,
            })
            .collect();

        Ok(Paged::new(data, total as u64, page))
    }

    async fn list_jobs(&self) -> Result<Vec<String>, StorageError> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT job FROM job_index ORDER BY job")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}
