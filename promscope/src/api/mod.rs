//! Analytics and catalog read side, plus the usage-push and backfill
//! write endpoints.
//!
//! Handlers translate errors exactly once at this boundary: client errors
//! become 400s with a JSON body, storage and upstream failures are logged
//! with context and surface as sanitized 500s.

pub mod params;

use crate::ingest;
use crate::proxy::{full_body, AppState, RouteBody};
use crate::settings;
use crate::storage::{
    DashboardUsageItem, MetricType, RuleKind, RulesUsageItem, SeriesMetadataParams, SortOrder,
    StorageError, EXPRESSIONS_SORT_FIELDS, SERIES_METADATA_SORT_FIELDS,
};
use crate::telemetry::metrics as service_metrics;
use http::{header, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use self::params::RawParams;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Maximum number of names accepted by the unused-metrics lookup.
const MAX_UNUSED_LOOKUP_NAMES: usize = 100;

/// Maximum accepted request body for the write endpoints.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Analytics API error, translated to a JSON response at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Internal(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self, state: &AppState) -> Response<RouteBody> {
        if let ApiError::Internal(e) = &self {
            slog::error!(state.log, "analytics request failed"; "error" => format!("{e:#}"));

            // The internal message stays in the log.
            return json_error(self.status(), "internal error");
        }

        json_error(self.status(), &self.to_string())
    }
}

/// Serializes a value as a JSON response.
pub fn json_response(value: &impl Serialize) -> Response<RouteBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(full_body(body))
            .unwrap(),
        Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
    }
}

/// A JSON error body of the shape `{"error": ..., "code": ...}`.
pub fn json_error(status: StatusCode, message: &str) -> Response<RouteBody> {
    let body = serde_json::to_vec(&json!({
        "error": message,
        "code": status.as_u16(),
    }))
    .unwrap_or_default();

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(full_body(body))
        .unwrap()
}

/// A plain-text response.
pub fn text_response(body: &'static str) -> Response<RouteBody> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .unwrap()
}

/// The Prometheus scrape endpoint.
pub fn metrics_response(state: &AppState) -> Response<RouteBody> {
    match service_metrics::collect() {
        Ok(body) => Response::builder()
            .header(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )
            .body(full_body(body))
            .unwrap(),
        Err(e) => {
            slog::error!(state.log, "metrics encoding failed"; "error" => %e);

            json_error(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
        }
    }
}

/// Query-string driven GET endpoints.
#[derive(Clone, Copy, Debug)]
pub enum Endpoint {
    QueryTypes,
    AverageDuration,
    QueryRate,
    StatusDistribution,
    Latency,
    Throughput,
    Errors,
    TimeRangeDistribution,
    Expressions,
    Executions,
    SeriesMetadata,
    Jobs,
    UnusedMetrics,
    Configs,
}

/// GET endpoints with a trailing metric-name path parameter.
#[derive(Clone, Copy, Debug)]
pub enum NamedEndpoint {
    MetricStatistics,
    MetricQueryPerformance,
    SerieExpressions,
    SerieUsage,
}

pub async fn dispatch(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
    endpoint: Endpoint,
) -> Response<RouteBody> {
    let params = RawParams::from_query(req.uri().query());

    let res = match endpoint {
        Endpoint::QueryTypes => query_types(state, &params).await,
        Endpoint::AverageDuration => average_duration(state, &params).await,
        Endpoint::QueryRate => query_rate(state, &params).await,
        Endpoint::StatusDistribution => status_distribution(state, &params).await,
        Endpoint::Latency => latency(state, &params).await,
        Endpoint::Throughput => throughput(state, &params).await,
        Endpoint::Errors => errors(state, &params).await,
        Endpoint::TimeRangeDistribution => time_range_distribution(state, &params).await,
        Endpoint::Expressions => expressions(state, &params).await,
        Endpoint::Executions => executions(state, &params).await,
        Endpoint::SeriesMetadata => series_metadata(state, &params).await,
        Endpoint::Jobs => jobs(state).await,
        Endpoint::UnusedMetrics => unused_metrics(state, &params).await,
        Endpoint::Configs => configs(state),
    };

    res.unwrap_or_else(|e| e.into_response(state))
}

pub async fn dispatch_named(
    state: &Arc<AppState>,
    req: &Request<Incoming>,
    name: &str,
    endpoint: NamedEndpoint,
) -> Response<RouteBody> {
    let params = RawParams::from_query(req.uri().query());

    let res = match endpoint {
        NamedEndpoint::MetricStatistics => metric_statistics(state, name, &params).await,
        NamedEndpoint::MetricQueryPerformance => {
            metric_query_performance(state, name, &params).await
        }
        NamedEndpoint::SerieExpressions => serie_expressions(state, name, &params).await,
        NamedEndpoint::SerieUsage => serie_usage(state, name, &params).await,
    };

    res.unwrap_or_else(|e| e.into_response(state))
}

type ApiResult = Result<Response<RouteBody>, ApiError>;

async fn query_types(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state.store.query_types(range, fingerprint.as_deref()).await?,
    ))
}

async fn average_duration(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state
            .store
            .average_duration(range, fingerprint.as_deref())
            .await?,
    ))
}

async fn query_rate(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state.store.query_rate(range, fingerprint.as_deref()).await?,
    ))
}

async fn status_distribution(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state
            .store
            .status_distribution(range, fingerprint.as_deref())
            .await?,
    ))
}

async fn latency(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state
            .store
            .latency_trends(range, fingerprint.as_deref())
            .await?,
    ))
}

async fn throughput(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state
            .store
            .throughput_analysis(range, fingerprint.as_deref())
            .await?,
    ))
}

async fn errors(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let fingerprint = params::parse_fingerprint(params);

    Ok(json_response(
        &state
            .store
            .error_analysis(range, fingerprint.as_deref())
            .await?,
    ))
}

async fn time_range_distribution(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;

    Ok(json_response(
        &state.store.time_range_distribution(range).await?,
    ))
}

async fn expressions(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let page = params::parse_page(params)?;
    let sort = params::parse_sort(
        params,
        EXPRESSIONS_SORT_FIELDS,
        "executions",
        SortOrder::Desc,
        &state.log,
    );

    Ok(json_response(
        &state.store.query_expressions(range, page, sort).await?,
    ))
}

async fn executions(state: &AppState, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let page = params::parse_page(params)?;
    let fingerprint = params::parse_fingerprint(params)
        .ok_or_else(|| ApiError::BadRequest("fingerprint parameter is required".into()))?;

    Ok(json_response(
        &state
            .store
            .query_executions(range, &fingerprint, page)
            .await?,
    ))
}

async fn series_metadata(state: &AppState, params: &RawParams) -> ApiResult {
    let page = params::parse_page(params)?;
    let sort = params::parse_sort(
        params,
        SERIES_METADATA_SORT_FIELDS,
        "name",
        SortOrder::Asc,
        &state.log,
    );

    let metric_type = match params.get("type") {
        None | Some("") => None,
        Some(raw @ ("counter" | "gauge" | "histogram" | "summary" | "unknown")) => {
            Some(MetricType::parse(raw))
        }
        Some(raw) => {
            return Err(ApiError::BadRequest(format!("unknown metric type {raw:?}")));
        }
    };

    let unused = match params.get("unused") {
        None | Some("") => None,
        Some("true") => Some(true),
        Some("false") => Some(false),
        Some(raw) => {
            return Err(ApiError::BadRequest(format!("invalid unused flag {raw:?}")));
        }
    };

    let query = SeriesMetadataParams {
        page,
        sort,
        filter: params.get("filter").filter(|f| !f.is_empty()).map(str::to_owned),
        metric_type,
        unused,
        job: params.get("job").filter(|j| !j.is_empty()).map(str::to_owned),
    };

    Ok(json_response(&state.store.series_metadata(&query).await?))
}

async fn jobs(state: &AppState) -> ApiResult {
    Ok(json_response(&state.store.list_jobs().await?))
}

async fn unused_metrics(state: &AppState, params: &RawParams) -> ApiResult {
    let names: Vec<String> = params
        .get("name")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .collect();

    if names.is_empty() {
        return Err(ApiError::BadRequest("name parameter is required".into()));
    }

    if names.len() > MAX_UNUSED_LOOKUP_NAMES {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_UNUSED_LOOKUP_NAMES} names per lookup"
        )));
    }

    let job = params.get("job").filter(|j| !j.is_empty());
    let counts = state.store.series_metadata_by_names(&names, job).await?;

    let unused: Vec<&str> = counts
        .iter()
        .filter(|c| c.is_unused())
        .map(|c| c.name.as_str())
        .collect();

    Ok(json_response(&json!({ "unused": unused })))
}

fn configs(state: &AppState) -> ApiResult {
    Ok(json_response(&settings::sanitized(state.settings.as_ref())))
}

async fn metric_statistics(state: &AppState, name: &str, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;

    let mut stats = state.store.metric_statistics(name, range).await?;

    // `series_count` is filled on demand from the upstream; failures keep
    // the stored value.
    if let Ok(count) = state.prom.series_count(name).await {
        if state.store.set_series_count(name, count).await.is_ok() {
            stats.series_count = count;
        }
    }

    Ok(json_response(&stats))
}

async fn metric_query_performance(state: &AppState, name: &str, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;

    Ok(json_response(
        &state.store.metric_query_performance(name, range).await?,
    ))
}

async fn serie_expressions(state: &AppState, name: &str, params: &RawParams) -> ApiResult {
    let range = params::parse_time_range(params)?;
    let page = params::parse_page(params)?;

    Ok(json_response(
        &state.store.queries_by_serie_name(name, range, page).await?,
    ))
}

async fn serie_usage(state: &AppState, name: &str, params: &RawParams) -> ApiResult {
    let page = params::parse_page(params)?;

    match params.get("kind") {
        Some("alert") => Ok(json_response(
            &state.store.rules_usage(name, RuleKind::Alert, page).await?,
        )),
        Some("record") => Ok(json_response(
            &state.store.rules_usage(name, RuleKind::Record, page).await?,
        )),
        Some("dashboard") => Ok(json_response(
            &state.store.dashboard_usage(name, page).await?,
        )),
        other => Err(ApiError::BadRequest(format!(
            "kind must be alert, record or dashboard, got {other:?}"
        ))),
    }
}

/// Usage push payload from an external collector.
#[derive(Debug, Deserialize)]
struct UsagePush {
    kind: String,
    #[serde(default)]
    usages: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RulePush {
    serie: String,
    #[serde(default)]
    group_name: String,
    name: String,
    #[serde(default)]
    expression: String,
}

#[derive(Debug, Deserialize)]
struct DashboardPush {
    serie: String,
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

/// `POST /api/v1/metrics`: replaces a usage table from an external
/// collector's push.
pub async fn handle_usage_push(state: &Arc<AppState>, req: Request<Incoming>) -> Response<RouteBody> {
    let res = usage_push(state, req).await;

    res.unwrap_or_else(|e| e.into_response(state))
}

async fn usage_push(state: &AppState, req: Request<Incoming>) -> ApiResult {
    let push: UsagePush = read_json_body(req).await?;

    match push.kind.as_str() {
        kind @ ("alert" | "record") => {
            let kind = RuleKind::parse(kind).unwrap_or(RuleKind::Alert);
            let usages: Vec<RulePush> = serde_json::from_value(push.usages)
                .map_err(|e| ApiError::BadRequest(format!("invalid usages: {e}")))?;

            let items: Vec<RulesUsageItem> = usages
                .into_iter()
                .map(|u| RulesUsageItem {
                    serie: u.serie,
                    group_name: u.group_name,
                    name: u.name,
                    expression: u.expression,
                    kind,
                })
                .collect();

            state.store.replace_rules_usage(kind, &items).await?;

            Ok(json_response(&json!({ "replaced": items.len() })))
        }
        "dashboard" => {
            let usages: Vec<DashboardPush> = serde_json::from_value(push.usages)
                .map_err(|e| ApiError::BadRequest(format!("invalid usages: {e}")))?;

            let items: Vec<DashboardUsageItem> = usages
                .into_iter()
                .map(|u| DashboardUsageItem {
                    serie: u.serie,
                    id: u.id,
                    name: u.name,
                    url: u.url,
                })
                .collect();

            state.store.replace_dashboard_usage(&items).await?;

            Ok(json_response(&json!({ "replaced": items.len() })))
        }
        other => Err(ApiError::BadRequest(format!(
            "kind must be alert, record or dashboard, got {other:?}"
        ))),
    }
}

/// Offline ingestion payload.
#[derive(Debug, Deserialize)]
struct BackfillPush {
    queries: Vec<crate::storage::QueryRecord>,
}

/// `POST /api/v1/backfill`: validates and bulk-inserts records directly,
/// bypassing the queue.
pub async fn handle_backfill(state: &Arc<AppState>, req: Request<Incoming>) -> Response<RouteBody> {
    let res = backfill(state, req).await;

    res.unwrap_or_else(|e| e.into_response(state))
}

async fn backfill(state: &AppState, req: Request<Incoming>) -> ApiResult {
    let push: BackfillPush = read_json_body(req).await?;

    for (i, record) in push.queries.iter().enumerate() {
        if let Err(reason) = ingest::validate(record) {
            return Err(ApiError::BadRequest(format!(
                "invalid record at index {i}: {reason}"
            )));
        }
    }

    state.store.ingest_batch(&push.queries).await?;

    Ok(json_response(&json!({ "ingested": push.queries.len() })))
}

async fn read_json_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, ApiError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?
        .to_bytes();

    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge);
    }

    serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}
