//! Interception of `/api/v1/query` and `/api/v1/query_range`.
//!
//! The handler parses the query parameters, forwards the request with its
//! body intact (optionally injecting the upstream `stats` parameter), taps
//! the response for status, size and the sample-statistics block, records a
//! [`QueryRecord`] through the ingestion queue, and returns the original
//! upstream bytes unchanged.

use super::fingerprint::query_shape;
use super::upstream::strip_hop_by_hop;
use super::{full_body, AppState, RouteBody};
use crate::api::json_error;
use crate::ingest::IngestError;
use crate::storage::{QueryRecord, QueryType};
use crate::telemetry::metrics::{metrics, ProxyLabels};
use chrono::{DateTime, TimeZone, Utc};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use std::collections::HashMap;
use std::time::Instant;

/// Which intercepted endpoint is being served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TapEndpoint {
    Query,
    QueryRange,
}

impl TapEndpoint {
    fn label(&self) -> &'static str {
        match self {
            TapEndpoint::Query => "query",
            TapEndpoint::QueryRange => "query_range",
        }
    }

    fn query_type(&self) -> QueryType {
        match self {
            TapEndpoint::Query => QueryType::Instant,
            TapEndpoint::QueryRange => QueryType::Range,
        }
    }
}

/// Serves one intercepted query request.
pub async fn record_and_forward(
    state: &AppState,
    req: Request<Incoming>,
    endpoint: TapEndpoint,
) -> Response<RouteBody> {
    let (parts, body) = req.into_parts();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            slog::warn!(state.log, "failed to read request body"; "error" => %e);
            return json_error(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let is_form_post = parts.method == Method::POST
        && parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    let mut params: HashMap<String, String> = HashMap::new();
    if let Some(query) = parts.uri.query() {
        params.extend(parse_form(query.as_bytes()));
    }
    if is_form_post {
        params.extend(parse_form(&body_bytes));
    }

    let expr = params.get("query").cloned().unwrap_or_default();
    let ts = Utc::now();

    let mut record = QueryRecord {
        ts,
        fingerprint: String::new(),
        query_param: expr.clone(),
        query_type: endpoint.query_type(),
        time_param: None,
        start: None,
        end: None,
        step: None,
        status_code: 0,
        duration_ms: 0.0,
        body_size: 0,
        total_queryable_samples: 0,
        peak_samples: 0,
        label_matchers: vec![],
    };

    match endpoint {
        TapEndpoint::Query => {
            record.time_param = params.get("time").and_then(|v| parse_prom_time(v));
        }
        TapEndpoint::QueryRange => {
            record.start = params.get("start").and_then(|v| parse_prom_time(v));
            record.end = params.get("end").and_then(|v| parse_prom_time(v));
            record.step = params.get("step").and_then(|v| parse_prom_duration(v));

            // Reject bad windows before spending an upstream round-trip;
            // no record is written for rejected requests.
            if let Err(reason) = validate_range_params(&record) {
                return json_error(StatusCode::BAD_REQUEST, reason);
            }
        }
    }

    let shape = query_shape(&expr);
    record.fingerprint = shape.fingerprint;
    record.label_matchers = shape.label_matchers;

    // Re-assemble the upstream request with the body it arrived with,
    // optionally asking the upstream for sample statistics.
    let inject_stats = state.settings.upstream.include_query_stats && !params.contains_key("stats");

    let mut uri = parts.uri.clone();
    let mut outgoing_body = body_bytes.clone();

    if inject_stats {
        if is_form_post {
            outgoing_body = append_form_param(&body_bytes, "stats=all");
        } else {
            uri = append_query_param(&parts.uri, "stats=all");
        }
    }

    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(uri);
    for (name, value) in &parts.headers {
        upstream_req = upstream_req.header(name, value);
    }
    if is_form_post {
        upstream_req = upstream_req.header(header::CONTENT_LENGTH, outgoing_body.len());
    }

    let upstream_req = match upstream_req.body(full_body(outgoing_body)) {
        Ok(req) => req,
        Err(e) => {
            slog::error!(state.log, "failed to build upstream request"; "error" => %e);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "bad upstream request");
        }
    };

    let started = Instant::now();
    let upstream_res = state.upstream.forward(upstream_req).await;

    let response = match upstream_res {
        Ok(res) => {
            let (mut res_parts, res_body) = res.into_parts();

            let res_bytes = match res_body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    slog::warn!(state.log, "failed to read upstream response"; "error" => %e);
                    record.duration_ms = elapsed_ms(started);
                    record.status_code = StatusCode::BAD_GATEWAY.as_u16();
                    submit(state, record, endpoint).await;
                    return json_error(StatusCode::BAD_GATEWAY, "upstream body read failed");
                }
            };

            record.duration_ms = elapsed_ms(started);
            record.status_code = res_parts.status.as_u16();
            record.body_size = res_bytes.len() as i64;

            if res_parts.status.is_success() {
                let (total, peak) = extract_sample_stats(&res_bytes);
                record.total_queryable_samples = total;
                record.peak_samples = peak;
            }

            strip_hop_by_hop(&mut res_parts.headers);
            // The body is re-materialized; let the server recompute the
            // length.
            res_parts.headers.remove(header::CONTENT_LENGTH);

            Response::from_parts(res_parts, full_body(res_bytes))
        }
        Err(e) => {
            slog::warn!(state.log, "upstream call failed";
                "endpoint" => endpoint.label(), "error" => %e);
            metrics().proxy_upstream_errors.inc();

            record.duration_ms = elapsed_ms(started);
            record.status_code = StatusCode::BAD_GATEWAY.as_u16();

            json_error(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    };

    submit(state, record, endpoint).await;

    response
}

async fn submit(state: &AppState, record: QueryRecord, endpoint: TapEndpoint) {
    metrics()
        .proxy_requests
        .get_or_create(&ProxyLabels {
            endpoint: endpoint.label().to_owned(),
            status: record.status_code.to_string(),
        })
        .inc();

    if let Err(e) = state.ingestor.ingest(record).await {
        match e {
            IngestError::Backpressure => {
                slog::warn!(state.log, "analytics record dropped under backpressure");
            }
            e => slog::warn!(state.log, "analytics record rejected"; "error" => %e),
        }
    }
}

fn validate_range_params(record: &QueryRecord) -> Result<(), &'static str> {
    let (Some(start), Some(end)) = (record.start, record.end) else {
        return Err("invalid or missing start/end parameters");
    };

    if end < start {
        return Err("end timestamp must not precede start");
    }

    match record.step {
        Some(step) if step > 0.0 => Ok(()),
        _ => Err("step must be a positive duration"),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn parse_form(bytes: &[u8]) -> impl Iterator<Item = (String, String)> + '_ {
    url::form_urlencoded::parse(bytes).map(|(k, v)| (k.into_owned(), v.into_owned()))
}

fn append_query_param(uri: &http::Uri, param: &str) -> http::Uri {
    let path_and_query = match uri.query() {
        Some(query) if !query.is_empty() => format!("{}?{}&{}", uri.path(), query, param),
        _ => format!("{}?{}", uri.path(), param),
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();

    http::Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

fn append_form_param(body: &Bytes, param: &str) -> Bytes {
    if body.is_empty() {
        return Bytes::copy_from_slice(param.as_bytes());
    }

    let mut appended = Vec::with_capacity(body.len() + param.len() + 1);
    appended.extend_from_slice(body);
    appended.push(b'&');
    appended.extend_from_slice(param.as_bytes());

    Bytes::from(appended)
}

/// Pulls `data.stats.samples.{totalQueryableSamples,peakSamples}` out of the
/// response envelope. Parse failures leave both counts at zero.
fn extract_sample_stats(body: &[u8]) -> (i64, i64) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (0, 0);
    };

    let samples = &value["data"]["stats"]["samples"];

    (
        samples["totalQueryableSamples"].as_i64().unwrap_or(0),
        samples["peakSamples"].as_i64().unwrap_or(0),
    )
}

/// Parses a Prometheus API timestamp: RFC 3339 or (fractional) epoch
/// seconds.
pub fn parse_prom_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = value.parse::<f64>() {
        let secs = epoch.floor() as i64;
        let nanos = ((epoch - epoch.floor()) * 1e9) as u32;

        return Utc.timestamp_opt(secs, nanos).single();
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses a Prometheus API duration: float seconds or a duration string
/// such as `15s`, `1h30m`.
pub fn parse_prom_duration(value: &str) -> Option<f64> {
    if let Ok(seconds) = value.parse::<f64>() {
        return (seconds.is_finite()).then_some(seconds);
    }

    let mut total = 0.0;
    let mut digits = String::new();
    let mut chars = value.chars().peekable();
    let mut matched_any = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            digits.push(c);
            continue;
        }

        let number: f64 = digits.parse().ok()?;
        digits.clear();

        let unit_secs = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0.001
            }
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            'w' => 7.0 * 86400.0,
            'y' => 365.0 * 86400.0,
            _ => return None,
        };

        total += number * unit_secs;
        matched_any = true;
    }

    (matched_any && digits.is_empty()).then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prom_time_accepts_epoch_and_rfc3339() {
        assert_eq!(
            parse_prom_time("1700000000").unwrap().timestamp(),
            1_700_000_000
        );
        assert_eq!(
            parse_prom_time("1700000000.5").unwrap().timestamp_millis(),
            1_700_000_000_500
        );
        assert_eq!(
            parse_prom_time("2024-01-02T03:04:05Z").unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert!(parse_prom_time("yesterday").is_none());
    }

    #[test]
    fn prom_duration_accepts_seconds_and_suffixes() {
        assert_eq!(parse_prom_duration("15"), Some(15.0));
        assert_eq!(parse_prom_duration("15s"), Some(15.0));
        assert_eq!(parse_prom_duration("1h30m"), Some(5400.0));
        assert_eq!(parse_prom_duration("250ms"), Some(0.25));
        assert_eq!(parse_prom_duration("2w"), Some(14.0 * 86400.0));
        assert!(parse_prom_duration("abc").is_none());
        assert!(parse_prom_duration("15x").is_none());
    }

    #[test]
    fn sample_stats_are_extracted_from_the_envelope() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[],
            "stats":{"samples":{"totalQueryableSamples":100,"peakSamples":42}}}}"#;

        assert_eq!(extract_sample_stats(body), (100, 42));
    }

    #[test]
    fn missing_or_malformed_stats_yield_zeroes() {
        assert_eq!(extract_sample_stats(br#"{"status":"success"}"#), (0, 0));
        assert_eq!(extract_sample_stats(b"not json"), (0, 0));
    }

    #[test]
    fn stats_param_is_appended_to_the_query_string() {
        let uri: http::Uri = "http://x/api/v1/query?query=up".parse().unwrap();

        assert_eq!(
            append_query_param(&uri, "stats=all").to_string(),
            "http://x/api/v1/query?query=up&stats=all"
        );

        let bare: http::Uri = "http://x/api/v1/query".parse().unwrap();

        assert_eq!(
            append_query_param(&bare, "stats=all").to_string(),
            "http://x/api/v1/query?stats=all"
        );
    }

    #[test]
    fn stats_param_is_appended_to_form_bodies() {
        assert_eq!(
            append_form_param(&Bytes::from_static(b"query=up"), "stats=all"),
            Bytes::from_static(b"query=up&stats=all")
        );
        assert_eq!(
            append_form_param(&Bytes::new(), "stats=all"),
            Bytes::from_static(b"stats=all")
        );
    }
}
