//! HTTP query-parameter parsing for the analytics read side.

use super::ApiError;
use crate::proxy::record::parse_prom_time;
use crate::storage::{PageParams, SortOrder, SortSpec, TimeRange, MAX_PAGE_SIZE};
use slog::Logger;
use std::collections::HashMap;

/// Default analytics window when `from`/`to` are absent, in days.
const DEFAULT_RANGE_DAYS: i64 = 30;

/// Decoded query-string parameters.
#[derive(Clone, Debug, Default)]
pub struct RawParams(HashMap<String, String>);

impl RawParams {
    pub fn from_query(query: Option<&str>) -> Self {
        let map = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// Parses the `from`/`to` window, defaulting to the trailing 30 days.
pub fn parse_time_range(params: &RawParams) -> Result<TimeRange, ApiError> {
    let mut range = TimeRange::last_days(DEFAULT_RANGE_DAYS);

    if let Some(from) = params.get("from") {
        range.from = parse_prom_time(from)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid from timestamp {from:?}")))?;
    }

    if let Some(to) = params.get("to") {
        range.to = parse_prom_time(to)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid to timestamp {to:?}")))?;
    }

    if range.to < range.from {
        return Err(ApiError::BadRequest(
            "to timestamp precedes from timestamp".into(),
        ));
    }

    Ok(range)
}

/// Parses `page`/`pageSize`, enforcing `page >= 1` and
/// `1 <= pageSize <= 100`.
pub fn parse_page(params: &RawParams) -> Result<PageParams, ApiError> {
    let mut page = PageParams::default();

    if let Some(raw) = params.get("page") {
        page.page = raw
            .parse::<u64>()
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid page {raw:?}")))?;
    }

    if let Some(raw) = params.get("pageSize") {
        page.page_size = raw
            .parse::<u64>()
            .ok()
            .filter(|s| (1..=MAX_PAGE_SIZE).contains(s))
            .ok_or_else(|| ApiError::BadRequest(format!("invalid pageSize {raw:?}")))?;
    }

    Ok(page)
}

/// Parses `sortBy`/`sortOrder` against the endpoint's whitelist.
///
/// Unknown values fall back to the documented default with a logged
/// warning; they never flow into SQL.
pub fn parse_sort(
    params: &RawParams,
    fields: &[&str],
    default_by: &str,
    default_order: SortOrder,
    log: &Logger,
) -> SortSpec {
    let by = match params.get("sortBy") {
        Some(raw) if fields.contains(&raw) => raw.to_owned(),
        Some(raw) => {
            slog::warn!(log, "unknown sortBy field, falling back";
                "requested" => raw, "fallback" => default_by);

            default_by.to_owned()
        }
        None => default_by.to_owned(),
    };

    let order = match params.get("sortOrder") {
        Some(raw) => SortOrder::parse(raw).unwrap_or_else(|| {
            slog::warn!(log, "unknown sortOrder, falling back"; "requested" => raw);

            default_order
        }),
        None => default_order,
    };

    SortSpec { by, order }
}

/// Parses the optional `fingerprint` filter.
pub fn parse_fingerprint(params: &RawParams) -> Option<String> {
    params
        .get("fingerprint")
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(query: &str) -> RawParams {
        RawParams::from_query(Some(query))
    }

    fn discard() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn default_range_is_the_trailing_month() {
        let range = parse_time_range(&RawParams::default()).unwrap();

        assert_eq!((range.to - range.from).num_days(), DEFAULT_RANGE_DAYS);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let params = raw("from=2024-02-01T00:00:00Z&to=2024-01-01T00:00:00Z");

        assert!(parse_time_range(&params).is_err());
    }

    #[test]
    fn page_bounds_are_enforced() {
        assert!(parse_page(&raw("page=0")).is_err());
        assert!(parse_page(&raw("pageSize=0")).is_err());
        assert!(parse_page(&raw("pageSize=101")).is_err());
        assert!(parse_page(&raw("page=abc")).is_err());

        let page = parse_page(&raw("page=3&pageSize=100")).unwrap();

        assert_eq!(page.page, 3);
        assert_eq!(page.page_size, 100);
    }

    #[test]
    fn unknown_sort_falls_back_to_the_default() {
        let spec = parse_sort(
            &raw("sortBy=evil;drop--&sortOrder=sideways"),
            &["name", "query_count"],
            "name",
            SortOrder::Asc,
            &discard(),
        );

        assert_eq!(spec.by, "name");
        assert_eq!(spec.order, SortOrder::Asc);
    }

    #[test]
    fn whitelisted_sort_is_accepted() {
        let spec = parse_sort(
            &raw("sortBy=query_count&sortOrder=desc"),
            &["name", "query_count"],
            "name",
            SortOrder::Asc,
            &discard(),
        );

        assert_eq!(spec.by, "query_count");
        assert_eq!(spec.order, SortOrder::Desc);
    }
}
