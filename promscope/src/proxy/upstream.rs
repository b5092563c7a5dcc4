//! Upstream request forwarding.

use super::RouteBody;
use crate::settings::UpstreamSettings;
use crate::BootstrapResult;
use anyhow::Context as _;
use http::uri::Uri;
use http::{header, HeaderMap, Request, Response};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Headers that are connection-scoped and must not be forwarded.
const HOP_BY_HOP_HEADERS: &[header::HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Upstream forwarding error.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("upstream request timed out")]
    Timeout,

    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),
}

/// The HTTP client forwarding proxied requests to the Prometheus-compatible
/// backend.
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, RouteBody>,
    scheme: String,
    authority: String,
    path_prefix: String,
    timeout: Duration,
}

impl Upstream {
    pub fn new(settings: &UpstreamSettings) -> BootstrapResult<Self> {
        let uri: Uri = settings
            .url
            .parse()
            .with_context(|| format!("invalid upstream URL {:?}", settings.url))?;

        let scheme = uri.scheme_str().unwrap_or("http").to_owned();
        let authority = uri
            .authority()
            .with_context(|| format!("upstream URL {:?} has no authority", settings.url))?
            .to_string();
        let path_prefix = uri.path().trim_end_matches('/').to_owned();

        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Ok(Self {
            client,
            scheme,
            authority,
            path_prefix,
            timeout: settings.timeout(),
        })
    }

    /// Rewrites the request URI onto the upstream base. The original path
    /// and query are preserved verbatim.
    pub fn target_uri(&self, path_and_query: &str) -> Result<Uri, http::Error> {
        Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority.as_str())
            .path_and_query(format!("{}{}", self.path_prefix, path_and_query))
            .build()
    }

    /// Forwards a request and returns the upstream response as-is.
    pub async fn forward(
        &self,
        mut req: Request<RouteBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());

        *req.uri_mut() = self.target_uri(&path_and_query)?;

        strip_hop_by_hop(req.headers_mut());
        // The client derives Host from the target URI.
        req.headers_mut().remove(header::HOST);

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(UpstreamError::Timeout),
        }
    }
}

/// Removes hop-by-hop headers, including those nominated by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    for name in nominated {
        headers.remove(name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }

    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_uri_preserves_path_and_query() {
        let upstream = Upstream::new(&UpstreamSettings {
            url: "http://prometheus:9090".into(),
            ..Default::default()
        })
        .unwrap();

        let uri = upstream
            .target_uri("/api/v1/query?query=up&stats=all")
            .unwrap();

        assert_eq!(
            uri.to_string(),
            "http://prometheus:9090/api/v1/query?query=up&stats=all"
        );
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let upstream = Upstream::new(&UpstreamSettings {
            url: "http://thanos:10902/prom/".into(),
            ..Default::default()
        })
        .unwrap();

        let uri = upstream.target_uri("/api/v1/labels").unwrap();

        assert_eq!(uri.to_string(), "http://thanos:10902/prom/api/v1/labels");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, x-custom".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("x-custom").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::ACCEPT).is_some());
    }
}
