//! HTTP server: transparent proxy plus the analytics read side.
//!
//! Everything under `/api/` is forwarded to the upstream backend;
//! `/api/v1/query` and `/api/v1/query_range` additionally record analytics.
//! The analytics and catalog endpoints are overlaid on paths the upstream
//! does not serve.

pub mod fingerprint;
pub mod record;
pub mod upstream;

use crate::api;
use crate::ingest::Ingestor;
use crate::settings::Settings;
use crate::shutdown::Shutdown;
use crate::storage::Store;
use crate::syncer::prom::PromClient;
use crate::telemetry::metrics::{metrics, ProxyLabels};
use crate::BootstrapResult;
use anyhow::Context as _;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::pin_mut;
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper_util::rt::{TokioExecutor, TokioIo};
use slog::Logger;
use socket2::{Domain, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use self::upstream::Upstream;

/// Body type of every proxy and analytics response.
pub type RouteBody = BoxBody<Bytes, hyper::Error>;

/// Builds a fixed-content response body.
pub fn full_body(data: impl Into<Bytes>) -> RouteBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

/// Shared state of the HTTP surface.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn Store>,
    pub ingestor: Ingestor,
    pub upstream: Upstream,
    pub prom: Arc<PromClient>,
    pub log: Logger,
}

/// The HTTP server driving the proxy router.
pub struct ProxyServer {
    listener: TcpListener,
    router: Router,
}

impl ProxyServer {
    pub fn bind(addr: SocketAddr, state: Arc<AppState>) -> BootstrapResult<Self> {
        let listener = {
            let std_listener = std::net::TcpListener::from(
                bind_socket(addr).with_context(|| format!("binding to socket {addr:?}"))?,
            );

            std_listener.set_nonblocking(true)?;

            TcpListener::from_std(std_listener)?
        };

        Ok(Self {
            listener,
            router: Router { state },
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accepts connections until shutdown, then waits for in-flight
    /// connections to complete.
    pub async fn serve(self, mut shutdown: Shutdown) {
        let log = self.router.state.log.clone();
        let (close_tx, close_rx) = watch::channel(());

        loop {
            let stream = tokio::select! {
                conn = self.listener.accept() => match conn {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        slog::warn!(log, "failed to accept connection"; "error" => %e);

                        continue;
                    }
                },
                _ = shutdown.signalled() => break,
            };

            let router = self.router.clone();
            let mut conn_shutdown = shutdown.clone();
            let close_rx = close_rx.clone();

            tokio::spawn(async move {
                let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                let conn = builder.serve_connection(TokioIo::new(stream), router);

                let signalled = conn_shutdown.signalled().fuse();

                pin_mut!(conn);
                pin_mut!(signalled);

                loop {
                    tokio::select! {
                        _ = conn.as_mut() => break,
                        _ = &mut signalled => conn.as_mut().graceful_shutdown(),
                    }
                }

                drop(close_rx);
            });
        }

        drop(close_rx);

        // Wait for every in-flight connection to finish.
        close_tx.closed().await;
    }
}

fn bind_socket(addr: SocketAddr) -> BootstrapResult<Socket> {
    let socket = Socket::new(
        if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        },
        Type::STREAM,
        None,
    )?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    Ok(socket)
}

#[derive(Clone)]
pub struct Router {
    state: Arc<AppState>,
}

impl Router {
    async fn handle_request(self, req: Request<Incoming>) -> Response<RouteBody> {
        let Ok(path) = percent_encoding::percent_decode_str(req.uri().path()).decode_utf8()
        else {
            return api::json_error(
                StatusCode::BAD_REQUEST,
                "can't percent-decode URI path as valid UTF-8",
            );
        };
        let path = path.into_owned();
        let method = req.method().clone();

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => api::text_response("ok"),

            (&Method::GET, "/metrics") => api::metrics_response(&self.state),

            // Intercepted query endpoints.
            (&Method::GET | &Method::POST, "/api/v1/query") => {
                record::record_and_forward(&self.state, req, record::TapEndpoint::Query).await
            }
            (&Method::GET | &Method::POST, "/api/v1/query_range") => {
                record::record_and_forward(&self.state, req, record::TapEndpoint::QueryRange)
                    .await
            }

            // Analytics read side.
            (&Method::GET, "/api/v1/query/types") => api::dispatch(&self.state, &req, api::Endpoint::QueryTypes).await,
            (&Method::GET, "/api/v1/query/average_duration") => api::dispatch(&self.state, &req, api::Endpoint::AverageDuration).await,
            (&Method::GET, "/api/v1/query/rate") => api::dispatch(&self.state, &req, api::Endpoint::QueryRate).await,
            (&Method::GET, "/api/v1/query/status_distribution") => api::dispatch(&self.state, &req, api::Endpoint::StatusDistribution).await,
            (&Method::GET, "/api/v1/query/latency") => api::dispatch(&self.state, &req, api::Endpoint::Latency).await,
            (&Method::GET, "/api/v1/query/throughput") => api::dispatch(&self.state, &req, api::Endpoint::Throughput).await,
            (&Method::GET, "/api/v1/query/errors") => api::dispatch(&self.state, &req, api::Endpoint::Errors).await,
            (&Method::GET, "/api/v1/query/time_range_distribution") => api::dispatch(&self.state, &req, api::Endpoint::TimeRangeDistribution).await,
            (&Method::GET, "/api/v1/query/expressions") => api::dispatch(&self.state, &req, api::Endpoint::Expressions).await,
            (&Method::GET, "/api/v1/query/executions") => api::dispatch(&self.state, &req, api::Endpoint::Executions).await,

            // Catalog read side.
            (&Method::GET, "/api/v1/seriesMetadata") => api::dispatch(&self.state, &req, api::Endpoint::SeriesMetadata).await,
            (&Method::GET, "/api/v1/jobs") => api::dispatch(&self.state, &req, api::Endpoint::Jobs).await,
            (&Method::GET, "/api/v1/metrics/unused") => api::dispatch(&self.state, &req, api::Endpoint::UnusedMetrics).await,
            (&Method::GET, "/api/v1/configs") => api::dispatch(&self.state, &req, api::Endpoint::Configs).await,

            // Writes from external collectors.
            (&Method::POST, "/api/v1/metrics") => api::handle_usage_push(&self.state, req).await,
            (&Method::POST, "/api/v1/backfill") => api::handle_backfill(&self.state, req).await,

            _ => {
                if let Some(name) = path_param(&path, "/api/v1/metricStatistics/") {
                    if method == Method::GET {
                        return api::dispatch_named(&self.state, &req, name, api::NamedEndpoint::MetricStatistics).await;
                    }
                }
                if let Some(name) = path_param(&path, "/api/v1/metricQueryPerformanceStatistics/") {
                    if method == Method::GET {
                        return api::dispatch_named(&self.state, &req, name, api::NamedEndpoint::MetricQueryPerformance).await;
                    }
                }
                if let Some(name) = path_param(&path, "/api/v1/serieExpressions/") {
                    if method == Method::GET {
                        return api::dispatch_named(&self.state, &req, name, api::NamedEndpoint::SerieExpressions).await;
                    }
                }
                if let Some(name) = path_param(&path, "/api/v1/serieUsage/") {
                    if method == Method::GET {
                        return api::dispatch_named(&self.state, &req, name, api::NamedEndpoint::SerieUsage).await;
                    }
                }

                // Everything else under /api/ is transparently forwarded.
                if path.starts_with("/api/") {
                    return passthrough(&self.state, req).await;
                }

                api::json_error(StatusCode::NOT_FOUND, "not found")
            }
        }
    }
}

/// Extracts the trailing path parameter of a prefixed route.
fn path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;

    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

/// Forwards a request without side effects.
async fn passthrough(state: &AppState, req: Request<Incoming>) -> Response<RouteBody> {
    let (parts, body) = req.into_parts();
    let req = Request::from_parts(parts, body.boxed());

    match state.upstream.forward(req).await {
        Ok(res) => {
            metrics()
                .proxy_requests
                .get_or_create(&ProxyLabels {
                    endpoint: "passthrough".to_owned(),
                    status: res.status().as_u16().to_string(),
                })
                .inc();

            res.map(|body| body.boxed())
        }
        Err(e) => {
            slog::warn!(state.log, "passthrough upstream call failed"; "error" => %e);
            metrics().proxy_upstream_errors.inc();

            api::json_error(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

impl Service<Request<Incoming>> for Router {
    type Response = Response<RouteBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.clone();

        async move { Ok(router.handle_request(req).await) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_params_are_single_segments() {
        assert_eq!(
            path_param("/api/v1/metricStatistics/up", "/api/v1/metricStatistics/"),
            Some("up")
        );
        assert_eq!(
            path_param("/api/v1/metricStatistics/", "/api/v1/metricStatistics/"),
            None
        );
        assert_eq!(
            path_param("/api/v1/metricStatistics/a/b", "/api/v1/metricStatistics/"),
            None
        );
        assert_eq!(path_param("/api/v1/other", "/api/v1/metricStatistics/"), None);
    }
}
