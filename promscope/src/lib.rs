//! Promscope is a transparent PromQL-compatible proxy that sits between query
//! clients and a Prometheus-compatible backend. While forwarding queries
//! unchanged it captures per-query analytics into a relational store and
//! maintains a catalog of known metrics with usage attribution. An optional
//! OTLP write path drops metrics known to be unused before forwarding the
//! batch downstream.
//!
//! The crate is organized by concern:
//!
//! * [`settings`] - immutable YAML service configuration.
//! * [`cli`] - command line interface that loads or generates the config.
//! * [`telemetry`] - logging and service metrics.
//! * [`storage`] - the dialect-agnostic persistence contract with Postgres
//!   and SQLite adapters.
//! * [`proxy`] - the HTTP server, upstream forwarder and query tap.
//! * [`api`] - the analytics read side served next to the proxy.
//! * [`ingest`] - the bounded queue and batch flusher feeding storage.
//! * [`syncer`] - the periodic inventory and usage-summary refresh.
//! * [`otlp`] - the OTLP MetricsService ingester and downstream exporter.
//! * [`catalog`] - the deduplicating catalog buffer and seen-set.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod ingest;
pub mod otlp;
pub mod proxy;
pub mod settings;
pub mod shutdown;
pub mod storage;
pub mod syncer;
pub mod telemetry;

/// Error that can be returned on a service initialisation.
///
/// This is an alias for [`anyhow::Error`]. On service bootstrap all such
/// errors are propagated to the `main` function and terminate the process
/// with a non-zero exit code.
pub type BootstrapError = anyhow::Error;

/// Result that has [`BootstrapError`] as an error variant.
pub type BootstrapResult<T> = anyhow::Result<T>;

/// Basic service information.
#[derive(Clone, Debug, Default)]
pub struct ServiceInfo {
    /// The name of the service.
    pub name: &'static str,

    /// The version of the service.
    pub version: &'static str,

    /// Service author.
    pub author: &'static str,

    /// The description of the service.
    pub description: &'static str,
}

/// Creates [`ServiceInfo`] from the information in `Cargo.toml` manifest of
/// the service.
#[macro_export]
macro_rules! service_info {
    () => {
        $crate::ServiceInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            author: env!("CARGO_PKG_AUTHORS"),
            description: env!("CARGO_PKG_DESCRIPTION"),
        }
    };
}
