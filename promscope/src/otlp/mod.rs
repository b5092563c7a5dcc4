//! OTLP MetricsService ingester.
//!
//! The `Export` RPC walks the inbound batch, resolves the extracted names
//! against the catalog in bounded chunks, removes metrics known to be
//! unused for permitted jobs, forwards the surviving batch downstream, and
//! buffers observed metrics for catalog population. Any lookup failure
//! cancels drop decisions for the request (fail open) while forwarding
//! proceeds.

pub mod downstream;
pub mod filter;

use crate::catalog::CatalogBuffer;
use crate::settings::OtlpSettings;
use crate::shutdown::Shutdown;
use crate::storage::{Store, LOOKUP_CHUNK_SIZE};
use crate::telemetry::metrics::metrics;
use crate::BootstrapResult;
use self::downstream::{parse_grpc_timeout, Downstream};
use self::filter::{DropAccumulator, JobGate, NameExtraction};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};

/// The MetricsService implementation.
pub struct MetricsIngester {
    store: Arc<dyn Store>,
    buffer: Option<Arc<CatalogBuffer>>,
    downstream: Option<Downstream>,
    gate: JobGate,
    dry_run: bool,
    log: Logger,
}

impl MetricsIngester {
    pub fn new(
        store: Arc<dyn Store>,
        buffer: Option<Arc<CatalogBuffer>>,
        downstream: Option<Downstream>,
        settings: &OtlpSettings,
        log: Logger,
    ) -> Self {
        Self {
            store,
            buffer,
            downstream,
            gate: JobGate::from_settings(&settings.jobs),
            dry_run: settings.dry_run,
            log,
        }
    }

    /// Streamed metadata lookup: names are resolved in chunks and folded
    /// into the accumulator so memory stays bounded regardless of batch
    /// size.
    async fn lookup_unused(&self, extraction: &NameExtraction) -> Result<HashSet<String>, String> {
        let mut accumulator = DropAccumulator::new(extraction.histogram_bases.clone());

        for chunk in extraction.lookup_names.chunks(LOOKUP_CHUNK_SIZE) {
            let rows = self
                .store
                .series_metadata_by_names(chunk, None)
                .await
                .map_err(|e| e.to_string())?;

            accumulator.observe(&rows);
        }

        Ok(accumulator.finalize())
    }
}

#[async_trait::async_trait]
impl MetricsService for MetricsIngester {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        metrics().otlp_requests.inc();

        let inbound_remaining: Option<Duration> = request
            .metadata()
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout);

        let mut batch = request.into_inner();

        let extraction = filter::extract_names(&batch);
        metrics()
            .otlp_datapoints_received
            .inc_by(extraction.datapoints);

        let observed = self
            .buffer
            .is_some()
            .then(|| filter::observed_catalog_items(&batch));

        // A failed lookup cancels every drop decision for this request;
        // the batch is forwarded unchanged.
        let unused = match self.lookup_unused(&extraction).await {
            Ok(unused) => unused,
            Err(e) => {
                metrics().otlp_lookup_failures.inc();
                slog::warn!(self.log, "catalog lookup failed, keeping all metrics";
                    "error" => e);

                HashSet::new()
            }
        };

        let outcome = filter::apply_drops(&mut batch, &unused, &self.gate, self.dry_run);

        metrics().otlp_metrics_dropped.inc_by(outcome.metrics_dropped);
        metrics()
            .otlp_datapoints_dropped
            .inc_by(outcome.datapoints_dropped);

        if outcome.metrics_dropped > 0 {
            slog::debug!(self.log, "filtered unused metrics";
                "metrics" => outcome.metrics_dropped,
                "datapoints" => outcome.datapoints_dropped,
                "dry_run" => self.dry_run);
        }

        if let Some(downstream) = &self.downstream {
            downstream
                .export(batch, inbound_remaining)
                .await
                .map_err(|status| {
                    metrics().otlp_downstream_failures.inc();
                    slog::warn!(self.log, "downstream export failed";
                        "code" => ?status.code(), "message" => status.message());

                    status
                })?;
        }

        // Catalog population happens only after a successful export.
        if let (Some(buffer), Some(observed)) = (&self.buffer, observed) {
            buffer.observe(observed).await;
        }

        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}

/// Serves the OTLP gRPC endpoint until shutdown. Health and reflection
/// services are registered alongside the MetricsService.
pub async fn serve(
    ingester: MetricsIngester,
    settings: OtlpSettings,
    mut shutdown: Shutdown,
    log: Logger,
) -> BootstrapResult<()> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<MetricsServiceServer<MetricsIngester>>()
        .await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let service = MetricsServiceServer::new(ingester)
        .max_decoding_message_size(settings.max_inbound_message_bytes)
        .max_encoding_message_size(settings.max_inbound_message_bytes);

    slog::info!(log, "OTLP ingester is listening"; "addr" => %settings.addr);

    tonic::transport::Server::builder()
        .add_service(health_service)
        .add_service(reflection)
        .add_service(service)
        .serve_with_shutdown(settings.addr, async move { shutdown.signalled().await })
        .await?;

    Ok(())
}
