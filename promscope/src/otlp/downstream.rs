//! Downstream OTLP exporter.

use crate::settings::{DownstreamSettings, OtlpSettings};
use crate::telemetry::metrics::metrics;
use crate::BootstrapResult;
use anyhow::Context as _;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// Shaved off the export deadline so our response beats the caller's.
const DEADLINE_SAFETY_MARGIN: Duration = Duration::from_millis(50);

/// Pause before the single retry after UNAVAILABLE.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// A lazily-connected client forwarding (possibly filtered) batches to
/// another OTLP endpoint.
pub struct Downstream {
    client: MetricsServiceClient<Channel>,
    export_timeout: Duration,
}

impl Downstream {
    pub fn new(settings: &DownstreamSettings, otlp: &OtlpSettings) -> BootstrapResult<Self> {
        let channel = Endpoint::from_shared(settings.endpoint_url.clone())
            .with_context(|| format!("invalid downstream endpoint {:?}", settings.endpoint_url))?
            .connect_lazy();

        let client = MetricsServiceClient::new(channel)
            .max_decoding_message_size(settings.max_message_bytes)
            .max_encoding_message_size(settings.max_message_bytes);

        Ok(Self {
            client,
            export_timeout: otlp.export_timeout(),
        })
    }

    /// Forwards one batch. The deadline is the configured export timeout
    /// shrunk to fit the inbound remainder, minus a safety margin. On
    /// UNAVAILABLE one immediate retry is attempted after a short backoff;
    /// other errors surface with their original code.
    pub async fn export(
        &self,
        batch: ExportMetricsServiceRequest,
        inbound_remaining: Option<Duration>,
    ) -> Result<(), Status> {
        let mut deadline = self.export_timeout;
        if let Some(remaining) = inbound_remaining {
            deadline = deadline.min(remaining);
        }
        let deadline = deadline.saturating_sub(DEADLINE_SAFETY_MARGIN);

        let mut client = self.client.clone();

        let mut request = tonic::Request::new(batch.clone());
        request.set_timeout(deadline);

        match client.export(request).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == Code::Unavailable => {
                metrics().otlp_downstream_retries.inc();
                tokio::time::sleep(RETRY_BACKOFF).await;

                let mut retry = tonic::Request::new(batch);
                retry.set_timeout(deadline.saturating_sub(RETRY_BACKOFF));

                client.export(retry).await.map(|_| ())
            }
            Err(status) => Err(status),
        }
    }
}

/// Parses the remaining inbound deadline from a `grpc-timeout` header
/// value, e.g. `5S` or `4999846u`.
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let (digits, unit) = value.split_at(value.len().checked_sub(1)?);
    let amount: u64 = digits.parse().ok()?;

    Some(match unit {
        "H" => Duration::from_secs(amount.saturating_mul(3600)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_timeout_units_are_parsed() {
        assert_eq!(parse_grpc_timeout("5S"), Some(Duration::from_secs(5)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("1000u"), Some(Duration::from_micros(1000)));
        assert_eq!(parse_grpc_timeout(""), None);
        assert_eq!(parse_grpc_timeout("12"), None);
        assert_eq!(parse_grpc_timeout("x5S"), None);
    }
}
