//! Minimal Prometheus HTTP API client used by the inventory syncer.

use crate::settings::UpstreamSettings;
use crate::BootstrapResult;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Upstream inventory call error.
#[derive(Debug, thiserror::Error)]
pub enum PromError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(String),
}

/// Envelope wrapping every Prometheus API response.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: T,
}

impl<T> Envelope<T> {
    fn into_data(self) -> Result<T, PromError> {
        if self.status == "success" {
            Ok(self.data)
        } else {
            Err(PromError::Status(self.status))
        }
    }
}

/// One metadata entry of `/api/v1/metadata`.
#[derive(Clone, Debug, Deserialize)]
pub struct MetadataEntry {
    #[serde(rename = "type", default)]
    pub metric_type: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub unit: String,
}

/// The Prometheus-compatible upstream API client.
pub struct PromClient {
    http: reqwest::Client,
    base: String,
}

impl PromClient {
    pub fn new(settings: &UpstreamSettings) -> BootstrapResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .context("building upstream HTTP client")?;

        Ok(Self {
            http,
            base: settings.url.trim_end_matches('/').to_owned(),
        })
    }

    /// Fetches metric metadata keyed by metric name.
    pub async fn metadata(&self) -> Result<HashMap<String, Vec<MetadataEntry>>, PromError> {
        let url = format!("{}/api/v1/metadata", self.base);

        let envelope: Envelope<HashMap<String, Vec<MetadataEntry>>> =
            self.http.get(url).send().await?.error_for_status()?.json().await?;

        envelope.into_data()
    }

    /// Fetches all values of a label.
    pub async fn label_values(&self, label: &str) -> Result<Vec<String>, PromError> {
        let url = format!("{}/api/v1/label/{}/values", self.base, label);

        let envelope: Envelope<Vec<String>> =
            self.http.get(url).send().await?.error_for_status()?.json().await?;

        envelope.into_data()
    }

    /// Fetches the label sets of all series matching a selector within the
    /// window.
    pub async fn series(
        &self,
        match_expr: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<HashMap<String, String>>, PromError> {
        let url = format!("{}/api/v1/series", self.base);

        let envelope: Envelope<Vec<HashMap<String, String>>> = self
            .http
            .get(url)
            .query(&[
                ("match[]", match_expr),
                ("start", &from.timestamp().to_string()),
                ("end", &to.timestamp().to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        envelope.into_data()
    }

    /// Counts the series currently exposed for a metric name.
    pub async fn series_count(&self, name: &str) -> Result<i64, PromError> {
        let now = Utc::now();
        let from = now - chrono::Duration::hours(1);

        let selector = format!("{{__name__={:?}}}", name);
        let series = self.series(&selector, from, now).await?;

        Ok(series.len() as i64)
    }
}

/// Builds the series selector scoping one job.
pub fn job_selector(job: &str) -> String {
    // Escape characters that would terminate the quoted matcher value.
    let escaped = job.replace('\\', "\\\\").replace('"', "\\\"");

    format!("{{job=\"{escaped}\"}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_selectors_are_escaped() {
        assert_eq!(job_selector("node"), r#"{job="node"}"#);
        assert_eq!(job_selector(r#"we"ird"#), r#"{job="we\"ird"}"#);
    }

    #[test]
    fn envelope_rejects_non_success() {
        let envelope = Envelope {
            status: "error".to_owned(),
            data: (),
        };

        assert!(envelope.into_data().is_err());
    }
}
