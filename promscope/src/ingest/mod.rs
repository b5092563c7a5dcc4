//! Asynchronous query-analytics ingestion pipeline.
//!
//! Producers validate records and enqueue them onto a bounded queue with a
//! short enqueue timeout; a full queue yields [`IngestError::Backpressure`]
//! which callers log but never propagate to HTTP clients (the client has
//! already received its response). A single consumer flushes one bulk
//! insert per batch when `batch_size` records accumulated, `flush_interval`
//! elapsed, or shutdown was signalled, in which case it drains for up to
//! `grace_period` and drops whatever is left with a counted warning.
//!
//! The stream is best-effort: a failed flush drops the batch without retry.

use crate::settings::IngestSettings;
use crate::shutdown::Shutdown;
use crate::storage::{QueryRecord, QueryType, Store};
use crate::telemetry::metrics::{metrics, OutcomeLabels};
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};

/// Ingestion error observed by producers.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The queue stayed full past the enqueue timeout.
    #[error("ingestion queue is full")]
    Backpressure,

    /// The consumer has shut down.
    #[error("ingestion pipeline is closed")]
    Closed,

    /// The record failed producer-side validation.
    #[error("invalid query record: {0}")]
    Invalid(String),
}

/// What happened to the queue during the shutdown drain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Rows written by the consumer over its lifetime.
    pub flushed_rows: u64,

    /// Records dropped because the grace period expired or the final flush
    /// failed.
    pub dropped: u64,
}

/// Producer handle of the ingestion queue.
#[derive(Clone)]
pub struct Ingestor {
    tx: mpsc::Sender<QueryRecord>,
    buffer_size: usize,
    enqueue_timeout: Duration,
}

impl Ingestor {
    /// Validates and enqueues one record.
    pub async fn ingest(&self, record: QueryRecord) -> Result<(), IngestError> {
        validate(&record).map_err(IngestError::Invalid)?;

        let res = self
            .tx
            .send_timeout(record, self.enqueue_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => IngestError::Backpressure,
                SendTimeoutError::Closed(_) => IngestError::Closed,
            });

        match &res {
            Ok(()) => metrics().ingest_enqueued.inc(),
            Err(_) => metrics().ingest_rejected.inc(),
        };

        metrics()
            .ingest_queue_depth
            .set((self.buffer_size - self.tx.capacity()) as i64);

        res
    }
}

/// Rejects malformed records before they enter the queue.
pub fn validate(record: &QueryRecord) -> Result<(), String> {
    if record.query_param.is_empty() {
        return Err("empty query expression".into());
    }

    if record.ts.timestamp() < 0 {
        return Err("timestamp before the epoch".into());
    }

    if !record.duration_ms.is_finite() || record.duration_ms < 0.0 {
        return Err("negative or non-finite duration".into());
    }

    if !(100..=599).contains(&record.status_code) {
        return Err(format!("undefined status code {}", record.status_code));
    }

    if record.query_type == QueryType::Range {
        let (Some(start), Some(end)) = (record.start, record.end) else {
            return Err("range query without a window".into());
        };

        if end < start {
            return Err("range end precedes start".into());
        }

        match record.step {
            Some(step) if step > 0.0 => {}
            _ => return Err("range step must be positive".into()),
        }
    }

    Ok(())
}

/// Creates the bounded queue and its producer handle.
pub fn channel(settings: &IngestSettings) -> (Ingestor, mpsc::Receiver<QueryRecord>) {
    let (tx, rx) = mpsc::channel(settings.buffer_size);

    (
        Ingestor {
            tx,
            buffer_size: settings.buffer_size,
            enqueue_timeout: settings.enqueue_timeout(),
        },
        rx,
    )
}

/// Spawns the single consumer loop.
pub fn spawn_consumer(
    mut rx: mpsc::Receiver<QueryRecord>,
    store: Arc<dyn Store>,
    settings: IngestSettings,
    db_op_timeout: Duration,
    mut shutdown: Shutdown,
    log: Logger,
) -> JoinHandle<DrainReport> {
    tokio::spawn(async move {
        let mut report = DrainReport::default();
        let mut batch: Vec<QueryRecord> = Vec::with_capacity(settings.batch_size);

        let mut flush_timer = tokio::time::interval(settings.flush_interval());
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        flush_timer.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.signalled() => break,

                received = rx.recv() => match received {
                    Some(record) => {
                        batch.push(record);

                        if batch.len() >= settings.batch_size {
                            flush(&store, &mut batch, db_op_timeout, &mut report, &log).await;
                            flush_timer.reset();
                        }
                    }
                    // All producers are gone.
                    None => {
                        flush(&store, &mut batch, db_op_timeout, &mut report, &log).await;
                        return report;
                    }
                },

                _ = flush_timer.tick() => {
                    if !batch.is_empty() {
                        flush(&store, &mut batch, db_op_timeout, &mut report, &log).await;
                    }
                }
            }

            metrics().ingest_queue_depth.set(rx.len() as i64);
        }

        // Shutdown: drain the queue for up to the grace period.
        let deadline = Instant::now() + settings.grace_period();

        slog::info!(log, "draining ingestion queue";
            "queued" => rx.len(), "grace_period_secs" => settings.grace_period().as_secs());

        loop {
            if batch.len() >= settings.batch_size {
                flush(&store, &mut batch, db_op_timeout, &mut report, &log).await;
            }

            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(record)) => batch.push(record),
                Ok(None) => break,
                // Grace period expired.
                Err(_) => break,
            }
        }

        flush(&store, &mut batch, db_op_timeout, &mut report, &log).await;

        // Whatever is still queued is lost; make the loss visible.
        let mut remaining = 0u64;
        while rx.try_recv().is_ok() {
            remaining += 1;
        }

        if remaining > 0 {
            report.dropped += remaining;
            metrics().ingest_dropped.inc_by(remaining);
            slog::warn!(log, "dropping queued records after grace period";
                "dropped" => remaining);
        }

        metrics().ingest_queue_depth.set(0);

        report
    })
}

async fn flush(
    store: &Arc<dyn Store>,
    batch: &mut Vec<QueryRecord>,
    db_op_timeout: Duration,
    report: &mut DrainReport,
    log: &Logger,
) {
    if batch.is_empty() {
        return;
    }

    let rows = batch.len() as u64;
    let res = timeout(db_op_timeout, store.ingest_batch(batch)).await;

    match res {
        Ok(Ok(())) => {
            report.flushed_rows += rows;
            metrics().ingest_flushes.get_or_create(&OutcomeLabels::ok()).inc();
            metrics().ingest_flushed_rows.inc_by(rows);
        }
        Ok(Err(e)) => {
            report.dropped += rows;
            metrics()
                .ingest_flushes
                .get_or_create(&OutcomeLabels::error())
                .inc();
            metrics().ingest_dropped.inc_by(rows);
            slog::error!(log, "dropping batch after failed flush";
                "rows" => rows, "error" => %e);
        }
        Err(_) => {
            report.dropped += rows;
            metrics()
                .ingest_flushes
                .get_or_create(&OutcomeLabels::error())
                .inc();
            metrics().ingest_dropped.inc_by(rows);
            slog::error!(log, "dropping batch after flush timeout"; "rows" => rows);
        }
    }

    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn instant_record() -> QueryRecord {
        QueryRecord {
            ts: Utc::now(),
            fingerprint: "abc".into(),
            query_param: "up".into(),
            query_type: QueryType::Instant,
            time_param: Some(Utc::now()),
            start: None,
            end: None,
            step: None,
            status_code: 200,
            duration_ms: 1.5,
            body_size: 10,
            total_queryable_samples: 0,
            peak_samples: 0,
            label_matchers: vec![BTreeMap::from([("__name__".to_owned(), "up".to_owned())])],
        }
    }

    fn range_record() -> QueryRecord {
        QueryRecord {
            query_type: QueryType::Range,
            start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()),
            step: Some(15.0),
            ..instant_record()
        }
    }

    #[test]
    fn valid_records_pass() {
        assert!(validate(&instant_record()).is_ok());
        assert!(validate(&range_record()).is_ok());
    }

    #[test]
    fn inverted_range_window_is_rejected() {
        let mut record = range_record();
        std::mem::swap(&mut record.start, &mut record.end);

        assert!(validate(&record).is_err());
    }

    #[test]
    fn non_positive_step_is_rejected() {
        let mut record = range_record();

        record.step = Some(0.0);
        assert!(validate(&record).is_err());

        record.step = None;
        assert!(validate(&record).is_err());
    }

    #[test]
    fn undefined_status_code_is_rejected() {
        let mut record = instant_record();
        record.status_code = 999;

        assert!(validate(&record).is_err());
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut record = instant_record();
        record.duration_ms = -1.0;

        assert!(validate(&record).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_queue_reports_backpressure() {
        let settings = IngestSettings {
            buffer_size: 1,
            enqueue_timeout_ms: 20,
            ..Default::default()
        };

        let (ingestor, _rx) = channel(&settings);

        ingestor.ingest(instant_record()).await.unwrap();

        // The queue is full and nobody consumes; the paused clock makes the
        // enqueue timeout fire immediately.
        let err = ingestor.ingest(instant_record()).await.unwrap_err();

        assert!(matches!(err, IngestError::Backpressure));
    }

    #[tokio::test]
    async fn invalid_records_never_enter_the_queue() {
        let settings = IngestSettings::default();
        let (ingestor, mut rx) = channel(&settings);

        let mut record = instant_record();
        record.query_param = String::new();

        assert!(matches!(
            ingestor.ingest(record).await,
            Err(IngestError::Invalid(_))
        ));
        assert!(rx.try_recv().is_err());
    }
}
