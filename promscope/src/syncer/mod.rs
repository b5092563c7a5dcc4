//! Periodic inventory syncer.
//!
//! Every tick performs, in order and each under its own timeout: a catalog
//! metadata refresh (skippable), a job-index rebuild fanned out over a
//! bounded worker pool, and a usage-summary refresh. A failing step is
//! logged and does not abort the following steps; a run exceeding
//! `run_timeout` is abandoned and the next tick starts afresh.

pub mod prom;

use crate::settings::SyncerSettings;
use crate::shutdown::Shutdown;
use crate::storage::{JobIndexPair, MetricCatalogItem, MetricType, Store, TimeRange};
use crate::telemetry::metrics::{metrics, OutcomeLabels, StepLabels};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use self::prom::{job_selector, PromClient};
use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

const NAME_LABEL: &str = "__name__";

pub struct Syncer {
    store: Arc<dyn Store>,
    prom: Arc<PromClient>,
    settings: SyncerSettings,
    log: Logger,
}

impl Syncer {
    pub fn new(
        store: Arc<dyn Store>,
        prom: Arc<PromClient>,
        settings: SyncerSettings,
        log: Logger,
    ) -> Self {
        Self {
            store,
            prom,
            settings,
            log,
        }
    }

    /// Spawns the periodic sync loop.
    pub fn spawn(self, mut shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick doubles as the initial sync.
            loop {
                tokio::select! {
                    _ = shutdown.signalled() => break,
                    _ = ticker.tick() => {}
                }

                match timeout(self.settings.run_timeout(), self.run_once()).await {
                    Ok(()) => {
                        metrics().syncer_runs.get_or_create(&OutcomeLabels::ok()).inc();
                    }
                    Err(_) => {
                        metrics()
                            .syncer_runs
                            .get_or_create(&OutcomeLabels::error())
                            .inc();
                        slog::warn!(self.log, "sync run abandoned after timeout";
                            "run_timeout_secs" => self.settings.run_timeout_secs);
                    }
                }
            }
        })
    }

    /// One full sync run. Steps execute in strict order; failures are
    /// logged per step.
    pub async fn run_once(&self) {
        if !self.settings.skip_metadata {
            if let Err(e) = timeout(self.settings.metadata_timeout(), self.metadata_step()).await
                .unwrap_or_else(|_| Err("metadata step timed out".into()))
            {
                self.step_failed("metadata", &e);
            }
        }

        if let Err(e) = self.job_index_step().await {
            self.step_failed("job_index", &e);
        }

        if let Err(e) = timeout(self.settings.summary_timeout(), self.summary_step()).await
            .unwrap_or_else(|_| Err("summary refresh timed out".into()))
        {
            self.step_failed("summary", &e);
        }
    }

    fn step_failed(&self, step: &'static str, error: &str) {
        metrics()
            .syncer_step_failures
            .get_or_create(&StepLabels { step: step.into() })
            .inc();
        slog::warn!(self.log, "sync step failed"; "step" => step, "error" => error);
    }

    async fn metadata_step(&self) -> Result<(), String> {
        let metadata = self.prom.metadata().await.map_err(|e| e.to_string())?;
        let now = Utc::now();

        let items: Vec<MetricCatalogItem> = metadata
            .into_iter()
            .filter_map(|(name, mut entries)| {
                let entry = entries.pop()?;

                Some(MetricCatalogItem {
                    name,
                    metric_type: MetricType::parse(&entry.metric_type),
                    help: entry.help,
                    unit: entry.unit,
                    last_synced_at: now,
                })
            })
            .collect();

        slog::debug!(self.log, "upserting catalog metadata"; "metrics" => items.len());

        self.store
            .upsert_metrics_catalog(&items)
            .await
            .map_err(|e| e.to_string())
    }

    async fn job_index_step(&self) -> Result<(), String> {
        let jobs = timeout(self.settings.label_timeout(), self.prom.label_values("job"))
            .await
            .map_err(|_| "job label fetch timed out".to_owned())?
            .map_err(|e| e.to_string())?;

        let window = TimeRange::last_days(i64::from(self.settings.time_window_days));
        let pairs: Arc<Mutex<HashSet<JobIndexPair>>> = Arc::new(Mutex::new(HashSet::new()));

        futures_util::stream::iter(jobs)
            .for_each_concurrent(self.settings.job_index_workers.max(1), |job| {
                let pairs = Arc::clone(&pairs);

                async move {
                    let series = match timeout(
                        self.settings.job_timeout(),
                        self.prom.series(&job_selector(&job), window.from, window.to),
                    )
                    .await
                    {
                        Ok(Ok(series)) => series,
                        Ok(Err(e)) => {
                            self.step_failed("job_index", &e.to_string());
                            return;
                        }
                        // A straggling job is bounded by its own timeout
                        // without cancelling the whole run.
                        Err(_) => {
                            self.step_failed("job_index", "per-job series fetch timed out");
                            return;
                        }
                    };

                    // Accumulate locally, merge under the mutex once.
                    let local: HashSet<JobIndexPair> = series
                        .into_iter()
                        .filter_map(|labels| labels.get(NAME_LABEL).cloned())
                        .map(|metric_name| JobIndexPair {
                            job: job.clone(),
                            metric_name,
                        })
                        .collect();

                    pairs.lock().extend(local);
                }
            })
            .await;

        let pairs: Vec<JobIndexPair> = {
            let mut guard = pairs.lock();

            std::mem::take(&mut *guard).into_iter().collect()
        };

        metrics().syncer_job_index_pairs.set(pairs.len() as i64);
        slog::debug!(self.log, "rebuilding job index"; "pairs" => pairs.len());

        self.store
            .upsert_job_index(&pairs)
            .await
            .map_err(|e| e.to_string())
    }

    async fn summary_step(&self) -> Result<(), String> {
        let window = TimeRange::last_days(i64::from(self.settings.time_window_days));

        self.store
            .refresh_usage_summary(window)
            .await
            .map_err(|e| e.to_string())
    }
}
