//! Deduplicating catalog buffer.
//!
//! Two layers keep redundant upserts off the write path: a pending map
//! deduplicates within one flush interval, and a TTL'd seen-set prevents
//! re-queueing across flushes. The seen-set lives either in-process (lost
//! on restart) or in an external store shared across replicas; when the
//! external variant is configured the in-process map is not allocated.

pub mod seen;

use crate::settings::CatalogBufferSettings;
use crate::shutdown::Shutdown;
use crate::storage::{MetricCatalogItem, Store};
use crate::telemetry::metrics::{metrics, OutcomeLabels};
use parking_lot::Mutex;
use self::seen::SeenStore;
use slog::Logger;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};

struct Inner {
    pending: HashMap<String, MetricCatalogItem>,
    /// Expiry instants of names flushed recently; `None` when an external
    /// store is authoritative.
    seen: Option<HashMap<String, Instant>>,
}

/// The in-memory buffer of metrics awaiting a catalog upsert.
pub struct CatalogBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    seen_ttl: Duration,
    external: Option<Arc<dyn SeenStore>>,
}

impl CatalogBuffer {
    pub fn new(settings: &CatalogBufferSettings, external: Option<Arc<dyn SeenStore>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                seen: external.is_none().then(HashMap::new),
            }),
            capacity: settings.buffer_size,
            seen_ttl: settings.seen_ttl(),
            external,
        }
    }

    /// Filters out names that are already pending and, when in-process
    /// dedup is authoritative, names within their seen TTL.
    pub fn candidates(&self, items: Vec<MetricCatalogItem>) -> Vec<MetricCatalogItem> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Expired entries are reaped opportunistically.
        if let Some(seen) = &mut inner.seen {
            seen.retain(|_, expiry| *expiry > now);
        }

        items
            .into_iter()
            .filter(|item| {
                !inner.pending.contains_key(&item.name)
                    && inner
                        .seen
                        .as_ref()
                        .is_none_or(|seen| !seen.contains_key(&item.name))
            })
            .collect()
    }

    /// Adds candidates to the pending map, skipping names in `suppress`
    /// (the external store's answer). Returns how many were dropped on
    /// overflow.
    pub fn add_batch(
        &self,
        items: Vec<MetricCatalogItem>,
        suppress: &HashSet<String>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let mut dropped = 0;

        for item in items {
            if suppress.contains(&item.name) {
                continue;
            }

            if inner.pending.len() >= self.capacity && !inner.pending.contains_key(&item.name) {
                dropped += 1;
                continue;
            }

            inner.pending.insert(item.name.clone(), item);
        }

        dropped
    }

    /// Atomically drains the pending map, marking the drained names seen
    /// in the in-process map (when it is authoritative).
    pub fn snapshot(&self) -> Vec<MetricCatalogItem> {
        let mut inner = self.inner.lock();
        let drained: Vec<MetricCatalogItem> =
            std::mem::take(&mut inner.pending).into_values().collect();

        let expiry = Instant::now() + self.seen_ttl;
        if let Some(seen) = &mut inner.seen {
            for item in &drained {
                seen.insert(item.name.clone(), expiry);
            }
        }

        drained
    }

    /// Forgets in-process seen marks after a failed flush so the next
    /// observation re-queues the names.
    fn unmark(&self, names: &[String]) {
        let mut inner = self.inner.lock();

        if let Some(seen) = &mut inner.seen {
            for name in names {
                seen.remove(name);
            }
        }
    }

    /// Records metrics newly observed on the write path.
    pub async fn observe(&self, items: Vec<MetricCatalogItem>) {
        let candidates = self.candidates(items);

        if candidates.is_empty() {
            return;
        }

        let suppress = match &self.external {
            Some(store) => {
                let names: Vec<String> =
                    candidates.iter().map(|item| item.name.clone()).collect();

                match store.filter_seen(&names).await {
                    Ok(seen) => seen,
                    // Failing open over-queues at worst; the upsert is
                    // idempotent.
                    Err(_) => {
                        metrics().catalog_seen_store_errors.inc();

                        HashSet::new()
                    }
                }
            }
            None => HashSet::new(),
        };

        let dropped = self.add_batch(candidates, &suppress);

        if dropped > 0 {
            metrics().catalog_buffer_dropped.inc_by(dropped);
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// Spawns the background flusher that periodically upserts drained items
/// into the catalog.
pub fn spawn_flusher(
    buffer: Arc<CatalogBuffer>,
    store: Arc<dyn Store>,
    settings: CatalogBufferSettings,
    mut shutdown: Shutdown,
    log: Logger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.signalled() => {
                    // One final best-effort flush.
                    flush_once(&buffer, &store, &settings, &log).await;
                    break;
                }
                _ = ticker.tick() => flush_once(&buffer, &store, &settings, &log).await,
            }
        }
    })
}

async fn flush_once(
    buffer: &CatalogBuffer,
    store: &Arc<dyn Store>,
    settings: &CatalogBufferSettings,
    log: &Logger,
) {
    let items = buffer.snapshot();

    if items.is_empty() {
        return;
    }

    let names: Vec<String> = items.iter().map(|item| item.name.clone()).collect();

    match timeout(settings.op_timeout(), store.upsert_metrics_catalog(&items)).await {
        Ok(Ok(())) => {
            metrics()
                .catalog_flushes
                .get_or_create(&OutcomeLabels::ok())
                .inc();

            if let Some(external) = &buffer.external {
                if external.mark_seen(&names, settings.seen_ttl()).await.is_err() {
                    metrics().catalog_seen_store_errors.inc();
                }
            }
        }
        // Items are dropped from the buffer; the next observation
        // re-queues them.
        res => {
            buffer.unmark(&names);
            metrics()
                .catalog_flushes
                .get_or_create(&OutcomeLabels::error())
                .inc();

            match res {
                Ok(Err(e)) => {
                    slog::warn!(log, "catalog flush failed"; "items" => items.len(), "error" => %e);
                }
                _ => {
                    slog::warn!(log, "catalog flush timed out"; "items" => items.len());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(name: &str) -> MetricCatalogItem {
        MetricCatalogItem {
            name: name.to_owned(),
            metric_type: Default::default(),
            help: String::new(),
            unit: String::new(),
            last_synced_at: Utc::now(),
        }
    }

    fn buffer(capacity: usize, seen_ttl_secs: u64) -> CatalogBuffer {
        CatalogBuffer::new(
            &CatalogBufferSettings {
                buffer_size: capacity,
                seen_ttl_secs,
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_observation_within_ttl_queues_once() {
        let buffer = buffer(16, 60);

        buffer.observe(vec![item("up")]).await;
        assert_eq!(buffer.pending_len(), 1);

        // Still pending: suppressed by the pending layer.
        buffer.observe(vec![item("up")]).await;
        assert_eq!(buffer.pending_len(), 1);

        // Flushed: suppressed by the seen layer.
        assert_eq!(buffer.snapshot().len(), 1);
        buffer.observe(vec![item("up")]).await;
        assert_eq!(buffer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn observation_after_ttl_queues_again() {
        let buffer = buffer(16, 60);

        buffer.observe(vec![item("up")]).await;
        buffer.snapshot();

        tokio::time::advance(Duration::from_secs(61)).await;

        buffer.observe(vec![item("up")]).await;
        assert_eq!(buffer.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_drops_and_counts() {
        let buffer = buffer(2, 60);

        let candidates = buffer.candidates(vec![item("a"), item("b"), item("c")]);
        let dropped = buffer.add_batch(candidates, &HashSet::new());

        assert_eq!(dropped, 1);
        assert_eq!(buffer.pending_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_unmarks_seen_names() {
        let buffer = buffer(16, 60);

        buffer.observe(vec![item("up")]).await;
        let items = buffer.snapshot();
        let names: Vec<String> = items.iter().map(|i| i.name.clone()).collect();

        // Simulates the failure path of the flusher.
        buffer.unmark(&names);

        buffer.observe(vec![item("up")]).await;
        assert_eq!(buffer.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_store_answer_suppresses_candidates() {
        let buffer = buffer(16, 60);

        let candidates = buffer.candidates(vec![item("a"), item("b")]);
        let suppress = HashSet::from(["a".to_owned()]);

        buffer.add_batch(candidates, &suppress);

        assert_eq!(buffer.pending_len(), 1);
    }
}
