//! End-to-end tests of the ingestion pipeline against the embedded store.

use chrono::Utc;
use promscope::ingest;
use promscope::settings::IngestSettings;
use promscope::shutdown::ShutdownController;
use promscope::storage::sqlite::SqliteStore;
use promscope::storage::{QueryRecord, QueryType, Store, TimeRange};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn record(i: usize) -> QueryRecord {
    QueryRecord {
        ts: Utc::now(),
        fingerprint: format!("fp-{i}"),
        query_param: "up".to_owned(),
        query_type: QueryType::Instant,
        time_param: None,
        start: None,
        end: None,
        step: None,
        status_code: 200,
        duration_ms: 1.0,
        body_size: 1,
        total_queryable_samples: 0,
        peak_samples: 0,
        label_matchers: vec![BTreeMap::from([("__name__".to_owned(), "up".to_owned())])],
    }
}

fn discard() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

async fn row_count(store: &Arc<dyn Store>) -> i64 {
    store
        .query_types(TimeRange::last_days(1), None)
        .await
        .unwrap()
        .total_queries
}

#[tokio::test]
async fn graceful_shutdown_drains_the_queue() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());

    let settings = IngestSettings {
        buffer_size: 128,
        batch_size: 10,
        flush_interval_secs: 3600,
        grace_period_secs: 5,
        ..Default::default()
    };

    let controller = ShutdownController::new();
    let (ingestor, rx) = ingest::channel(&settings);
    let consumer = ingest::spawn_consumer(
        rx,
        Arc::clone(&store),
        settings,
        Duration::from_secs(10),
        controller.subscribe(),
        discard(),
    );

    for i in 0..50 {
        ingestor.ingest(record(i)).await.unwrap();
    }

    controller.signal();
    drop(ingestor);

    let report = consumer.await.unwrap();

    assert_eq!(report.flushed_rows, 50);
    assert_eq!(report.dropped, 0);
    assert_eq!(row_count(&store).await, 50);
}

#[tokio::test]
async fn batch_size_triggers_a_flush() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());

    let settings = IngestSettings {
        batch_size: 5,
        flush_interval_secs: 3600,
        ..Default::default()
    };

    let controller = ShutdownController::new();
    let (ingestor, rx) = ingest::channel(&settings);
    let consumer = ingest::spawn_consumer(
        rx,
        Arc::clone(&store),
        settings,
        Duration::from_secs(10),
        controller.subscribe(),
        discard(),
    );

    for i in 0..5 {
        ingestor.ingest(record(i)).await.unwrap();
    }

    // The batch trigger flushes without waiting for the interval.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if row_count(&store).await == 5 {
            break;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "batch flush never happened"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    controller.signal();
    drop(ingestor);

    let report = consumer.await.unwrap();

    assert_eq!(report.flushed_rows, 5);
    assert_eq!(report.dropped, 0);
}

#[tokio::test]
async fn interval_flushes_partial_batches() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect_in_memory().await.unwrap());

    let settings = IngestSettings {
        batch_size: 1000,
        flush_interval_secs: 1,
        ..Default::default()
    };

    let controller = ShutdownController::new();
    let (ingestor, rx) = ingest::channel(&settings);
    let _consumer = ingest::spawn_consumer(
        rx,
        Arc::clone(&store),
        settings,
        Duration::from_secs(10),
        controller.subscribe(),
        discard(),
    );

    ingestor.ingest(record(0)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if row_count(&store).await == 1 {
            break;
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "interval flush never happened"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
