//! Service entry point: loads the configuration, initializes telemetry and
//! storage, spawns the concurrent roots under one shutdown controller, and
//! translates the shutdown outcome into the process exit code.

use promscope::catalog::seen::{RedisSeenStore, SeenStore};
use promscope::catalog::{self, CatalogBuffer};
use promscope::cli::Cli;
use promscope::ingest;
use promscope::otlp::downstream::Downstream;
use promscope::otlp::{self, MetricsIngester};
use promscope::proxy::upstream::Upstream;
use promscope::proxy::{AppState, ProxyServer};
use promscope::shutdown::ShutdownController;
use promscope::syncer::prom::PromClient;
use promscope::syncer::Syncer;
use promscope::{service_info, storage, telemetry, BootstrapResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Extra slack granted to background tasks beyond the ingestion grace
/// period before they are abandoned.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("promscope: fatal: {e:#}");

            1
        }
    };

    std::process::exit(code);
}

async fn run() -> BootstrapResult<i32> {
    let service_info = service_info!();
    let cli = Cli::new(&service_info)?;

    // `--generate` has already written the config; `--dry-run` stops after
    // a successful parse.
    if cli.is_generate() || cli.is_dry_run() {
        return Ok(0);
    }

    let settings = Arc::new(cli.settings);

    telemetry::init(&service_info, &settings.telemetry)?;

    let log = telemetry::log::root();

    slog::info!(log, "starting";
        "version" => service_info.version,
        "provider" => format!("{:?}", settings.database.provider));

    let store = storage::connect(&settings.database).await?;
    let prom = Arc::new(PromClient::new(&settings.upstream)?);
    let controller = ShutdownController::new();

    // Ingestion pipeline.
    let (ingestor, ingest_rx) = ingest::channel(&settings.ingest);
    let consumer = ingest::spawn_consumer(
        ingest_rx,
        Arc::clone(&store),
        settings.ingest.clone(),
        settings.database.op_timeout(),
        controller.subscribe(),
        telemetry::log::subsystem("ingest"),
    );

    // HTTP proxy and analytics API.
    let state = Arc::new(AppState {
        settings: Arc::clone(&settings),
        store: Arc::clone(&store),
        ingestor: ingestor.clone(),
        upstream: Upstream::new(&settings.upstream)?,
        prom: Arc::clone(&prom),
        log: telemetry::log::subsystem("proxy"),
    });

    let server = ProxyServer::bind(settings.server.addr, state)?;

    slog::info!(log, "proxy server is listening"; "addr" => %settings.server.addr);

    let server_task = tokio::spawn(server.serve(controller.subscribe()));

    // Background roots.
    let mut background: Vec<JoinHandle<()>> = vec![];

    if settings.syncer.enabled {
        let syncer = Syncer::new(
            Arc::clone(&store),
            Arc::clone(&prom),
            settings.syncer.clone(),
            telemetry::log::subsystem("syncer"),
        );

        background.push(syncer.spawn(controller.subscribe()));
    }

    // OTLP write path.
    let mut otlp_task: Option<JoinHandle<BootstrapResult<()>>> = None;

    if settings.otlp.enabled {
        let buffer = if settings.otlp.catalog.enabled {
            let external: Option<Arc<dyn SeenStore>> =
                if settings.otlp.catalog.seen_store.enabled {
                    Some(Arc::new(
                        RedisSeenStore::connect(&settings.otlp.catalog.seen_store).await?,
                    ))
                } else {
                    None
                };

            let buffer = Arc::new(CatalogBuffer::new(&settings.otlp.catalog, external));

            background.push(catalog::spawn_flusher(
                Arc::clone(&buffer),
                Arc::clone(&store),
                settings.otlp.catalog.clone(),
                controller.subscribe(),
                telemetry::log::subsystem("catalog"),
            ));

            Some(buffer)
        } else {
            None
        };

        let downstream = if settings.otlp.downstream.enabled {
            Some(Downstream::new(&settings.otlp.downstream, &settings.otlp)?)
        } else {
            None
        };

        let ingester = MetricsIngester::new(
            Arc::clone(&store),
            buffer,
            downstream,
            &settings.otlp,
            telemetry::log::subsystem("otlp"),
        );

        otlp_task = Some(tokio::spawn(otlp::serve(
            ingester,
            settings.otlp.clone(),
            controller.subscribe(),
            telemetry::log::subsystem("otlp"),
        )));
    }

    // Run until a signal arrives or the OTLP server fails.
    match wait_for_shutdown(&log, otlp_task.as_mut()).await? {
        WaitOutcome::Signalled => {}
        WaitOutcome::OtlpExited(res) => {
            controller.signal();
            res?;

            anyhow::bail!("OTLP server exited unexpectedly");
        }
    }

    controller.signal();

    // Producers stop with the server; dropping our handle lets the
    // consumer observe a closed queue once the server is gone.
    drop(ingestor);

    let report = consumer.await.unwrap_or_default();

    let teardown = settings.ingest.grace_period() + SHUTDOWN_SLACK;

    if timeout(teardown, server_task).await.is_err() {
        slog::warn!(log, "proxy server did not stop within the teardown deadline");
    }

    if let Some(task) = otlp_task {
        match timeout(teardown, task).await {
            Ok(Ok(Err(e))) => slog::warn!(log, "OTLP server exited with error"; "error" => %e),
            Err(_) => slog::warn!(log, "OTLP server did not stop within the teardown deadline"),
            _ => {}
        }
    }

    for task in background {
        if timeout(teardown, task).await.is_err() {
            slog::warn!(log, "background task did not stop within the teardown deadline");
        }
    }

    slog::info!(log, "shutdown complete";
        "flushed_rows" => report.flushed_rows, "dropped" => report.dropped);

    // A drain that lost records is a failed graceful shutdown.
    Ok(if report.dropped > 0 { 1 } else { 0 })
}

/// What ended the serving phase.
enum WaitOutcome {
    /// SIGINT or SIGTERM arrived.
    Signalled,
    /// The OTLP server exited on its own.
    OtlpExited(BootstrapResult<()>),
}

/// Waits for SIGINT/SIGTERM, or for the OTLP server to fail on its own.
async fn wait_for_shutdown(
    log: &slog::Logger,
    otlp_task: Option<&mut JoinHandle<BootstrapResult<()>>>,
) -> BootstrapResult<WaitOutcome> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let sigterm = async move {
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let outcome = match otlp_task {
        Some(task) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    slog::info!(log, "received interrupt signal");

                    WaitOutcome::Signalled
                }
                _ = sigterm => {
                    slog::info!(log, "received termination signal");

                    WaitOutcome::Signalled
                }
                res = task => WaitOutcome::OtlpExited(match res {
                    Ok(outcome) => outcome,
                    Err(e) => Err(anyhow::anyhow!("OTLP server panicked: {e}")),
                }),
            }
        }
        None => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => slog::info!(log, "received interrupt signal"),
                _ = sigterm => slog::info!(log, "received termination signal"),
            }

            WaitOutcome::Signalled
        }
    };

    Ok(outcome)
}
