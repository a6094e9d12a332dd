mod ai;
mod compress;
mod config;
mod dlq;
mod error;
mod event_hub;
mod health_ws;
mod http;
mod hub;
mod models;
mod otlp;
mod repository;
mod state;
mod telemetry;
mod tsdb;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ai::AiWorker;
use config::Args;
use dlq::{repository_replay_handler, DeadLetterQueue};
use event_hub::EventHub;
use hub::BroadcastHub;
use otlp::{run_otlp_server, Ingestor};
use repository::{Repository, SqliteRepository};
use state::AppState;
use telemetry::TelemetryRegistry;
use tsdb::TsdbAggregator;

/// Grace period given to in-flight HTTP requests once shutdown starts
/// (spec §5).
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())))
        .init();

    info!(app_env = %args.app_env, "starting argus");

    let telemetry = Arc::new(TelemetryRegistry::new());

    let repo: Arc<dyn Repository> = match args.db_driver.as_str() {
        "sqlite" => Arc::new(
            SqliteRepository::open(&args.db_dsn, telemetry.clone())
                .context("failed to open sqlite storage")?,
        ),
        other => anyhow::bail!("unsupported DB_DRIVER: {other} (only sqlite has a concrete driver)"),
    };

    let dlq = DeadLetterQueue::new(
        &args.dlq_path,
        args.dlq_replay_interval,
        repository_replay_handler(repo.clone()),
        telemetry.clone(),
    )
    .await
    .context("failed to initialize dead-letter queue")?;

    let tsdb = TsdbAggregator::start(repo.clone(), tsdb::DEFAULT_WINDOW);
    let broadcast_hub = BroadcastHub::start(telemetry.clone());
    let event_hub = EventHub::start(repo.clone(), telemetry.clone());
    let ai_worker = AiWorker::start(args.ai_enabled);

    let log_callback: Arc<dyn Fn(models::Log) + Send + Sync> = {
        let broadcast_hub = broadcast_hub.clone();
        let event_hub = event_hub.clone();
        let ai_worker = ai_worker.clone();
        Arc::new(move |log: models::Log| {
            broadcast_hub.ingest_log(log.clone());
            event_hub.ingest_log(log.clone());
            ai_worker.submit(log);
        })
    };
    let metric_callback: Arc<dyn Fn(models::RawMetricPoint) + Send + Sync> = {
        let broadcast_hub = broadcast_hub.clone();
        let event_hub = event_hub.clone();
        Arc::new(move |point: models::RawMetricPoint| {
            broadcast_hub.ingest_metric(point.clone());
            event_hub.ingest_metric(point);
        })
    };

    let ingestor = Arc::new(Ingestor {
        repo: repo.clone(),
        dlq: dlq.clone(),
        tsdb: tsdb.clone(),
        telemetry: telemetry.clone(),
        filter: otlp::IngestFilterConfig::from_args(&args),
        log_callback,
        metric_callback,
    });

    let state = AppState {
        repo,
        telemetry,
        dlq: dlq.clone(),
        tsdb: tsdb.clone(),
        broadcast_hub: broadcast_hub.clone(),
        event_hub: event_hub.clone(),
        ai_worker: ai_worker.clone(),
        config: Arc::new(args.clone()),
    };

    let (grpc_shutdown_tx, mut grpc_shutdown_rx) = watch::channel(false);
    let (http_shutdown_tx, mut http_shutdown_rx) = watch::channel(false);

    let grpc_addr = args.otlp_addr();
    let grpc_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = grpc_shutdown_rx.changed().await;
        };
        if let Err(e) = run_otlp_server(ingestor, &grpc_addr, shutdown).await {
            error!(error = %e, "OTLP gRPC server exited with error");
        }
    });

    let http_addr = args.http_addr();
    let http_task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = http_shutdown_rx.changed().await;
        };
        if let Err(e) = ws::run_http_server_with_shutdown(state, &http_addr, shutdown).await {
            error!(error = %e, "HTTP server exited with error");
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl_c")?;
    info!("shutdown signal received, draining in order");

    // Ordering (spec §5): gRPC ingest stops first so no new data enters,
    // HTTP/WS then gets a grace period to drain in-flight requests, the
    // background workers stop innermost-out, and the DLQ gets the last
    // word so anything still queued gets one more replay attempt before
    // the process exits.
    let _ = grpc_shutdown_tx.send(true);
    let _ = grpc_task.await;

    let _ = http_shutdown_tx.send(true);
    if tokio::time::timeout(HTTP_SHUTDOWN_GRACE, http_task).await.is_err() {
        error!("HTTP server did not shut down within grace period");
    }

    ai_worker.stop().await;
    tsdb.stop().await;
    event_hub.stop().await;
    broadcast_hub.stop().await;
    dlq.stop().await;

    info!("argus stopped");
    Ok(())
}
