mod config;
mod data;
mod engine;
mod execution;
mod ingest;
mod monitoring;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing_subscriber::EnvFilter;
use config::{Config, EnvConfig};
use data::cache::MarketCache;
use data::scoring::HttpScorer;
use data::stream_api::XStreamClient;
use engine::ProbabilityEngine;
use execution::persistence::StateStore;
use ingest::connection::StreamConsumer;
use ingest::pipeline::IngestPipeline;
use ingest::rules::RuleSynchronizer;
use ingest::updater::MarketUpdater;
use monitoring::logger::CsvLogger;
use monitoring::metrics::IngestMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Evidence worker starting...");

    // Load configuration; missing credentials are fatal
    tracing::info!("Loading configuration...");
    let config = Config::load("config.toml")?;
    let env_config = EnvConfig::load()?;

    tracing::info!("Stream API: {}", env_config.x_api_base_url);
    tracing::info!("Scorer: {}", env_config.scorer_api_url);
    tracing::info!("CSV logging: {}", config.monitoring.csv_logging);

    // Initialize database
    tracing::info!("Initializing database: {}", config.system.database_path);
    let store = Arc::new(StateStore::new(&config.system.database_path)?);
    execution::persistence::report_state(&store)?;

    let csv = if config.monitoring.csv_logging {
        let logger = CsvLogger::new(config.monitoring.csv_log_path.clone())?;
        logger.log_event("worker started")?;
        Some(logger)
    } else {
        None
    };

    let metrics = Arc::new(IngestMetrics::new()?);
    let sync_trigger = Arc::new(Notify::new());
    let scorer = Arc::new(HttpScorer::new(
        env_config.scorer_api_url.clone(),
        env_config.scorer_api_key.clone(),
        Duration::from_secs(config.ingest.scorer_timeout_secs),
    )?);
    let updater = Arc::new(MarketUpdater::new(
        ProbabilityEngine::new(config.engine.clone()),
        Arc::clone(&store),
        csv,
    ));
    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&store),
        scorer,
        updater,
        MarketCache::new(Duration::from_secs(config.ingest.outcome_cache_ttl_secs)),
        Arc::clone(&metrics),
    ).with_sync_trigger(Arc::clone(&sync_trigger)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (job_tx, job_rx) = mpsc::channel(config.ingest.queue_capacity.max(1));

    let sync_task = tokio::spawn(ingest::rules::run_sync_loop(
        RuleSynchronizer::new(XStreamClient::new(
            env_config.x_api_base_url.clone(),
            env_config.x_bearer_token.clone(),
        )),
        Arc::clone(&store),
        config.stream.sync_schedule(),
        Arc::clone(&sync_trigger),
        shutdown_rx.clone(),
    ));

    let worker_task = tokio::spawn(ingest::pipeline::run_workers(
        pipeline,
        job_rx,
        config.ingest.max_in_flight,
        Duration::from_secs(config.ingest.shutdown_grace_secs),
        shutdown_rx.clone(),
    ));

    let mut consumer = StreamConsumer::new(
        XStreamClient::new(env_config.x_api_base_url.clone(), env_config.x_bearer_token.clone()),
        config.stream.reconnect_policy(),
        Arc::clone(&metrics),
    );
    let stream_rx = shutdown_rx.clone();
    let stream_task = tokio::spawn(async move {
        consumer.run(job_tx, stream_rx).await;
    });

    let metrics_task = tokio::spawn(monitoring::metrics::run_reporter(
        Arc::clone(&metrics),
        Duration::from_secs(config.monitoring.metrics_log_interval_secs),
        shutdown_rx,
    ));

    tracing::info!("Worker initialized, streaming posts");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    shutdown_tx.send(true)?;

    for (name, task) in [
        ("stream", stream_task),
        ("workers", worker_task),
        ("rule sync", sync_task),
        ("metrics", metrics_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!("{} task failed: {}", name, e);
        }
    }

    tracing::info!("Final metrics: {:?}", metrics.snapshot());
    Ok(())
}
