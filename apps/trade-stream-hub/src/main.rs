//! Trade Stream Hub Binary
//!
//! Starts the ingestion pipeline, the public API server and the health server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-stream-hub
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `STOCK_API_KEY`: Upstream feed token
//!
//! ## Optional
//! - `FEED_URL`: Upstream WebSocket endpoint (default: wss://ws.finnhub.io)
//! - `FEED_SYMBOL`: Symbol to subscribe to (default: BINANCE:BTCUSDT)
//! - `MAX_HISTORY`: History window capacity (default: 150000)
//! - `SUBSCRIBER_QUEUE_CAPACITY`: Per-viewer queue bound (default: 1024)
//! - `SUBSCRIBER_OVERFLOW_POLICY`: drop_oldest | disconnect (default: drop_oldest)
//! - `TRADE_STORE`: sqlite | memory (default: sqlite)
//! - `TRADE_DB_PATH`: SQLite file (default: data/trades.db)
//! - `API_PORT`: Public API port (default: 3001)
//! - `HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `SHUTDOWN_GRACE_SECS`: Persistence drain on shutdown (default: 10)
//! - `PERSIST_QUEUE_CAPACITY`: Trades awaiting the store writer (default: 8192)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `RUST_LOG`: Log level (default: info)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use trade_stream_hub::infrastructure::telemetry;
use trade_stream_hub::{
    ApiServer, ApiState, BroadcastConfig, BroadcastHub, FeedClient, FeedClientConfig,
    HealthServer, HealthServerState, HubConfig, IngestionPipeline, PipelineConfig, init_metrics,
    open_store,
};

/// Extra time allowed on top of the persistence grace period before giving up
/// on the pipeline task.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Trade Stream Hub");

    let _metrics_handle = init_metrics()?;

    let config = HubConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let store = open_store(&config.store)?;
    let hub = Arc::new(BroadcastHub::new(BroadcastConfig::from(config.broadcast)));
    let pipeline_config = PipelineConfig::from_hub_config(&config);
    let shutdown_grace = pipeline_config.shutdown_grace;
    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        pipeline_config,
    ));

    if let Err(e) = pipeline.warm_start().await {
        tracing::warn!(error = %e, "Starting with an empty history window");
    }

    // Bind before spawning so a taken port fails startup.
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.server.api_port));
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API port {}", config.server.api_port))?;
    tracing::info!(addr = %api_addr, "API server listening");

    let api_server = ApiServer::new(
        config.server.api_port,
        ApiState::new(
            Arc::clone(&pipeline),
            Arc::clone(&store),
            shutdown_token.clone(),
        ),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = api_server.serve(api_listener).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&pipeline),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let feed = FeedClient::new(FeedClientConfig::from_hub_config(&config));
    let pipeline_cancel = shutdown_token.clone();
    let pipeline_runner = Arc::clone(&pipeline);
    let mut pipeline_task =
        tokio::spawn(async move { pipeline_runner.run(&feed, pipeline_cancel).await });

    tracing::info!("Trade Stream Hub ready");

    let outcome = tokio::select! {
        signal = await_shutdown_signal() => {
            signal?;
            shutdown_token.cancel();
            tracing::info!(
                grace_secs = shutdown_grace.as_secs(),
                "Graceful shutdown started"
            );
            match tokio::time::timeout(shutdown_grace + SHUTDOWN_MARGIN, &mut pipeline_task).await {
                Ok(joined) => joined.context("pipeline task panicked")?,
                Err(_) => {
                    tracing::warn!("Pipeline did not stop within the grace period");
                    Ok(())
                }
            }
        }
        joined = &mut pipeline_task => {
            shutdown_token.cancel();
            joined.context("pipeline task panicked")?
        }
    };

    outcome.context("ingestion pipeline failed")?;
    tracing::info!("Trade Stream Hub stopped");
    Ok(())
}

/// Load `.env` from the current directory or the nearest ancestor that has one.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &HubConfig) {
    tracing::info!(
        symbol = %config.feed.symbol,
        max_history = config.pipeline.max_history,
        queue_capacity = config.broadcast.queue_capacity,
        overflow_policy = config.broadcast.overflow_policy.as_str(),
        store = config.store.backend.as_str(),
        api_port = config.server.api_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(feed_url = %config.feed.url, db_path = %config.store.db_path.display(), "Endpoints");
}

/// Wait for SIGINT or SIGTERM.
async fn await_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
        Ok(())
    }
}
