//! Market Stream Bridge Binary
//!
//! Binds the configured topics, logs view updates, and serves health and
//! metrics until shutdown.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-bridge
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_STREAM_URL`: Upstream WebSocket endpoint (ws:// or wss://)
//!
//! ## Optional
//! - `MARKET_STREAM_TOKEN`: Bearer token sent on connect
//! - `MARKET_STREAM_TOPICS`: Comma-separated topics to bind at startup
//! - `MARKET_STREAM_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `MARKET_STREAM_HEARTBEAT_INTERVAL_SECS`: Ping interval (default: 30)
//! - `MARKET_STREAM_HEARTBEAT_TIMEOUT_SECS`: Pong timeout (default: 60)
//! - `MARKET_STREAM_RECONNECT_DELAY_INITIAL_MS`: First backoff delay (default: 500)
//! - `MARKET_STREAM_RECONNECT_DELAY_MAX_SECS`: Backoff cap (default: 30)
//! - `MARKET_STREAM_RECONNECT_DELAY_MULTIPLIER`: Backoff growth (default: 2.0)
//! - `MARKET_STREAM_RECONNECT_JITTER`: Backoff jitter fraction (default: 0.1)
//! - `MARKET_STREAM_MAX_RECONNECT_ATTEMPTS`: 0 for unlimited (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream-bridge)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use market_stream_bridge::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_bridge::infrastructure::telemetry;
use market_stream_bridge::{
    BridgeConfig, ConnectionConfig, ConnectionManager, ConnectionStatus, JsonCodec, MarketStream,
    StatusUpdate, ViewStateAdapter, ViewStateHandle, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Stream Bridge");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = BridgeConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let transport = WebSocketTransport::new(config.auth_token.clone());
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(transport),
        ConnectionConfig::from_websocket_settings(&config.websocket),
    ));
    let stream = MarketStream::new(
        config.endpoint.clone(),
        Arc::clone(&manager),
        Arc::new(JsonCodec::new()),
    );
    let adapter = Arc::new(ViewStateAdapter::new(stream.clone()));

    let status_observer = stream.on_status(Arc::new(|update: &StatusUpdate| match update.status {
        ConnectionStatus::Failed => tracing::error!(
            connection_id = %update.connection_id,
            error = update.error.as_deref().unwrap_or("unknown"),
            "Market stream failed"
        ),
        ConnectionStatus::Reconnecting => tracing::warn!(
            attempt = update.attempt,
            backoff_ms = update.backoff.map(|d| d.as_millis()),
            "Market stream reconnecting"
        ),
        status => tracing::info!(status = %status, "Market stream status"),
    }));

    // Health server
    let health_state = Arc::new(
        HealthServerState::new(env!("CARGO_PKG_VERSION").to_string(), stream.clone())
            .with_adapter(Arc::clone(&adapter)),
    );
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Bind startup topics
    let mut views = Vec::with_capacity(config.topics.len());
    let mut watchers = JoinSet::new();
    for topic in &config.topics {
        let view = adapter.bind(topic.as_str());
        watchers.spawn(watch_view(
            view.changes(),
            view.topic().to_string(),
            shutdown_token.clone(),
        ));
        views.push(view);
    }

    if views.is_empty() {
        tracing::warn!("No topics configured; bridge is idle until topics are bound");
    }

    tracing::info!(topics = views.len(), "Market stream bridge ready");

    await_shutdown(shutdown_token.clone()).await;

    release_views(&adapter, &views);
    stream.remove_status_observer(status_observer);

    let drain = async {
        while watchers.join_next().await.is_some() {}
        let _ = health_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!(connections = manager.connection_count(), "Market stream bridge stopped");
    Ok(())
}

/// Log every state change of one view until shutdown.
async fn watch_view(
    mut changes: tokio_stream::wrappers::WatchStream<market_stream_bridge::ViewState>,
    topic: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = changes.next() => {
                let Some(state) = next else { break };
                tracing::info!(
                    topic = %topic,
                    status = ?state.status,
                    price = ?state.last_price,
                    updates = state.update_count,
                    error = state.error.as_deref(),
                    "View updated"
                );
            }
        }
    }
}

fn release_views(adapter: &ViewStateAdapter, views: &[ViewStateHandle]) {
    for view in views {
        adapter.release(view);
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &BridgeConfig) {
    tracing::info!(
        endpoint = %config.endpoint,
        topics = ?config.topics,
        authenticated = config.auth_token.is_some(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.websocket.heartbeat_interval.as_secs(),
        reconnect_delay_initial_ms = config.websocket.reconnect_delay_initial.as_millis(),
        reconnect_delay_max_secs = config.websocket.reconnect_delay_max.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        "Connection settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
