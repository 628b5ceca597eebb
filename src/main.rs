// =============================================================================
// Bar Relay — Main Entry Point
// =============================================================================
//
// One upstream provider connection carries 1-minute bars. They are aggregated
// into every timeframe, cached, and pushed to local clients over WebSocket.
// Reads for keys not yet in memory are served from the provider's history
// API under a strict request quota.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcaster;
mod error;
mod market_data;
mod provider;
mod runtime_config;
mod stats;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::BarAggregator;
use crate::provider::{HistoryClient, UpstreamManager, WsConnector};
use crate::runtime_config::{RuntimeConfig, DEFAULT_CONFIG_PATH};
use crate::types::ConnectionState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Bar Relay — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("BAR_RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|key| std::env::var(key).ok());
    config.validate().context("invalid runtime configuration")?;

    if config.api_key.is_empty() {
        warn!("BAR_RELAY_API_KEY is not set — provider calls will be rejected");
    }
    info!(symbols = ?config.symbols, "Default symbols");

    // ── 2. Build shared state ────────────────────────────────────────────
    let history = Arc::new(HistoryClient::new(&config.history_base_url, &config.api_key)?);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let calendar = config.session_calendar()?;
    let state = Arc::new(AppState::new(config, history, state_rx)?);
    let shutdown = state.shutdown.clone();

    // ── 3. Aggregation pipeline ──────────────────────────────────────────
    let (bars_tx, bars_rx) = mpsc::channel(state.config.event_channel_depth);
    let aggregator = BarAggregator::new(calendar, state.stats.clone())
        .with_max_future_skew(state.config.max_future_skew());
    let pipeline = tokio::spawn(market_data::run_aggregation(
        aggregator,
        bars_rx,
        state.cache.clone(),
        state.broadcaster.clone(),
        shutdown.clone(),
    ));

    // ── 4. Upstream connection ───────────────────────────────────────────
    let upstream = UpstreamManager::new(
        Arc::new(WsConnector::new(state.config.provider_ws_url.clone())),
        state.config.upstream_settings(),
        state.subscription_bucket.clone(),
        bars_tx,
        state.broadcaster.desired_symbols(),
        state_tx,
        state.stats.clone(),
        shutdown.clone(),
    );
    let upstream = tokio::spawn(async move {
        let terminal = upstream.run().await;
        info!(state = %terminal, "upstream task finished");
    });

    // ── 5. Start the API server ──────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    shutdown.cancel();

    if let Err(e) = upstream.await {
        error!(error = %e, "upstream task panicked");
    }
    if let Err(e) = pipeline.await {
        error!(error = %e, "aggregation task panicked");
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    info!(counters = ?state.stats.snapshot(), "Bar Relay shut down complete.");
    Ok(())
}
