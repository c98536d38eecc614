// =============================================================================
// Meridian Chart Feed — Main Entry Point
// =============================================================================
//
// Live market-data service behind the dashboard price chart: one streaming
// tick subscription at a time, folded into OHLC candles and served to the
// renderer over a read-only REST snapshot API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod market_data;
mod runtime_config;
mod subscription;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::WsTransport;
use crate::runtime_config::RuntimeConfig;
use crate::types::ConnectionState;

const CONFIG_PATH: &str = "feed_config.json";

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
    info!("║        Meridian Chart Feed — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override the stream source and default market from env if available.
    if let Ok(endpoint) = std::env::var("MERIDIAN_STREAM_ENDPOINT") {
        config.stream_endpoint = endpoint;
    }
    if let Ok(exchange) = std::env::var("MERIDIAN_EXCHANGE") {
        config.exchange = exchange.trim().to_uppercase();
    }
    if let Ok(symbol) = std::env::var("MERIDIAN_SYMBOL") {
        config.symbol = symbol.trim().to_uppercase();
    }

    info!(
        endpoint = %config.stream_endpoint,
        market = %config.default_subscription(),
        max_reconnect_attempts = config.max_reconnect_attempts,
        reconnect_delay_ms = config.reconnect_delay_ms,
        "Feed configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let transport = Arc::new(WsTransport::new(config.connect_timeout()));
    let state = Arc::new(AppState::new(config, transport));

    // ── 3. Open the initial subscription ─────────────────────────────────
    let initial = state.runtime_config.read().default_subscription();
    state.controller.set_subscription(initial.clone())?;
    info!(subscription = %initial, "Initial subscription opened");

    // ── 4. Stream health monitor ─────────────────────────────────────────
    let monitor_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        let mut last = monitor_state.controller.connection_state();
        loop {
            interval.tick().await;
            let now = monitor_state.controller.connection_state();
            if now != last {
                info!(from = %last, to = %now, "stream state changed");
                if now == ConnectionState::GivenUp {
                    monitor_state.push_error(
                        "tick stream gave up after exhausting reconnect attempts".to_string(),
                    );
                }
                last = now;
            }
        }
    });

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("Feed running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.controller.clear_subscription();

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save feed config on shutdown");
    }

    info!("Meridian Chart Feed shut down complete.");
    Ok(())
}
