// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The dashboard polls `/status` and
// `/series` (cheap change detection via `state_version`) and switches
// markets/timeframes through `POST /subscription`.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::Subscription;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/series", get(series))
        .route("/api/v1/intervals", get(intervals))
        .route("/api/v1/subscription", get(get_subscription))
        .route("/api/v1/subscription", post(set_subscription))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Feed status & series
// =============================================================================

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_status())
}

async fn series(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_series())
}

// =============================================================================
// Intervals
// =============================================================================

async fn intervals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.runtime_config.read();
    let body = serde_json::json!({
        "interval_options_ms": config.interval_options_ms,
        "active_interval_ms": state
            .controller
            .current_subscription()
            .map(|s| s.interval_ms),
    });
    Json(body)
}

// =============================================================================
// Subscription
// =============================================================================

async fn get_subscription(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.controller.current_subscription() {
        Some(sub) => Json(serde_json::json!({ "subscription": sub })).into_response(),
        None => Json(serde_json::json!({
            "subscription": null,
            "message": "no active subscription"
        }))
        .into_response(),
    }
}

/// Partial update: absent fields keep their current values, so the dashboard
/// can switch just the timeframe or just the symbol.
#[derive(Deserialize)]
struct SubscriptionUpdate {
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    interval_ms: Option<i64>,
}

async fn set_subscription(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SubscriptionUpdate>,
) -> impl IntoResponse {
    let new_sub = {
        let config = state.runtime_config.read();
        let current = state
            .controller
            .current_subscription()
            .unwrap_or_else(|| config.default_subscription());

        let interval_ms = update.interval_ms.unwrap_or(current.interval_ms);
        if !config.is_supported_interval(interval_ms) {
            warn!(interval_ms, "rejecting unsupported interval");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("interval {interval_ms}ms is not in the configured set"),
                    "interval_options_ms": config.interval_options_ms,
                })),
            )
                .into_response();
        }

        Subscription::new(
            update.exchange.unwrap_or(current.exchange),
            update.symbol.unwrap_or(current.symbol),
            interval_ms,
        )
    };

    // Configuration errors surface here, synchronously; stream failures
    // later only ever show up as connection-state changes.
    if let Err(e) = state.controller.set_subscription(new_sub.clone()) {
        warn!(error = %e, "subscription change rejected");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    // Persist the selection as the new default market.
    {
        let mut config = state.runtime_config.write();
        config.exchange = new_sub.exchange.clone();
        config.symbol = new_sub.symbol.clone();
        config.interval_ms = new_sub.interval_ms;
    }
    state.increment_version();
    info!(subscription = %new_sub, "subscription changed via API");

    Json(serde_json::json!({
        "subscription": new_sub,
        "state_version": state.current_state_version(),
    }))
    .into_response()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::bail;
    use futures_util::future::BoxFuture;

    use crate::market_data::transport::{TickTransport, TransportLink};
    use crate::runtime_config::RuntimeConfig;

    struct OfflineTransport;

    impl TickTransport for OfflineTransport {
        fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, anyhow::Result<TransportLink>> {
            Box::pin(async { bail!("offline") })
        }
    }

    fn app_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            RuntimeConfig::default(),
            Arc::new(OfflineTransport),
        ))
    }

    #[tokio::test]
    async fn router_builds() {
        let _router = router(app_state());
    }

    #[tokio::test]
    async fn subscription_update_rejects_unknown_interval() {
        let state = app_state();
        let response = set_subscription(
            State(state.clone()),
            Json(SubscriptionUpdate {
                exchange: None,
                symbol: None,
                interval_ms: Some(42),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.controller.current_subscription().is_none());
    }

    #[tokio::test]
    async fn subscription_update_rejects_blank_symbol() {
        let state = app_state();
        let response = set_subscription(
            State(state.clone()),
            Json(SubscriptionUpdate {
                exchange: None,
                symbol: Some("   ".to_string()),
                interval_ms: None,
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscription_update_merges_partial_fields() {
        let state = app_state();
        let response = set_subscription(
            State(state.clone()),
            Json(SubscriptionUpdate {
                exchange: None,
                symbol: Some("ETHUSDT".to_string()),
                interval_ms: Some(5_000),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);

        let sub = state.controller.current_subscription().unwrap();
        // Exchange fell back to the configured default.
        assert_eq!(sub.exchange, "BINANCE");
        assert_eq!(sub.symbol, "ETHUSDT");
        assert_eq!(sub.interval_ms, 5_000);

        // The selection became the new default market.
        let config = state.runtime_config.read();
        assert_eq!(config.symbol, "ETHUSDT");
        assert_eq!(config.interval_ms, 5_000);
    }
}
