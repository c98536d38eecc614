// =============================================================================
// Central Application State — Meridian Chart Feed
// =============================================================================
//
// The single source of truth for the feed service. The subscription
// controller owns the live pipeline; AppState ties it together with the
// runtime config and provides a unified snapshot for the dashboard API.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::{ConnectionManager, SeriesStore, TickTransport};
use crate::runtime_config::RuntimeConfig;
use crate::subscription::SubscriptionController;
use crate::types::{Candle, ConnectionState, Subscription};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Central state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// configuration or subscription mutation. Combined with the series
    /// store's own version so pollers detect both kinds of change.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub series_store: Arc<SeriesStore>,
    pub controller: SubscriptionController,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the feed was started. Used for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the feed state from the given configuration and transport.
    ///
    /// The transport is injected so that the whole service can be exercised
    /// without a network. The returned value is typically wrapped in `Arc`
    /// immediately.
    pub fn new(config: RuntimeConfig, transport: Arc<dyn TickTransport>) -> Self {
        let series_store = Arc::new(SeriesStore::new());
        let manager = ConnectionManager::new(
            config.stream_endpoint.clone(),
            config.reconnect_policy(),
            transport,
        );
        let controller = SubscriptionController::new(manager, series_store.clone());

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            series_store,
            controller,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Increment the state version after a meaningful mutation.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Combined change counter: configuration/subscription changes plus
    /// series mutations.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst) + self.series_store.version()
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted when the limit is
    /// reached.
    pub fn push_error(&self, msg: String) {
        let record = ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Build the feed status snapshot for `GET /api/v1/status`.
    pub fn build_status(&self) -> FeedStatus {
        let state = self.controller.connection_state();
        FeedStatus {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            connection_state: state,
            live: state.is_live(),
            subscription: self.controller.current_subscription(),
            candle_count: self.series_store.len(),
            dropped_ticks: self.controller.dropped_ticks(),
            decode_errors: self.controller.decode_errors(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    /// Build the series snapshot for `GET /api/v1/series`.
    pub fn build_series(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            state_version: self.current_state_version(),
            subscription: self.controller.current_subscription(),
            candles: self.series_store.snapshot(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types (match the dashboard's TypeScript interfaces)
// =============================================================================

/// Operational status of the feed — the dashboard's live/idle banner.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub state_version: u64,
    pub server_time: i64,
    pub connection_state: ConnectionState,
    /// Derived live/idle indicator; the dashboard shows this, never raw
    /// error text.
    pub live: bool,
    pub subscription: Option<Subscription>,
    pub candle_count: usize,
    pub dropped_ticks: u64,
    pub decode_errors: u64,
    pub uptime_secs: u64,
    pub recent_errors: Vec<ErrorRecord>,
}

/// The candle series for the active subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub state_version: u64,
    pub subscription: Option<Subscription>,
    pub candles: Vec<Candle>,
}
