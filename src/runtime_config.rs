// =============================================================================
// Runtime Configuration — Chart feed settings with atomic save
// =============================================================================
//
// Central configuration for the Meridian chart feed: the stream endpoint,
// the default market, the selectable timeframe set, and the reconnection
// policy. Reconnection and interval constants are configuration, never
// hidden internals, so operators can tune them without touching the
// aggregation pipeline.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::ReconnectPolicy;
use crate::types::Subscription;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_stream_endpoint() -> String {
    "wss://stream.meridian.trade/v1/ticks".to_string()
}

fn default_exchange() -> String {
    "BINANCE".to_string()
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval_ms() -> i64 {
    60_000
}

fn default_interval_options_ms() -> Vec<i64> {
    // 1s, 5s, 15s, 1m, 5m, 15m, 1h.
    vec![1_000, 5_000, 15_000, 60_000, 300_000, 900_000, 3_600_000]
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the chart feed.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Stream source --------------------------------------------------

    /// WebSocket endpoint the tick streams connect to. The subscription is
    /// carried as query parameters.
    #[serde(default = "default_stream_endpoint")]
    pub stream_endpoint: String,

    // --- Default market -------------------------------------------------

    /// Exchange shown when the dashboard first loads.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Symbol shown when the dashboard first loads.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Candle interval active on first load, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,

    /// Timeframes the dashboard offers. Subscription changes are validated
    /// against this set at the API boundary.
    #[serde(default = "default_interval_options_ms")]
    pub interval_options_ms: Vec<i64>,

    // --- Reconnection policy --------------------------------------------

    /// Reconnect attempts allowed per subscription before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// WebSocket handshake timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream_endpoint: default_stream_endpoint(),
            exchange: default_exchange(),
            symbol: default_symbol(),
            interval_ms: default_interval_ms(),
            interval_options_ms: default_interval_options_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            endpoint = %config.stream_endpoint,
            default_market = %config.default_subscription(),
            "feed config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise feed config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "feed config saved (atomic)");
        Ok(())
    }

    /// The subscription the feed starts with.
    pub fn default_subscription(&self) -> Subscription {
        Subscription::new(self.exchange.clone(), self.symbol.clone(), self.interval_ms)
    }

    /// Reconnection constants for the connection manager.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            retry_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Whether an interval belongs to the selectable timeframe set.
    pub fn is_supported_interval(&self, interval_ms: i64) -> bool {
        self.interval_options_ms.contains(&interval_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.exchange, "BINANCE");
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval_ms, 60_000);
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert_eq!(cfg.reconnect_delay_ms, 5_000);
        assert!(cfg.interval_options_ms.contains(&1_000));
        assert!(cfg.interval_options_ms.contains(&3_600_000));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.max_reconnect_attempts, 5);
        assert!(cfg.stream_endpoint.starts_with("wss://"));
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "interval_ms": 5000 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval_ms, 5_000);
        assert_eq!(cfg.exchange, "BINANCE");
        assert_eq!(cfg.reconnect_delay_ms, 5_000);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.stream_endpoint, cfg2.stream_endpoint);
        assert_eq!(cfg.interval_options_ms, cfg2.interval_options_ms);
        assert_eq!(cfg.max_reconnect_attempts, cfg2.max_reconnect_attempts);
    }

    #[test]
    fn default_subscription_mirrors_config() {
        let cfg = RuntimeConfig::default();
        let sub = cfg.default_subscription();
        assert_eq!(sub.exchange, cfg.exchange);
        assert_eq!(sub.symbol, cfg.symbol);
        assert_eq!(sub.interval_ms, cfg.interval_ms);
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn reconnect_policy_mirrors_config() {
        let json = r#"{ "max_reconnect_attempts": 2, "reconnect_delay_ms": 1500 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        let policy = cfg.reconnect_policy();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.retry_delay, Duration::from_millis(1_500));
    }

    #[test]
    fn interval_membership() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.is_supported_interval(60_000));
        assert!(!cfg.is_supported_interval(42));
    }
}
