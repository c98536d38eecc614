// =============================================================================
// Shared types used across the Meridian chart feed
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// A single normalized price tick from the upstream stream.
///
/// Ticks are transient: they exist between the transport and the aggregator
/// and are never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Event time in integer milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Last traded price.
    pub price: f64,
}

/// One OHLC candle, aligned to a wall-clock bucket of the active interval.
///
/// Invariants: `low <= open <= high`, `low <= close <= high`, and
/// `bucket_start_sec * 1000` is a multiple of the interval that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub bucket_start_sec: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Identifies one logical tick stream.
///
/// A subscription is replaced wholesale whenever any field changes; it is
/// never mutated in place. Its series and connection share its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub exchange: String,
    pub symbol: String,
    pub interval_ms: i64,
}

impl Subscription {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, interval_ms: i64) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            interval_ms,
        }
    }

    /// Reject malformed subscriptions before any connection is attempted.
    ///
    /// Configuration errors must fail synchronously at creation time, never
    /// later on the tick path.
    pub fn validate(&self) -> Result<()> {
        if self.exchange.trim().is_empty() {
            bail!("subscription exchange must not be empty");
        }
        if self.symbol.trim().is_empty() {
            bail!("subscription symbol must not be empty");
        }
        if self.interval_ms <= 0 {
            bail!(
                "subscription interval must be positive, got {}ms",
                self.interval_ms
            );
        }
        Ok(())
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}ms", self.exchange, self.symbol, self.interval_ms)
    }
}

/// Lifecycle of one streaming connection.
///
/// `GivenUp` and a terminal `Disconnected` are absorbing: only a new
/// subscription restarts the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    GivenUp,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::GivenUp => write!(f, "GivenUp"),
        }
    }
}

impl ConnectionState {
    /// Whether the stream is live from the dashboard's point of view.
    ///
    /// The chart shows a live/idle indicator derived from this, never raw
    /// error text.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_subscription_passes() {
        let sub = Subscription::new("BINANCE", "BTCUSDT", 60_000);
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn empty_symbol_rejected() {
        let sub = Subscription::new("BINANCE", "  ", 60_000);
        assert!(sub.validate().is_err());
    }

    #[test]
    fn empty_exchange_rejected() {
        let sub = Subscription::new("", "BTCUSDT", 60_000);
        assert!(sub.validate().is_err());
    }

    #[test]
    fn non_positive_interval_rejected() {
        assert!(Subscription::new("BINANCE", "BTCUSDT", 0).validate().is_err());
        assert!(Subscription::new("BINANCE", "BTCUSDT", -1000)
            .validate()
            .is_err());
    }

    #[test]
    fn subscription_display() {
        let sub = Subscription::new("BINANCE", "ETHUSDT", 5_000);
        assert_eq!(sub.to_string(), "BINANCE:ETHUSDT@5000ms");
    }

    #[test]
    fn connection_state_live_flag() {
        assert!(ConnectionState::Connected.is_live());
        assert!(!ConnectionState::Reconnecting.is_live());
        assert!(!ConnectionState::GivenUp.is_live());
        assert!(!ConnectionState::Disconnected.is_live());
    }
}
