// =============================================================================
// SeriesStore — the authoritative in-memory candle series
// =============================================================================
//
// Holds the ordered candle series for exactly one active subscription.
// The aggregator is the only writer (append / update-last); the dashboard
// reads whole-series snapshots. A parking_lot RwLock guarantees a reader
// sees either the pre- or post-update series, never a torn candle.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::types::Candle;

/// Thread-safe ordered candle series. Insertion order equals time order;
/// candles are only replaced wholesale on a subscription change, never
/// reordered or deleted.
pub struct SeriesStore {
    candles: RwLock<Vec<Candle>>,
    /// Bumped on every mutation so pollers can detect changes cheaply.
    version: AtomicU64,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self {
            candles: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Atomic wholesale swap, used on subscription change.
    pub fn replace(&self, series: Vec<Candle>) {
        *self.candles.write() = series;
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Append a candle for a new bucket.
    pub fn append(&self, candle: Candle) {
        self.candles.write().push(candle);
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Update the last candle in place (same-bucket tick).
    ///
    /// A no-op on an empty series; the aggregator never calls it in that
    /// state.
    pub fn update_last(&self, candle: Candle) {
        let mut candles = self.candles.write();
        if let Some(last) = candles.last_mut() {
            *last = candle;
            drop(candles);
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Read-only copy of the full series as of the call.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.read().clone()
    }

    /// The most recent candle, if any.
    pub fn last(&self) -> Option<Candle> {
        self.candles.read().last().copied()
    }

    pub fn len(&self) -> usize {
        self.candles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.read().is_empty()
    }

    /// Monotonic change counter for the dashboard's cheap change polling.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}
