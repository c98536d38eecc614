// =============================================================================
// CandleAggregator — folds the tick stream into an ordered candle series
// =============================================================================
//
// One aggregator serves one subscription. It runs on whatever task the
// transport delivers ticks on and writes through to the shared SeriesStore:
// either the last candle is updated in place (same bucket) or a new candle
// is appended (new bucket). Late ticks are dropped so the series stays
// strictly increasing in bucket time.
//
// Bucket identity lives in integer milliseconds; the candle's
// bucket_start_sec is derived only when a candle is created.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::market_data::bucket::{bucket_start_ms, bucket_start_secs};
use crate::market_data::series::SeriesStore;
use crate::types::{Candle, Tick};

/// Folds ticks for one subscription into the series store.
///
/// The interval must already be validated (positive) at subscription
/// creation; the tick path never re-checks configuration.
pub struct CandleAggregator {
    interval_ms: i64,
    /// Bucket start (in milliseconds) of the most recent candle, if any.
    last_bucket_ms: Mutex<Option<i64>>,
    /// Late ticks dropped to keep the series monotonic. Observable for
    /// diagnostics; dropping is policy, not an error.
    dropped_ticks: AtomicU64,
    store: Arc<SeriesStore>,
}

impl CandleAggregator {
    pub fn new(interval_ms: i64, store: Arc<SeriesStore>) -> Self {
        Self {
            interval_ms,
            last_bucket_ms: Mutex::new(None),
            dropped_ticks: AtomicU64::new(0),
            store,
        }
    }

    /// Fold one tick into the series.
    pub fn apply(&self, tick: &Tick) {
        let bucket_ms = bucket_start_ms(tick.timestamp_ms, self.interval_ms);
        let mut last_bucket = self.last_bucket_ms.lock();

        match *last_bucket {
            None => {
                // First tick of the subscription seeds the series.
                self.store.append(Candle {
                    bucket_start_sec: bucket_start_secs(tick.timestamp_ms, self.interval_ms),
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                });
                *last_bucket = Some(bucket_ms);
            }
            Some(current) if bucket_ms == current => {
                // Same bucket: stretch high/low and move the close.
                if let Some(mut candle) = self.store.last() {
                    candle.high = candle.high.max(tick.price);
                    candle.low = candle.low.min(tick.price);
                    candle.close = tick.price;
                    self.store.update_last(candle);
                }
            }
            Some(current) if bucket_ms > current => {
                // New bucket: carry the previous close forward as the open,
                // since a continuous price stream has no discrete open tick.
                // Buckets skipped during a tick gap are simply absent; the
                // store never fabricates empty candles.
                let open = self.store.last().map_or(tick.price, |c| c.close);
                self.store.append(Candle {
                    bucket_start_sec: bucket_start_secs(tick.timestamp_ms, self.interval_ms),
                    open,
                    high: open.max(tick.price),
                    low: open.min(tick.price),
                    close: tick.price,
                });
                *last_bucket = Some(bucket_ms);
            }
            Some(current) => {
                // Late tick from an already-closed bucket. History is never
                // rewritten from a late arrival.
                self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tick_bucket_ms = bucket_ms,
                    last_bucket_ms = current,
                    price = tick.price,
                    "dropping out-of-order tick"
                );
            }
        }
    }

    /// Forget the bucket cursor. The next tick seeds a fresh series; the
    /// caller is responsible for clearing the store alongside.
    pub fn reset(&self) {
        *self.last_bucket_ms.lock() = None;
    }

    /// Number of out-of-order ticks dropped since creation.
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }
}
