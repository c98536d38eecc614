// =============================================================================
// SubscriptionController — teardown-and-rebuild on market/timeframe changes
// =============================================================================
//
// The user changing exchange, symbol, or interval invalidates everything the
// old stream produced: its bucket boundaries, its candles, its reconnect
// timers. The controller never patches a live pipeline; it closes the old
// connection, clears the series, and rebuilds from scratch — also on
// interval-only changes, where stale candles would otherwise be
// reinterpreted against new bucket boundaries.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

use crate::market_data::{CandleAggregator, ConnectionHandle, ConnectionManager, SeriesStore};
use crate::types::{ConnectionState, Subscription};

/// The triple serving one subscription. Created together, destroyed together.
struct ActiveStream {
    subscription: Subscription,
    handle: ConnectionHandle,
    aggregator: Arc<CandleAggregator>,
}

/// Coordinates the connection, aggregator, and series store for the single
/// active subscription.
pub struct SubscriptionController {
    manager: ConnectionManager,
    store: Arc<SeriesStore>,
    active: Mutex<Option<ActiveStream>>,
}

impl SubscriptionController {
    pub fn new(manager: ConnectionManager, store: Arc<SeriesStore>) -> Self {
        Self {
            manager,
            store,
            active: Mutex::new(None),
        }
    }

    /// Switch to a new subscription.
    ///
    /// Ordering is load-bearing: close the old handle (canceling any pending
    /// reconnect), clear the series, build a fresh aggregator with an empty
    /// bucket cursor, then open the new connection. No step is skipped even
    /// when only the interval changed.
    pub fn set_subscription(&self, new_sub: Subscription) -> Result<()> {
        new_sub.validate()?;

        let mut active = self.active.lock();

        if let Some(old) = active.take() {
            info!(
                old = %old.subscription,
                new = %new_sub,
                "replacing subscription"
            );
            old.handle.close();
        }

        self.store.replace(Vec::new());
        debug_assert!(self.store.is_empty());

        // A fresh aggregator starts with an empty bucket cursor, so the new
        // series cannot inherit boundaries from the old timeframe.
        let aggregator = Arc::new(CandleAggregator::new(new_sub.interval_ms, self.store.clone()));

        let handle = self.manager.open(&new_sub)?;
        let sink_aggregator = aggregator.clone();
        handle.set_tick_sink(move |tick| sink_aggregator.apply(&tick));

        info!(subscription = %new_sub, handle = %handle.id(), "subscription active");
        *active = Some(ActiveStream {
            subscription: new_sub,
            handle,
            aggregator,
        });
        Ok(())
    }

    /// Tear down the active subscription, if any, leaving an empty series.
    pub fn clear_subscription(&self) {
        let mut active = self.active.lock();
        if let Some(old) = active.take() {
            info!(subscription = %old.subscription, "clearing subscription");
            old.handle.close();
            self.store.replace(Vec::new());
        }
    }

    pub fn current_subscription(&self) -> Option<Subscription> {
        self.active
            .lock()
            .as_ref()
            .map(|a| a.handle.subscription().clone())
    }

    /// Connection state of the active stream; Disconnected when idle.
    pub fn connection_state(&self) -> ConnectionState {
        self.active
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |a| a.handle.state())
    }

    /// Out-of-order ticks dropped by the active aggregator.
    pub fn dropped_ticks(&self) -> u64 {
        self.active
            .lock()
            .as_ref()
            .map_or(0, |a| a.aggregator.dropped_ticks())
    }

    /// Malformed messages dropped by the active connection.
    pub fn decode_errors(&self) -> u64 {
        self.active
            .lock()
            .as_ref()
            .map_or(0, |a| a.handle.decode_errors())
    }
}
