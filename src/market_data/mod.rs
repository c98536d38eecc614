// =============================================================================
// Market Data Module
// =============================================================================
//
// The live ingestion pipeline feeding the price chart:
//   transport (wire) → connection (reconnect, decode) → aggregator (bucket)
//   → series (ordered candles) → dashboard snapshot
// =============================================================================

pub mod aggregator;
pub mod bucket;
pub mod connection;
pub mod series;
pub mod transport;

pub use aggregator::CandleAggregator;
pub use connection::{ConnectionHandle, ConnectionManager, ReconnectPolicy};
pub use series::SeriesStore;
pub use transport::{TickTransport, WsTransport};
