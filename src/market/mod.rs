//! Market data helpers: indicators and snapshots.

pub mod indicators;
pub mod snapshot;

pub use snapshot::{average_range_percent, fetch_timeframes, format_market_context, MarketSnapshot};
