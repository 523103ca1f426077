//! Exchange integrations for the hedge bot.
//!
//! ## Bitget
//! REST connectivity for USDT-margined perpetuals in hedge position mode:
//! - Market data (candles, contract metadata)
//! - Account operations (orders, closes, leverage, positions, balance)
//!
//! ## Mock
//! An in-memory account used for paper trading and tests.

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::BitgetClient;
pub use mock::MockExchange;
pub use traits::{ExecutionGateway, MarketDataProvider};
pub use types::*;
