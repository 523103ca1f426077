//! Venue-agnostic seams for market data and order execution.
//!
//! The trading core depends only on these traits:
//! - `MarketDataProvider` supplies OHLCV bars and the latest price
//! - `ExecutionGateway` opens/closes positions and reports account state

use super::types::{
    AccountSnapshot, Bar, ContractSpec, Interval, MarginMode, OrderRequest, OrderResult, Position,
    PositionSide,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Source of OHLCV bars.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Fetch up to `limit` bars, time-ascending. The last bar may still be forming.
    async fn get_candles(&self, symbol: &str, interval: Interval, limit: usize)
        -> Result<Vec<Bar>>;

    /// Latest traded price: the close of the most recent 1-minute bar.
    async fn latest_price(&self, symbol: &str) -> Result<Decimal> {
        let bars = self
            .get_candles(symbol, Interval::Min1, 1)
            .await
            .with_context(|| format!("Failed to fetch latest price for {symbol}"))?;
        let price = bars
            .last()
            .map(|bar| bar.close)
            .with_context(|| format!("No 1m bar returned for {symbol}"))?;
        anyhow::ensure!(price > Decimal::ZERO, "Non-positive price {price} for {symbol}");
        Ok(price)
    }
}

/// Order/execution gateway for a hedge-mode perpetuals account.
///
/// Margin coin and product type are adapter configuration, not call arguments.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    /// Open (or add to) a position with a market order.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult>;

    /// Close `size` of a position, or all of it when `size` is `None`.
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size: Option<Decimal>,
    ) -> Result<()>;

    async fn set_leverage(&self, symbol: &str, leverage: u32, side: PositionSide) -> Result<()>;

    /// Fails if the mode is already set on some venues; callers tolerate that.
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()>;

    async fn get_account(&self, symbol: &str) -> Result<AccountSnapshot>;

    /// Every open position in the account, across all symbols.
    async fn get_all_positions(&self) -> Result<Vec<Position>>;

    /// Open positions (zero, one or two sides) for one symbol.
    async fn get_position(&self, symbol: &str) -> Result<Vec<Position>>;

    async fn get_contract(&self, symbol: &str) -> Result<ContractSpec>;
}
