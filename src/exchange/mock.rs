//! Simulated hedge-mode account for paper trading and tests.

use super::traits::{ExecutionGateway, MarketDataProvider};
use super::types::*;
use crate::error::ExchangeError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One simulated position leg.
#[derive(Debug, Clone)]
pub struct MockPosition {
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: u32,
    pub take_profit: Option<Decimal>,
}

impl MockPosition {
    fn margin(&self) -> Decimal {
        self.entry_price * self.size / Decimal::from(self.leverage.max(1))
    }
}

/// Mock account state.
#[derive(Debug, Clone)]
pub struct MockTradingState {
    pub initial_balance: Decimal,
    /// Free margin. Seeded positions do not draw from it.
    pub available: Decimal,
    pub positions: HashMap<(String, PositionSide), MockPosition>,
    pub leverage: HashMap<(String, PositionSide), u32>,
    pub total_trading_fees: Decimal,
    pub realized_pnl: Decimal,
    pub order_count: u64,
}

/// A recorded close request.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRecord {
    pub symbol: String,
    pub side: PositionSide,
    /// `None` for a full close
    pub size: Option<Decimal>,
    pub price: Decimal,
}

/// Gateway calls that can be made to fail in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Account,
    Positions,
    Leverage,
    MarginMode,
    Contract,
    Candles,
    Orders,
}

/// In-memory exchange implementing both gateway traits.
///
/// Fills happen at the configured price for a symbol, or at the latest price
/// of the optional live price source.
pub struct MockExchange {
    state: Arc<RwLock<MockTradingState>>,
    order_id_counter: AtomicU64,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    candles: Arc<RwLock<HashMap<(String, Interval), Vec<Bar>>>>,
    contracts: Arc<RwLock<HashMap<String, ContractSpec>>>,
    price_source: Option<Arc<dyn MarketDataProvider>>,
    /// Trading fee rate (0.04% taker)
    fee_rate: Decimal,
    orders: Arc<RwLock<Vec<OrderRequest>>>,
    closes: Arc<RwLock<Vec<CloseRecord>>>,
    failures: RwLock<HashSet<FailurePoint>>,
    margin_rejections: AtomicU32,
}

impl MockExchange {
    /// Create a new mock account with initial free margin.
    pub fn new(initial_balance: Decimal) -> Self {
        let state = MockTradingState {
            initial_balance,
            available: initial_balance,
            positions: HashMap::new(),
            leverage: HashMap::new(),
            total_trading_fees: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            order_count: 0,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            prices: Arc::new(RwLock::new(HashMap::new())),
            candles: Arc::new(RwLock::new(HashMap::new())),
            contracts: Arc::new(RwLock::new(HashMap::new())),
            price_source: None,
            fee_rate: dec!(0.0004),
            orders: Arc::new(RwLock::new(Vec::new())),
            closes: Arc::new(RwLock::new(Vec::new())),
            failures: RwLock::new(HashSet::new()),
            margin_rejections: AtomicU32::new(0),
        }
    }

    /// Read bars and prices from a live provider (paper trading).
    pub fn with_price_source(mut self, source: Arc<dyn MarketDataProvider>) -> Self {
        self.price_source = Some(source);
        self
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    pub async fn set_candles(&self, symbol: &str, interval: Interval, bars: Vec<Bar>) {
        self.candles
            .write()
            .await
            .insert((symbol.to_string(), interval), bars);
    }

    pub async fn set_contract(&self, spec: ContractSpec) {
        self.contracts.write().await.insert(spec.symbol.clone(), spec);
    }

    pub async fn set_available(&self, available: Decimal) {
        self.state.write().await.available = available;
    }

    /// Insert a position directly without touching free margin.
    pub async fn seed_position(
        &self,
        symbol: &str,
        side: PositionSide,
        entry_price: Decimal,
        size: Decimal,
        leverage: u32,
    ) {
        let mut state = self.state.write().await;
        state.positions.insert(
            (symbol.to_string(), side),
            MockPosition {
                entry_price,
                size,
                leverage,
                take_profit: None,
            },
        );
    }

    pub async fn fail(&self, point: FailurePoint) {
        self.failures.write().await.insert(point);
    }

    pub async fn recover(&self, point: FailurePoint) {
        self.failures.write().await.remove(&point);
    }

    /// Reject the next `count` opens with an insufficient-margin error.
    pub fn reject_next_opens(&self, count: u32) {
        self.margin_rejections.store(count, Ordering::SeqCst);
    }

    /// Every accepted open, in order.
    pub async fn orders(&self) -> Vec<OrderRequest> {
        self.orders.read().await.clone()
    }

    /// Every executed close, in order.
    pub async fn closes(&self) -> Vec<CloseRecord> {
        self.closes.read().await.clone()
    }

    pub async fn leverage_for(&self, symbol: &str, side: PositionSide) -> Option<u32> {
        self.state
            .read()
            .await
            .leverage
            .get(&(symbol.to_string(), side))
            .copied()
    }

    /// Get current mock state for logging.
    pub async fn get_state(&self) -> MockTradingState {
        self.state.read().await.clone()
    }

    async fn check(&self, point: FailurePoint) -> Result<()> {
        if self.failures.read().await.contains(&point) {
            anyhow::bail!("simulated {:?} failure", point);
        }
        Ok(())
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal> {
        if let Some(price) = self.prices.read().await.get(symbol).copied() {
            return Ok(price);
        }
        match &self.price_source {
            Some(source) => source.latest_price(symbol).await,
            None => anyhow::bail!("no simulated price for {}", symbol),
        }
    }

    /// Mark price for equity; falls back to entry when no price is known.
    async fn marks(&self, symbols: &HashSet<String>) -> HashMap<String, Decimal> {
        let mut marks = HashMap::new();
        for symbol in symbols {
            if let Ok(price) = self.mark_price(symbol).await {
                marks.insert(symbol.clone(), price);
            }
        }
        marks
    }

    /// Close legs whose preset take-profit has been reached.
    async fn trigger_take_profits(&self, symbol: &str) {
        let armed: Vec<(PositionSide, Decimal)> = {
            let state = self.state.read().await;
            state
                .positions
                .iter()
                .filter(|((s, _), _)| s == symbol)
                .filter_map(|((_, side), p)| p.take_profit.map(|tp| (*side, tp)))
                .collect()
        };
        if armed.is_empty() {
            return;
        }

        let price = match self.mark_price(symbol).await {
            Ok(price) => price,
            Err(e) => {
                debug!(%symbol, error = %e, "No mark price for take-profit check");
                return;
            }
        };

        for (side, tp) in armed {
            let hit = match side {
                PositionSide::Long => price >= tp,
                PositionSide::Short => price <= tp,
            };
            if hit {
                info!(%symbol, %side, take_profit = %tp, %price, "Mock take-profit triggered");
                self.settle_close(symbol, side, None, tp).await;
            }
        }
    }

    /// Release margin plus realized PnL minus fees. Returns false if no leg exists.
    async fn settle_close(
        &self,
        symbol: &str,
        side: PositionSide,
        size: Option<Decimal>,
        price: Decimal,
    ) -> bool {
        let mut state = self.state.write().await;
        let key = (symbol.to_string(), side);
        let Some(position) = state.positions.get(&key).cloned() else {
            return false;
        };

        let close_size = size.unwrap_or(position.size).min(position.size);
        let released = position.margin() * close_size / position.size;
        let pnl = match side {
            PositionSide::Long => (price - position.entry_price) * close_size,
            PositionSide::Short => (position.entry_price - price) * close_size,
        };
        let fee = close_size * price * self.fee_rate;

        state.available += released + pnl - fee;
        state.realized_pnl += pnl;
        state.total_trading_fees += fee;
        state.order_count += 1;

        let remaining = position.size - close_size;
        if remaining > Decimal::ZERO {
            if let Some(p) = state.positions.get_mut(&key) {
                p.size = remaining;
            }
        } else {
            state.positions.remove(&key);
        }
        drop(state);

        self.closes.write().await.push(CloseRecord {
            symbol: symbol.to_string(),
            side,
            size,
            price,
        });

        info!(
            %symbol, %side,
            size = %close_size,
            %price,
            pnl = %pnl,
            fee = %fee,
            "Mock close executed"
        );
        true
    }

    fn positions_of(state: &MockTradingState, symbol: Option<&str>) -> Vec<Position> {
        let mut positions: Vec<Position> = state
            .positions
            .iter()
            .filter(|((s, _), _)| symbol.map_or(true, |wanted| s == wanted))
            .map(|((s, side), p)| Position {
                symbol: s.clone(),
                side: *side,
                entry_price: p.entry_price,
                size: p.size,
                leverage: p.leverage,
            })
            .collect();
        positions.sort_by(|a, b| {
            a.symbol
                .cmp(&b.symbol)
                .then_with(|| a.side.as_str().cmp(b.side.as_str()))
        });
        positions
    }
}

#[async_trait]
impl MarketDataProvider for MockExchange {
    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.check(FailurePoint::Candles).await?;
        if let Some(source) = &self.price_source {
            return source.get_candles(symbol, interval, limit).await;
        }

        if let Some(bars) = self
            .candles
            .read()
            .await
            .get(&(symbol.to_string(), interval))
        {
            let start = bars.len().saturating_sub(limit);
            return Ok(bars[start..].to_vec());
        }

        // A bare price still answers latest-price queries.
        if interval == Interval::Min1 {
            if let Some(price) = self.prices.read().await.get(symbol).copied() {
                let now = chrono::Utc::now().timestamp_millis();
                let open_time = now - now.rem_euclid(interval.millis());
                return Ok(vec![Bar {
                    open_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: Decimal::ZERO,
                    close_time: open_time + interval.millis() - 1,
                }]);
            }
        }
        Ok(Vec::new())
    }

    async fn latest_price(&self, symbol: &str) -> Result<Decimal> {
        self.mark_price(symbol).await
    }
}

#[async_trait]
impl ExecutionGateway for MockExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        self.check(FailurePoint::Orders).await?;

        let pending = self.margin_rejections.load(Ordering::SeqCst);
        if pending > 0 {
            self.margin_rejections.store(pending - 1, Ordering::SeqCst);
            return Err(ExchangeError::InsufficientMargin("simulated rejection".into()).into());
        }

        let price = self
            .mark_price(&order.symbol)
            .await
            .context("Mock fill needs a price")?;
        anyhow::ensure!(order.size > Decimal::ZERO, "order size must be positive");

        let mut state = self.state.write().await;
        let key = (order.symbol.clone(), order.side);
        let leverage = state.leverage.get(&key).copied().unwrap_or(1);
        let notional = order.size * price;
        let margin = notional / Decimal::from(leverage);
        let fee = notional * self.fee_rate;

        if margin + fee > state.available {
            warn!(
                symbol = %order.symbol,
                required = %(margin + fee),
                available = %state.available,
                "Mock order rejected"
            );
            return Err(ExchangeError::InsufficientMargin(format!(
                "required {} exceeds available {}",
                margin + fee,
                state.available
            ))
            .into());
        }

        state.available -= margin + fee;
        state.total_trading_fees += fee;
        state.order_count += 1;

        let position = state.positions.entry(key).or_insert(MockPosition {
            entry_price: price,
            size: Decimal::ZERO,
            leverage,
            take_profit: None,
        });
        let total = position.size + order.size;
        position.entry_price = (position.entry_price * position.size + price * order.size) / total;
        position.size = total;
        position.leverage = leverage;
        if order.preset_take_profit.is_some() {
            position.take_profit = order.preset_take_profit;
        }
        drop(state);

        self.orders.write().await.push(order.clone());
        let order_id = self.next_order_id();

        info!(
            order_id,
            symbol = %order.symbol,
            side = %order.side,
            size = %order.size,
            %price,
            fee = %fee,
            "Mock order filled"
        );

        Ok(OrderResult {
            order_id: order_id.to_string(),
            client_oid: order.client_oid.clone(),
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size: Option<Decimal>,
    ) -> Result<()> {
        self.check(FailurePoint::Orders).await?;
        let price = self.mark_price(symbol).await?;
        if !self.settle_close(symbol, side, size, price).await {
            return Err(ExchangeError::Api {
                code: "22002".to_string(),
                msg: format!("no {} position to close on {}", side, symbol),
            }
            .into());
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, side: PositionSide) -> Result<()> {
        self.check(FailurePoint::Leverage).await?;
        debug!(%symbol, %leverage, %side, "Mock set leverage");
        self.state
            .write()
            .await
            .leverage
            .insert((symbol.to_string(), side), leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        self.check(FailurePoint::MarginMode).await?;
        debug!(%symbol, mode = mode.as_str(), "Mock set margin mode");
        Ok(())
    }

    async fn get_account(&self, _symbol: &str) -> Result<AccountSnapshot> {
        self.check(FailurePoint::Account).await?;
        let state = self.state.read().await.clone();
        let symbols: HashSet<String> = state.positions.keys().map(|(s, _)| s.clone()).collect();
        let marks = self.marks(&symbols).await;

        let mut equity = state.available;
        for ((symbol, side), p) in &state.positions {
            let mark = marks.get(symbol).copied().unwrap_or(p.entry_price);
            let pnl = match side {
                PositionSide::Long => (mark - p.entry_price) * p.size,
                PositionSide::Short => (p.entry_price - mark) * p.size,
            };
            equity += p.margin() + pnl;
        }

        Ok(AccountSnapshot {
            equity,
            available: state.available,
        })
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>> {
        self.check(FailurePoint::Positions).await?;
        let state = self.state.read().await;
        Ok(Self::positions_of(&state, None))
    }

    async fn get_position(&self, symbol: &str) -> Result<Vec<Position>> {
        self.check(FailurePoint::Positions).await?;
        self.trigger_take_profits(symbol).await;
        let state = self.state.read().await;
        Ok(Self::positions_of(&state, Some(symbol)))
    }

    async fn get_contract(&self, symbol: &str) -> Result<ContractSpec> {
        self.check(FailurePoint::Contract).await?;
        self.contracts
            .read()
            .await
            .get(symbol)
            .cloned()
            .with_context(|| format!("no contract metadata for {}", symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Helper functions
    // =========================================================================

    async fn exchange_with_price(price: Decimal) -> MockExchange {
        let exchange = MockExchange::new(dec!(1000)).with_fee_rate(Decimal::ZERO);
        exchange.set_price("BTCUSDT", price).await;
        exchange
    }

    async fn open(exchange: &MockExchange, side: PositionSide, size: Decimal) -> Result<OrderResult> {
        exchange
            .place_order(&OrderRequest::market_open("BTCUSDT", side, size))
            .await
    }

    // =========================================================================
    // Order execution
    // =========================================================================

    #[tokio::test]
    async fn test_open_draws_margin_at_leverage() {
        let exchange = exchange_with_price(dec!(100)).await;
        exchange
            .set_leverage("BTCUSDT", 10, PositionSide::Long)
            .await
            .unwrap();

        open(&exchange, PositionSide::Long, dec!(5)).await.unwrap();

        let account = exchange.get_account("BTCUSDT").await.unwrap();
        assert_eq!(account.available, dec!(950));
        assert_eq!(account.equity, dec!(1000));

        let positions = exchange.get_position("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].leverage, 10);
        assert_eq!(positions[0].margin(), dec!(50));
    }

    #[tokio::test]
    async fn test_open_beyond_available_is_insufficient_margin() {
        let exchange = exchange_with_price(dec!(100)).await;
        let err = open(&exchange, PositionSide::Short, dec!(11)).await.unwrap_err();
        assert!(ExchangeError::is_insufficient_margin(&err));
        assert!(exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_adding_to_a_leg_averages_entry() {
        let exchange = exchange_with_price(dec!(100)).await;
        open(&exchange, PositionSide::Long, dec!(1)).await.unwrap();
        exchange.set_price("BTCUSDT", dec!(110)).await;
        open(&exchange, PositionSide::Long, dec!(1)).await.unwrap();

        let positions = exchange.get_position("BTCUSDT").await.unwrap();
        assert_eq!(positions[0].entry_price, dec!(105));
        assert_eq!(positions[0].size, dec!(2));
    }

    #[tokio::test]
    async fn test_fee_is_charged_on_notional() {
        let exchange = MockExchange::new(dec!(1000));
        exchange.set_price("BTCUSDT", dec!(100)).await;
        open(&exchange, PositionSide::Long, dec!(1)).await.unwrap();

        let state = exchange.get_state().await;
        assert_eq!(state.total_trading_fees, dec!(0.04));
        assert_eq!(state.available, dec!(899.96));
    }

    // =========================================================================
    // Closes
    // =========================================================================

    #[tokio::test]
    async fn test_partial_close_releases_proportional_margin_and_pnl() {
        let exchange = exchange_with_price(dec!(100)).await;
        exchange.set_available(dec!(0)).await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(100), dec!(10), 10)
            .await;
        exchange.set_price("BTCUSDT", dec!(90)).await;

        exchange
            .close_position("BTCUSDT", PositionSide::Short, Some(dec!(4)))
            .await
            .unwrap();

        // margin 100 * 4/10 = 40, pnl (100 - 90) * 4 = 40
        assert_eq!(exchange.get_state().await.available, dec!(80));
        let positions = exchange.get_position("BTCUSDT").await.unwrap();
        assert_eq!(positions[0].size, dec!(6));
    }

    #[tokio::test]
    async fn test_full_close_removes_leg() {
        let exchange = exchange_with_price(dec!(100)).await;
        open(&exchange, PositionSide::Long, dec!(1)).await.unwrap();
        exchange
            .close_position("BTCUSDT", PositionSide::Long, None)
            .await
            .unwrap();

        assert!(exchange.get_position("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(exchange.get_state().await.available, dec!(1000));
        assert_eq!(exchange.closes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_without_position_errors() {
        let exchange = exchange_with_price(dec!(100)).await;
        assert!(exchange
            .close_position("BTCUSDT", PositionSide::Short, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_take_profit_triggers_on_position_query() {
        let exchange = exchange_with_price(dec!(100)).await;
        exchange
            .place_order(
                &OrderRequest::market_open("BTCUSDT", PositionSide::Long, dec!(1))
                    .with_take_profit(dec!(100.5)),
            )
            .await
            .unwrap();

        exchange.set_price("BTCUSDT", dec!(100.4)).await;
        assert_eq!(exchange.get_position("BTCUSDT").await.unwrap().len(), 1);

        exchange.set_price("BTCUSDT", dec!(101)).await;
        assert!(exchange.get_position("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(exchange.closes().await[0].price, dec!(100.5));
    }

    // =========================================================================
    // Market data and failure injection
    // =========================================================================

    #[tokio::test]
    async fn test_latest_price_from_set_price() {
        let exchange = exchange_with_price(dec!(42.5)).await;
        assert_eq!(exchange.latest_price("BTCUSDT").await.unwrap(), dec!(42.5));
        let bars = exchange
            .get_candles("BTCUSDT", Interval::Min1, 1)
            .await
            .unwrap();
        assert_eq!(bars[0].close, dec!(42.5));
    }

    #[tokio::test]
    async fn test_candles_truncated_to_limit() {
        let exchange = MockExchange::new(dec!(1000));
        let bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                open_time: i * 60_000,
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: Decimal::from(i),
                volume: dec!(1),
                close_time: i * 60_000 + 59_999,
            })
            .collect();
        exchange.set_candles("BTCUSDT", Interval::Min1, bars).await;

        let got = exchange
            .get_candles("BTCUSDT", Interval::Min1, 2)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].close, dec!(4));
    }

    #[tokio::test]
    async fn test_failure_injection_and_recovery() {
        let exchange = exchange_with_price(dec!(100)).await;
        exchange.fail(FailurePoint::Positions).await;
        assert!(exchange.get_all_positions().await.is_err());
        exchange.recover(FailurePoint::Positions).await;
        assert!(exchange.get_all_positions().await.is_ok());
    }

    #[tokio::test]
    async fn test_margin_rejections_are_one_shot() {
        let exchange = exchange_with_price(dec!(100)).await;
        exchange.reject_next_opens(1);
        let err = open(&exchange, PositionSide::Long, dec!(1)).await.unwrap_err();
        assert!(ExchangeError::is_insufficient_margin(&err));
        assert!(open(&exchange, PositionSide::Long, dec!(1)).await.is_ok());
    }
}
