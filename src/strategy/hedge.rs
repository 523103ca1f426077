//! Hedge lifecycle controller.
//!
//! Each cycle: refresh positions, read the price, classify the trend, then
//! apply the trend's closure rule and open/hold rule.
//!
//! - `unclear`: close any leg whose leveraged ROI reached the profit
//!   threshold, then make sure both a long and a short are open.
//! - `uptrend` / `downtrend`: close the leg against the trend immediately,
//!   hold the leg with the trend, open it if missing.

use super::contracts::ContractBook;
use super::executor::{OpenRequest, OrderExecutor};
use super::position_state::PositionStateTracker;
use super::reallocation::CapitalReallocator;
use crate::classifier::{Trend, TrendClassifier, TrendState};
use crate::config::{Config, HedgeConfig};
use crate::exchange::{ExecutionGateway, MarginMode, MarketDataProvider, PositionSide};
use crate::market::{fetch_timeframes, format_market_context};
use crate::scheduler::Cycle;
use crate::utils::margin_net_of_fees;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Leveraged ROI reached the profit threshold
    ProfitTarget,
    /// Leg opposed a directional trend
    AgainstTrend,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub trend: Trend,
    pub price: Decimal,
    pub closed: Vec<(PositionSide, CloseReason)>,
    pub opened: Vec<PositionSide>,
}

pub struct HedgeController {
    config: HedgeConfig,
    margin_mode: MarginMode,
    taker_fee_rate: Decimal,
    market: Arc<dyn MarketDataProvider>,
    gateway: Arc<dyn ExecutionGateway>,
    classifier: Option<Arc<dyn TrendClassifier>>,
    executor: OrderExecutor,
    tracker: PositionStateTracker,
    trend: TrendState,
    prepared: bool,
}

impl HedgeController {
    pub fn new(
        config: &Config,
        market: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn ExecutionGateway>,
        classifier: Option<Arc<dyn TrendClassifier>>,
    ) -> Self {
        let hedge = config.hedge.clone();
        let executor = OrderExecutor::new(
            gateway.clone(),
            market.clone(),
            ContractBook::new(config.contract_defaults.clone()),
            CapitalReallocator::new(config.reallocation.clone()),
            config.exchange.taker_fee_rate,
        );

        Self {
            tracker: PositionStateTracker::new(&hedge.symbol),
            config: hedge,
            margin_mode: config.exchange.margin_mode,
            taker_fee_rate: config.exchange.taker_fee_rate,
            market,
            gateway,
            classifier,
            executor,
            trend: TrendState::default(),
            prepared: false,
        }
    }

    pub fn trend(&self) -> &TrendState {
        &self.trend
    }

    pub fn positions(&self) -> &PositionStateTracker {
        &self.tracker
    }

    /// Run one decision cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let symbol = self.config.symbol.clone();

        if !self.prepared {
            self.executor
                .prepare_symbol(&symbol, self.config.leverage, self.margin_mode)
                .await?;
            self.prepared = true;
        }

        self.tracker.refresh(self.gateway.as_ref()).await;

        let price = self
            .market
            .latest_price(&symbol)
            .await
            .context("Failed to read current price")?;

        self.update_trend(&symbol, price).await;
        let trend = self.trend.trend;

        let mut report = CycleReport {
            trend,
            price,
            closed: Vec::new(),
            opened: Vec::new(),
        };
        let mut equity = None;

        match trend {
            Trend::Unclear => {
                for side in [PositionSide::Long, PositionSide::Short] {
                    self.take_profit_if_reached(&symbol, side, price, &mut report)
                        .await?;
                }
                for side in [PositionSide::Long, PositionSide::Short] {
                    if !self.tracker.has(side) {
                        let margin = self.margin_budget(&symbol, true, &mut equity).await?;
                        self.open(&symbol, side, margin, price, &mut report).await?;
                    }
                }
            }
            Trend::Uptrend | Trend::Downtrend => {
                let with_trend = if trend == Trend::Uptrend {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                let against = with_trend.opposite();

                if self.tracker.has(against) {
                    info!(
                        %symbol,
                        side = %against,
                        %trend,
                        %price,
                        "🧭 [HEDGE] Closing leg against trend"
                    );
                    self.executor.close(&symbol, against).await?;
                    self.tracker.record_close(against);
                    report.closed.push((against, CloseReason::AgainstTrend));
                }

                match self.tracker.get(with_trend).map(|p| p.roi_percent(price)) {
                    Some(roi) => info!(
                        %symbol,
                        side = %with_trend,
                        %trend,
                        roi_pct = %roi.round_dp(4),
                        "🧭 [HEDGE] Riding trend, holding leg"
                    ),
                    None => {
                        let margin = self.margin_budget(&symbol, false, &mut equity).await?;
                        self.open(&symbol, with_trend, margin, price, &mut report)
                            .await?;
                    }
                }
            }
        }

        info!(
            %symbol,
            %trend,
            %price,
            closed = report.closed.len(),
            opened = report.opened.len(),
            long = self.tracker.has(PositionSide::Long),
            short = self.tracker.has(PositionSide::Short),
            "🔁 [HEDGE] Cycle complete"
        );
        Ok(report)
    }

    /// Classify the current market. Failing to gather the context or to
    /// classify it keeps the previous trend.
    async fn update_trend(&mut self, symbol: &str, price: Decimal) {
        let Some(classifier) = self.classifier.clone() else {
            return;
        };

        let snapshots = match fetch_timeframes(
            self.market.as_ref(),
            symbol,
            &self.config.timeframes,
            self.config.bars_per_timeframe,
        )
        .await
        {
            Ok(snapshots) => snapshots,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(
                    %symbol,
                    error = %message,
                    previous = %self.trend.trend,
                    "⚠️  [TREND] Market context unavailable, keeping previous trend"
                );
                return;
            }
        };
        let context = format_market_context(symbol, price, &snapshots);

        match classifier.classify(&context).await {
            Ok(assessment) => {
                info!(
                    %symbol,
                    trend = %assessment.trend,
                    confidence = assessment.confidence,
                    reason = %assessment.reason,
                    "🧭 [TREND] Classified"
                );
                self.trend.apply(assessment);
            }
            Err(e) => {
                warn!(
                    %symbol,
                    error = %e,
                    previous = %self.trend.trend,
                    "⚠️  [TREND] Classifier failed, keeping previous trend"
                );
            }
        }
    }

    async fn take_profit_if_reached(
        &mut self,
        symbol: &str,
        side: PositionSide,
        price: Decimal,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(position) = self.tracker.get(side) else {
            return Ok(());
        };

        let change = position.price_change_percent(price);
        let roi = position.roi_percent(price);
        let threshold = self.config.profit_threshold_pct;
        let reached = roi >= threshold;
        info!(
            %symbol,
            %side,
            entry = %position.entry_price,
            %price,
            change_pct = %change.round_dp(4),
            roi_pct = %roi.round_dp(4),
            %threshold,
            reached,
            "🎯 [HEDGE] ROI check"
        );

        if reached {
            self.executor.close(symbol, side).await?;
            self.tracker.record_close(side);
            report.closed.push((side, CloseReason::ProfitTarget));
        }
        Ok(())
    }

    /// Margin for one open: configured capital, or half of account equity.
    ///
    /// `split` halves configured capital across the two hedge legs. Equity is
    /// read at most once per cycle, and an equity half leaves room for its
    /// open fee so both legs fit in the account.
    async fn margin_budget(
        &self,
        symbol: &str,
        split: bool,
        equity: &mut Option<Decimal>,
    ) -> Result<Decimal> {
        if let Some(capital) = self.config.capital {
            return Ok(if split { capital / dec!(2) } else { capital });
        }

        let equity = match *equity {
            Some(value) => value,
            None => {
                let value = self
                    .gateway
                    .get_account(symbol)
                    .await
                    .context("Failed to read account equity")?
                    .equity;
                *equity = Some(value);
                value
            }
        };
        Ok(margin_net_of_fees(
            equity / dec!(2),
            self.config.leverage,
            self.taker_fee_rate,
        ))
    }

    async fn open(
        &mut self,
        symbol: &str,
        side: PositionSide,
        margin: Decimal,
        price: Decimal,
        report: &mut CycleReport,
    ) -> Result<()> {
        let position = self
            .executor
            .open(OpenRequest {
                symbol,
                side,
                margin,
                leverage: self.config.leverage,
                price,
                take_profit: None,
            })
            .await?;
        self.tracker.record_open(position);
        report.opened.push(side);
        Ok(())
    }
}

#[async_trait]
impl Cycle for HedgeController {
    fn name(&self) -> &str {
        "hedge"
    }

    async fn tick(&mut self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{MockTrendClassifier, TrendAssessment};
    use crate::exchange::mock::FailurePoint;
    use crate::exchange::MockExchange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // =========================================================================
    // Helper functions
    // =========================================================================

    fn assessment(trend: Trend) -> TrendAssessment {
        TrendAssessment {
            trend,
            reason: "test".to_string(),
            confidence: 0.9,
        }
    }

    fn fixed_classifier(trend: Trend) -> Arc<dyn TrendClassifier> {
        let mut mock = MockTrendClassifier::new();
        mock.expect_classify()
            .returning(move |_| Ok(assessment(trend)));
        Arc::new(mock)
    }

    async fn setup(
        capital: Option<Decimal>,
        classifier: Option<Arc<dyn TrendClassifier>>,
    ) -> (Arc<MockExchange>, HedgeController) {
        let exchange = Arc::new(MockExchange::new(dec!(1000)).with_fee_rate(Decimal::ZERO));
        exchange.set_price("BTCUSDT", dec!(100)).await;

        let mut config = Config::default();
        config.hedge.capital = capital;
        config.exchange.taker_fee_rate = Decimal::ZERO;
        let controller = HedgeController::new(&config, exchange.clone(), exchange.clone(), classifier);
        (exchange, controller)
    }

    // =========================================================================
    // Unclear trend: hedge rule
    // =========================================================================

    #[tokio::test]
    async fn test_unclear_opens_both_legs_from_half_equity() {
        let (exchange, mut controller) = setup(None, None).await;

        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.trend, Trend::Unclear);
        assert_eq!(report.opened, vec![PositionSide::Long, PositionSide::Short]);
        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 2);
        // 500 margin x 10 / 100
        assert!(orders.iter().all(|o| o.size == dec!(50)));

        let positions = exchange.get_position("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 2);
        assert!(controller.positions().has(PositionSide::Long));
        assert!(controller.positions().has(PositionSide::Short));
    }

    #[tokio::test]
    async fn test_both_legs_open_when_fees_are_charged() {
        // Default 0.04% paper fee against the default 0.06% reserve
        let exchange = Arc::new(MockExchange::new(dec!(1000)));
        exchange.set_price("BTCUSDT", dec!(100)).await;
        let mut controller =
            HedgeController::new(&Config::default(), exchange.clone(), exchange.clone(), None);

        for _ in 0..3 {
            controller.run_cycle().await.unwrap();
            assert!(controller.positions().has(PositionSide::Long));
            assert!(controller.positions().has(PositionSide::Short));
        }

        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 2);
        // 500 / 1.006 margin at 10x and price 100
        assert!(orders.iter().all(|o| o.size == dec!(49.701)));
        assert!(exchange.closes().await.is_empty());
    }

    #[tokio::test]
    async fn test_unclear_splits_configured_capital() {
        let (exchange, mut controller) = setup(Some(dec!(300)), None).await;
        controller.run_cycle().await.unwrap();
        assert!(exchange.orders().await.iter().all(|o| o.size == dec!(15)));
    }

    #[tokio::test]
    async fn test_roi_at_threshold_closes_and_reopens() {
        let (exchange, mut controller) = setup(None, None).await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(100.5), dec!(1), 10)
            .await;
        exchange.set_price("BTCUSDT", dec!(100.5)).await;

        let report = controller.run_cycle().await.unwrap();

        // 0.5% x 10 = 5.0%, inclusive
        assert_eq!(report.closed, vec![(PositionSide::Long, CloseReason::ProfitTarget)]);
        assert_eq!(report.opened, vec![PositionSide::Long]);
        assert_eq!(exchange.closes().await[0].side, PositionSide::Long);
        assert_eq!(exchange.get_position("BTCUSDT").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_roi_below_threshold_holds() {
        let (exchange, mut controller) = setup(None, None).await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(100), dec!(1), 10)
            .await;
        exchange.set_price("BTCUSDT", dec!(100.49)).await;

        let report = controller.run_cycle().await.unwrap();
        assert!(report.closed.is_empty());
        assert!(report.opened.is_empty());
        assert!(exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_both_legs_over_threshold_close_and_reopen() {
        let (exchange, mut controller) = setup(None, None).await;
        // long with 10x at +1%, short with 20x at +0.5% (entry above price)
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(99), dec!(1), 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(100.5), dec!(1), 20)
            .await;

        let report = controller.run_cycle().await.unwrap();
        assert_eq!(report.closed.len(), 2);
        assert_eq!(report.opened.len(), 2);
    }

    // =========================================================================
    // Directional trends
    // =========================================================================

    #[tokio::test]
    async fn test_uptrend_closes_short_and_holds_long() {
        let (exchange, mut controller) =
            setup(None, Some(fixed_classifier(Trend::Uptrend))).await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(100), dec!(1), 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;
        exchange.set_price("BTCUSDT", dec!(105)).await;

        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.closed, vec![(PositionSide::Short, CloseReason::AgainstTrend)]);
        assert!(report.opened.is_empty());
        assert!(exchange.orders().await.is_empty());
        let positions = exchange.get_position("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
    }

    #[tokio::test]
    async fn test_downtrend_opens_missing_short_with_full_capital() {
        let (exchange, mut controller) =
            setup(Some(dec!(200)), Some(fixed_classifier(Trend::Downtrend))).await;

        let report = controller.run_cycle().await.unwrap();

        assert_eq!(report.opened, vec![PositionSide::Short]);
        let orders = exchange.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, PositionSide::Short);
        assert_eq!(orders[0].size, dec!(20));
    }

    #[tokio::test]
    async fn test_trend_flip_governs_same_cycle() {
        let (exchange, mut controller) =
            setup(None, Some(fixed_classifier(Trend::Downtrend))).await;
        // Long is deep in profit but the trend says down
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(90), dec!(1), 10)
            .await;

        let report = controller.run_cycle().await.unwrap();
        assert_eq!(report.closed, vec![(PositionSide::Long, CloseReason::AgainstTrend)]);
        assert_eq!(report.opened, vec![PositionSide::Short]);
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    #[tokio::test]
    async fn test_classifier_failure_keeps_previous_trend() {
        let calls = AtomicUsize::new(0);
        let mut mock = MockTrendClassifier::new();
        mock.expect_classify().returning(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(assessment(Trend::Downtrend))
            } else {
                Err(anyhow::anyhow!("classifier timeout"))
            }
        });
        let (exchange, mut controller) = setup(Some(dec!(100)), Some(Arc::new(mock))).await;

        let first = controller.run_cycle().await.unwrap();
        assert_eq!(first.trend, Trend::Downtrend);

        let second = controller.run_cycle().await.unwrap();
        assert_eq!(second.trend, Trend::Downtrend);
        assert_eq!(controller.trend().trend, Trend::Downtrend);
        // Short already open from the first cycle, nothing new
        assert_eq!(exchange.orders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_context_failure_keeps_trend_and_rules_run() {
        let (exchange, mut controller) =
            setup(Some(dec!(100)), Some(fixed_classifier(Trend::Downtrend))).await;
        controller.run_cycle().await.unwrap();
        assert_eq!(controller.trend().trend, Trend::Downtrend);

        exchange.fail(FailurePoint::Candles).await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;

        let report = controller.run_cycle().await.unwrap();
        assert_eq!(report.trend, Trend::Downtrend);
        assert_eq!(report.closed, vec![(PositionSide::Long, CloseReason::AgainstTrend)]);
    }

    #[tokio::test]
    async fn test_gateway_failure_aborts_cycle_then_recovers() {
        let (exchange, mut controller) = setup(None, None).await;
        exchange.fail(FailurePoint::Orders).await;
        assert!(controller.run_cycle().await.is_err());
        assert!(exchange.get_position("BTCUSDT").await.unwrap().is_empty());

        exchange.recover(FailurePoint::Orders).await;
        let report = controller.run_cycle().await.unwrap();
        assert_eq!(report.opened.len(), 2);
    }

    #[tokio::test]
    async fn test_leverage_failure_defers_preparation() {
        let (exchange, mut controller) = setup(None, None).await;
        exchange.fail(FailurePoint::Leverage).await;
        assert!(controller.run_cycle().await.is_err());
        assert!(exchange.orders().await.is_empty());

        exchange.recover(FailurePoint::Leverage).await;
        controller.run_cycle().await.unwrap();
        assert_eq!(exchange.leverage_for("BTCUSDT", PositionSide::Short).await, Some(10));
    }

    #[tokio::test]
    async fn test_price_failure_aborts_cycle() {
        let exchange = Arc::new(MockExchange::new(dec!(1000)));
        let controller_config = Config::default();
        let mut controller =
            HedgeController::new(&controller_config, exchange.clone(), exchange.clone(), None);
        assert!(controller.run_cycle().await.is_err());
    }
}
