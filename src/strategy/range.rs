//! Range-threshold controller: one position per symbol, traded on bar close.
//!
//! The last closed bar decides direction (bearish bar goes long, bullish bar
//! goes short, doji does nothing). The take-profit sits one average bar range
//! away from entry; there is no stop-loss.

use super::contracts::ContractBook;
use super::executor::{OpenRequest, OrderExecutor};
use super::reallocation::CapitalReallocator;
use crate::config::{Config, RangeConfig};
use crate::error::TradeError;
use crate::exchange::{ExecutionGateway, MarginMode, MarketDataProvider, PositionSide};
use crate::market::{average_range_percent, MarketSnapshot};
use crate::scheduler::Cycle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of one range cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeOutcome {
    /// This boundary period was already handled.
    AlreadyProcessed,
    /// The signal bar was a doji.
    NoSignal,
    /// A position in the signal direction is already open.
    Held(PositionSide),
    Opened {
        side: PositionSide,
        entry: Decimal,
        take_profit: Decimal,
    },
}

pub struct RangeController {
    config: RangeConfig,
    margin_mode: MarginMode,
    market: Arc<dyn MarketDataProvider>,
    gateway: Arc<dyn ExecutionGateway>,
    executor: OrderExecutor,
    prepared: bool,
    last_cycle_id: Option<String>,
}

impl RangeController {
    pub fn new(
        config: &Config,
        market: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn ExecutionGateway>,
    ) -> Self {
        let range = config.range.clone();
        let executor = OrderExecutor::new(
            gateway.clone(),
            market.clone(),
            ContractBook::new(config.contract_defaults.clone()),
            CapitalReallocator::new(config.reallocation.clone()),
            config.exchange.taker_fee_rate,
        );

        Self {
            config: range,
            margin_mode: config.exchange.margin_mode,
            market,
            gateway,
            executor,
            prepared: false,
            last_cycle_id: None,
        }
    }

    /// Identifier of the boundary period containing `now`.
    fn cycle_id(&self, now: DateTime<Utc>) -> String {
        let period = self.config.interval.millis();
        let ms = now.timestamp_millis();
        let start = ms - ms.rem_euclid(period);
        DateTime::from_timestamp_millis(start)
            .map(|t| t.format("%Y-%m-%dT%H:%M").to_string())
            .unwrap_or_else(|| start.to_string())
    }

    pub async fn run_cycle(&mut self) -> Result<RangeOutcome> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as of `now`. The cycle id is recorded only when the
    /// cycle completes, so a failed cycle can be retried in the same period.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<RangeOutcome> {
        let cycle_id = self.cycle_id(now);
        if self.last_cycle_id.as_deref() == Some(cycle_id.as_str()) {
            debug!(%cycle_id, "Period already processed");
            return Ok(RangeOutcome::AlreadyProcessed);
        }

        let outcome = self.decide_and_trade(now).await?;
        self.last_cycle_id = Some(cycle_id);
        Ok(outcome)
    }

    async fn decide_and_trade(&mut self, now: DateTime<Utc>) -> Result<RangeOutcome> {
        let symbol = self.config.symbol.clone();
        let leverage = self.config.leverage;

        if !self.prepared {
            self.executor
                .prepare_symbol(&symbol, leverage, self.margin_mode)
                .await?;
            self.prepared = true;
        }

        // One extra bar for the one still forming.
        let snapshot = MarketSnapshot::fetch(
            self.market.as_ref(),
            &symbol,
            self.config.interval,
            self.config.window_bars + 1,
        )
        .await?;

        let closed = snapshot.closed_bars(now.timestamp_millis());
        let window = &closed[closed.len().saturating_sub(self.config.window_bars)..];
        let Some(signal_bar) = window.last() else {
            return Err(TradeError::InsufficientData(format!(
                "no closed {} bars for {}",
                self.config.interval, symbol
            ))
            .into());
        };

        let avg_range = average_range_percent(window)?;
        let roi_target = avg_range * Decimal::from(leverage);
        info!(
            %symbol,
            bars = window.len(),
            avg_range_pct = %avg_range.round_dp(4),
            roi_target_pct = %roi_target.round_dp(2),
            "📏 [RANGE] Window computed"
        );

        let side = if signal_bar.close < signal_bar.open {
            PositionSide::Long
        } else if signal_bar.close > signal_bar.open {
            PositionSide::Short
        } else {
            info!(%symbol, open = %signal_bar.open, close = %signal_bar.close, "📏 [RANGE] Doji, no trade");
            return Ok(RangeOutcome::NoSignal);
        };
        info!(
            %symbol,
            %side,
            open = %signal_bar.open,
            close = %signal_bar.close,
            "📏 [RANGE] Signal from last closed bar"
        );

        let existing: Vec<_> = self
            .gateway
            .get_position(&symbol)
            .await
            .context("Failed to read current position")?
            .into_iter()
            .filter(|p| p.is_valid())
            .collect();

        if existing.iter().any(|p| p.side == side.opposite()) {
            self.executor.close(&symbol, side.opposite()).await?;
        }
        if existing.iter().any(|p| p.side == side) {
            info!(%symbol, %side, "📏 [RANGE] Already positioned, holding");
            return Ok(RangeOutcome::Held(side));
        }

        let entry = self
            .market
            .latest_price(&symbol)
            .await
            .context("Failed to read entry price")?;
        let offset = avg_range / dec!(100);
        let take_profit = match side {
            PositionSide::Long => entry * (Decimal::ONE + offset),
            PositionSide::Short => entry * (Decimal::ONE - offset),
        };

        let margin = match self.config.capital {
            Some(capital) => capital,
            None => {
                self.gateway
                    .get_account(&symbol)
                    .await
                    .context("Failed to read account equity")?
                    .equity
                    / dec!(2)
            }
        };

        let position = self
            .executor
            .open(OpenRequest {
                symbol: &symbol,
                side,
                margin,
                leverage,
                price: entry,
                take_profit: Some(take_profit),
            })
            .await?;

        Ok(RangeOutcome::Opened {
            side,
            entry: position.entry_price,
            take_profit,
        })
    }
}

#[async_trait]
impl Cycle for RangeController {
    fn name(&self) -> &str {
        "range"
    }

    async fn tick(&mut self) -> Result<()> {
        self.run_cycle().await.map(|_| ())
    }
}
