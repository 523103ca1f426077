//! Order execution: sizing, margin pre-flight and reallocation-backed opens.

use super::contracts::ContractBook;
use super::reallocation::CapitalReallocator;
use crate::error::{ExchangeError, TradeError};
use crate::exchange::{
    ExecutionGateway, MarginMode, MarketDataProvider, OrderRequest, Position, PositionSide,
};
use crate::utils::{floor_to_step, round_to_tick};
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters of one open.
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    pub symbol: &'a str,
    pub side: PositionSide,
    /// Margin to post, in quote currency
    pub margin: Decimal,
    pub leverage: u32,
    pub price: Decimal,
    pub take_profit: Option<Decimal>,
}

/// Places opens and closes for one controller.
pub struct OrderExecutor {
    gateway: Arc<dyn ExecutionGateway>,
    market: Arc<dyn MarketDataProvider>,
    contracts: ContractBook,
    reallocator: CapitalReallocator,
    /// Fraction of notional charged on a market open
    taker_fee_rate: Decimal,
}

impl OrderExecutor {
    pub fn new(
        gateway: Arc<dyn ExecutionGateway>,
        market: Arc<dyn MarketDataProvider>,
        contracts: ContractBook,
        reallocator: CapitalReallocator,
        taker_fee_rate: Decimal,
    ) -> Self {
        Self {
            gateway,
            market,
            contracts,
            reallocator,
            taker_fee_rate,
        }
    }

    /// Open a position, freeing capital from the weakest position in the
    /// account at most once if margin plus the open fee is not available.
    pub async fn open(&self, request: OpenRequest<'_>) -> Result<Position> {
        let OpenRequest {
            symbol,
            side,
            margin,
            leverage,
            price,
            take_profit,
        } = request;
        anyhow::ensure!(
            price > Decimal::ZERO,
            TradeError::InsufficientData(format!("non-positive price {} for {}", price, symbol))
        );

        let spec = self.contracts.get(self.gateway.as_ref(), symbol).await;
        let size = floor_to_step(margin * Decimal::from(leverage) / price, spec.size_step);
        if size < spec.min_trade_size || size <= Decimal::ZERO {
            return Err(TradeError::BelowMinimumSize {
                symbol: symbol.to_string(),
                size,
                min: spec.min_trade_size,
            }
            .into());
        }

        let mut order = OrderRequest::market_open(symbol, side, size).with_client_oid(format!(
            "phb-{}-{}-{}",
            symbol.to_lowercase(),
            side.as_str(),
            Utc::now().timestamp_millis()
        ));
        if let Some(tp) = take_profit {
            order = order.with_take_profit(round_to_tick(tp, spec.price_tick));
        }

        let required = margin + size * price * self.taker_fee_rate;
        let mut reallocated = false;
        let available = self.available(symbol).await?;
        if available < required {
            self.reallocate(symbol, side, required, available).await?;
            reallocated = true;
        }

        let result = match self.gateway.place_order(&order).await {
            Ok(result) => result,
            Err(e) if ExchangeError::is_insufficient_margin(&e) && !reallocated => {
                warn!(%symbol, %side, error = %e, "Open rejected for margin, reallocating once");
                let available = self.available(symbol).await?;
                self.reallocate(symbol, side, required, available).await?;
                self.gateway
                    .place_order(&order)
                    .await
                    .with_context(|| format!("Retry of {} {} open failed", side, symbol))?
            }
            Err(e) => {
                return Err(e.context(format!("Failed to open {} {}", side, symbol)));
            }
        };

        info!(
            %symbol,
            %side,
            %size,
            %price,
            %margin,
            leverage,
            take_profit = ?order.preset_take_profit,
            order_id = %result.order_id,
            "📈 [EXECUTE] Position opened"
        );

        Ok(Position {
            symbol: symbol.to_string(),
            side,
            entry_price: price,
            size,
            leverage,
        })
    }

    /// Close a whole leg.
    pub async fn close(&self, symbol: &str, side: PositionSide) -> Result<()> {
        self.gateway
            .close_position(symbol, side, None)
            .await
            .with_context(|| format!("Failed to close {} {}", side, symbol))?;
        info!(%symbol, %side, "📉 [EXECUTE] Position closed");
        Ok(())
    }

    /// Set margin mode (failure tolerated) and leverage for both hold sides.
    pub async fn prepare_symbol(
        &self,
        symbol: &str,
        leverage: u32,
        mode: MarginMode,
    ) -> Result<()> {
        if let Err(e) = self.gateway.set_margin_mode(symbol, mode).await {
            debug!(%symbol, mode = mode.as_str(), error = %e, "Margin mode unchanged");
        }

        tokio::try_join!(
            self.gateway.set_leverage(symbol, leverage, PositionSide::Long),
            self.gateway.set_leverage(symbol, leverage, PositionSide::Short),
        )
        .with_context(|| format!("Failed to configure {}x leverage for {}", leverage, symbol))?;

        info!(%symbol, leverage, mode = mode.as_str(), "✅ [INIT] Symbol prepared");
        Ok(())
    }

    async fn available(&self, symbol: &str) -> Result<Decimal> {
        Ok(self
            .gateway
            .get_account(symbol)
            .await
            .context("Failed to read available margin")?
            .available)
    }

    /// Run reallocation for the shortfall, then confirm the margin is there.
    async fn reallocate(
        &self,
        symbol: &str,
        side: PositionSide,
        required: Decimal,
        available: Decimal,
    ) -> Result<()> {
        let shortfall = (required - available).max(Decimal::ZERO);
        info!(
            %symbol,
            %side,
            %required,
            %available,
            %shortfall,
            "💸 [REALLOCATE] Capital shortfall"
        );

        let freed = self
            .reallocator
            .free_up_capital(
                self.gateway.as_ref(),
                self.market.as_ref(),
                &self.contracts,
                shortfall,
                (symbol, side),
            )
            .await?;

        let available = self.available(symbol).await?;
        info!(%symbol, %freed, %available, "💸 [REALLOCATE] Margin after reallocation");
        if available < required {
            return Err(TradeError::CapitalShortfall {
                symbol: symbol.to_string(),
                side,
                required,
                available,
            }
            .into());
        }
        Ok(())
    }
}
