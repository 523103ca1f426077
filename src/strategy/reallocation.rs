//! Capital reallocation: free margin by draining the weakest open position.
//!
//! Positions are ranked account-wide by unrealized PnL, each measured at its
//! own symbol's price, the controller's own symbol included. Only the head of
//! the ranking is touched per call, and never the leg being funded.

use super::contracts::ContractBook;
use crate::config::ReallocationConfig;
use crate::exchange::{
    normalize_symbol, ExecutionGateway, MarketDataProvider, Position, PositionSide,
};
use crate::utils::ceil_to_step;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// How a reallocation drained its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Drain {
    Full,
    Partial { size: Decimal },
}

pub struct CapitalReallocator {
    config: ReallocationConfig,
}

impl CapitalReallocator {
    pub fn new(config: ReallocationConfig) -> Self {
        Self { config }
    }

    /// Free at least `required` (plus the buffer) from one position.
    ///
    /// `opening` is the (symbol, side) leg the margin is for; an existing
    /// position on that leg is never drained. Returns the margin released,
    /// which may be less than requested. Callers re-query available margin
    /// rather than trusting this estimate.
    pub async fn free_up_capital(
        &self,
        gateway: &dyn ExecutionGateway,
        market: &dyn MarketDataProvider,
        contracts: &ContractBook,
        required: Decimal,
        opening: (&str, PositionSide),
    ) -> Result<Decimal> {
        if required <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let (opening_symbol, opening_side) = (normalize_symbol(opening.0), opening.1);
        let candidates: Vec<Position> = gateway
            .get_all_positions()
            .await
            .context("Failed to list positions for reallocation")?
            .into_iter()
            .filter(|p| {
                p.is_valid()
                    && !(p.side == opening_side && normalize_symbol(&p.symbol) == opening_symbol)
            })
            .collect();

        let Some((target, pnl)) = self.weakest(market, candidates).await else {
            warn!(%required, "💸 [REALLOCATE] No eligible position to drain");
            return Ok(Decimal::ZERO);
        };

        let wanted = required * (Decimal::ONE + self.config.buffer);
        let spec = contracts.get(gateway, &target.symbol).await;
        let (drain, freed) = self.plan(&target, wanted, spec.size_step);

        info!(
            symbol = %target.symbol,
            side = %target.side,
            unrealized_pnl = %pnl,
            margin = %target.margin(),
            %required,
            %wanted,
            drain = ?drain,
            freed = %freed,
            "💸 [REALLOCATE] Draining weakest position"
        );

        let size = match drain {
            Drain::Full => None,
            Drain::Partial { size } => Some(size),
        };
        gateway
            .close_position(&target.symbol, target.side, size)
            .await
            .with_context(|| format!("Failed to drain {} {}", target.side, target.symbol))?;

        Ok(freed)
    }

    /// Lowest-PnL position, pricing each distinct symbol once.
    async fn weakest(
        &self,
        market: &dyn MarketDataProvider,
        candidates: Vec<Position>,
    ) -> Option<(Position, Decimal)> {
        let mut prices: HashMap<String, Option<Decimal>> = HashMap::new();
        for position in &candidates {
            if prices.contains_key(&position.symbol) {
                continue;
            }
            let price = match market.latest_price(&position.symbol).await {
                Ok(price) => Some(price),
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "No price, skipping for reallocation");
                    None
                }
            };
            prices.insert(position.symbol.clone(), price);
        }

        let mut ranked: Vec<(Position, Decimal)> = candidates
            .into_iter()
            .filter_map(|p| {
                let price = prices.get(&p.symbol).copied().flatten()?;
                let pnl = p.unrealized_pnl(price);
                debug!(symbol = %p.symbol, side = %p.side, %price, pnl = %pnl, "Reallocation candidate");
                Some((p, pnl))
            })
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1));
        ranked.into_iter().next()
    }

    /// Decide full or partial close and the margin it releases.
    fn plan(&self, position: &Position, wanted: Decimal, size_step: Decimal) -> (Drain, Decimal) {
        let margin = position.margin();
        if wanted >= margin {
            return (Drain::Full, margin);
        }

        // Multiply before dividing to keep the result exact where possible.
        let raw = (position.size * wanted / margin).round_dp(12);
        let close_size = ceil_to_step(raw, size_step);
        if close_size >= position.size {
            return (Drain::Full, margin);
        }

        let freed = margin * close_size / position.size;
        let remaining = margin - freed;
        if remaining < self.config.min_viable_margin {
            debug!(
                symbol = %position.symbol,
                %remaining,
                min = %self.config.min_viable_margin,
                "Remainder below minimum viable margin, closing fully"
            );
            return (Drain::Full, margin);
        }

        (Drain::Partial { size: close_size }, freed)
    }
}
