//! In-memory mirror of the traded symbol's long and short legs.
//!
//! Refreshed from the gateway at the start of every cycle as a full resync.
//! A failed refresh keeps the previous state.

use crate::exchange::{normalize_symbol, ExecutionGateway, Position, PositionSide};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PositionStateTracker {
    symbol: String,
    long: Option<Position>,
    short: Option<Position>,
}

impl PositionStateTracker {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            long: None,
            short: None,
        }
    }

    /// Resync both slots from the account's open positions.
    ///
    /// Returns false (and keeps the previous slots) when the query fails.
    pub async fn refresh(&mut self, gateway: &dyn ExecutionGateway) -> bool {
        let positions = match gateway.get_all_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(
                    symbol = %self.symbol,
                    error = %e,
                    "⚠️  [POSITIONS] Refresh failed, keeping previous state"
                );
                return false;
            }
        };
        self.sync(positions);
        true
    }

    fn sync(&mut self, positions: Vec<Position>) {
        let mut long = None;
        let mut short = None;

        for position in positions {
            if normalize_symbol(&position.symbol) != self.symbol {
                continue;
            }
            if !position.is_valid() {
                debug!(
                    symbol = %position.symbol,
                    side = %position.side,
                    size = %position.size,
                    entry = %position.entry_price,
                    "Discarding invalid position"
                );
                continue;
            }
            let slot = match position.side {
                PositionSide::Long => &mut long,
                PositionSide::Short => &mut short,
            };
            if slot.is_some() {
                warn!(symbol = %self.symbol, side = %position.side, "Duplicate leg reported, keeping first");
                continue;
            }
            *slot = Some(position);
        }

        self.long = long;
        self.short = short;
        debug!(
            symbol = %self.symbol,
            long = self.long.is_some(),
            short = self.short.is_some(),
            "Positions refreshed"
        );
    }

    pub fn get(&self, side: PositionSide) -> Option<&Position> {
        match side {
            PositionSide::Long => self.long.as_ref(),
            PositionSide::Short => self.short.as_ref(),
        }
    }

    pub fn has(&self, side: PositionSide) -> bool {
        self.get(side).is_some()
    }

    /// Record a confirmed open.
    pub fn record_open(&mut self, position: Position) {
        match position.side {
            PositionSide::Long => self.long = Some(position),
            PositionSide::Short => self.short = Some(position),
        }
    }

    /// Record a confirmed full close.
    pub fn record_close(&mut self, side: PositionSide) {
        match side {
            PositionSide::Long => self.long = None,
            PositionSide::Short => self.short = None,
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.long.iter().chain(self.short.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::FailurePoint;
    use crate::exchange::MockExchange;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_refresh_filters_to_symbol() {
        let exchange = MockExchange::new(dec!(1000));
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, dec!(101), dec!(2), 10)
            .await;
        exchange
            .seed_position("ETHUSDT", PositionSide::Long, dec!(50), dec!(3), 5)
            .await;

        let mut tracker = PositionStateTracker::new("btcusdt_UMCBL");
        assert!(tracker.refresh(&exchange).await);

        assert_eq!(tracker.get(PositionSide::Long).unwrap().size, dec!(1));
        assert_eq!(tracker.get(PositionSide::Short).unwrap().entry_price, dec!(101));
        assert_eq!(tracker.positions().count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_positions_discarded() {
        let exchange = MockExchange::new(dec!(1000));
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), Decimal::ZERO, 10)
            .await;
        exchange
            .seed_position("BTCUSDT", PositionSide::Short, Decimal::ZERO, dec!(1), 10)
            .await;

        let mut tracker = PositionStateTracker::new("BTCUSDT");
        tracker.refresh(&exchange).await;
        assert!(!tracker.has(PositionSide::Long));
        assert!(!tracker.has(PositionSide::Short));
    }

    #[tokio::test]
    async fn test_refresh_failure_retains_previous_state() {
        let exchange = MockExchange::new(dec!(1000));
        exchange
            .seed_position("BTCUSDT", PositionSide::Long, dec!(100), dec!(1), 10)
            .await;

        let mut tracker = PositionStateTracker::new("BTCUSDT");
        tracker.refresh(&exchange).await;

        exchange.fail(FailurePoint::Positions).await;
        assert!(!tracker.refresh(&exchange).await);
        assert!(tracker.has(PositionSide::Long));
    }

    #[tokio::test]
    async fn test_refresh_is_full_resync() {
        let exchange = MockExchange::new(dec!(1000));
        let mut tracker = PositionStateTracker::new("BTCUSDT");
        tracker.record_open(Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Short,
            entry_price: dec!(100),
            size: dec!(1),
            leverage: 10,
        });

        tracker.refresh(&exchange).await;
        assert!(!tracker.has(PositionSide::Short));
    }
}
