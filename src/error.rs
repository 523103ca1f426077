//! Error taxonomy for conditions the trading core must recognise.
//!
//! Transport failures stay as `anyhow::Error` with context; the types here
//! mark the cases that change control flow (reallocation, cycle abort).

use crate::exchange::PositionSide;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors reported by an execution gateway.
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The gateway rejected an open because the account lacks free margin.
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    /// Any other non-success API response.
    #[error("exchange API error {code}: {msg}")]
    Api { code: String, msg: String },
}

/// Errors raised by the trading core itself.
#[derive(Error, Debug)]
pub enum TradeError {
    /// Too few bars, non-numeric or non-positive prices.
    #[error("insufficient market data: {0}")]
    InsufficientData(String),

    /// Reallocation could not free enough margin for a required open.
    #[error(
        "capital shortfall opening {side} {symbol}: need {required}, available {available}"
    )]
    CapitalShortfall {
        symbol: String,
        side: PositionSide,
        required: Decimal,
        available: Decimal,
    },

    /// The computed order quantity is smaller than the contract minimum.
    #[error("order size {size} for {symbol} is below the minimum tradable size {min}")]
    BelowMinimumSize {
        symbol: String,
        size: Decimal,
        min: Decimal,
    },
}

impl ExchangeError {
    /// True when `err` (anywhere in its chain) is an insufficient-margin rejection.
    pub fn is_insufficient_margin(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<ExchangeError>(),
                Some(ExchangeError::InsufficientMargin(_))
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_margin_detected_through_context() {
        let err: anyhow::Result<()> =
            Err(ExchangeError::InsufficientMargin("40762".to_string()).into());
        let err = err.context("Failed to place order").unwrap_err();
        assert!(ExchangeError::is_insufficient_margin(&err));

        let other = anyhow::Error::from(ExchangeError::Api {
            code: "40001".to_string(),
            msg: "bad".to_string(),
        });
        assert!(!ExchangeError::is_insufficient_margin(&other));
    }

    #[test]
    fn test_shortfall_message_carries_context() {
        let err = TradeError::CapitalShortfall {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            required: dec!(120),
            available: dec!(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("long BTCUSDT"));
        assert!(msg.contains("need 120"));
    }
}
