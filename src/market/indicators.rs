//! Technical indicators over `Decimal` series.

use crate::exchange::Bar;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Simple moving average of the last `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period))
}

/// Exponential moving average seeded with the SMA of the first `period` values.
pub fn ema(values: &[Decimal], period: usize) -> Option<Decimal> {
    let seed = sma(&values[..period.min(values.len())], period)?;
    let multiplier = dec!(2) / Decimal::from(period + 1);

    let mut ema = seed;
    for value in &values[period..] {
        ema = (*value - ema) * multiplier + ema;
    }
    Some(ema)
}

/// Relative Strength Index over the last `period` changes.
///
/// Values above 70 read as overbought, below 30 as oversold.
pub fn rsi(closes: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let (mut gains, mut losses) = (Decimal::ZERO, Decimal::ZERO);
    for pair in closes[closes.len() - period - 1..].windows(2) {
        let change = pair[1] - pair[0];
        if change > Decimal::ZERO {
            gains += change;
        } else {
            losses -= change;
        }
    }

    if losses == Decimal::ZERO {
        return Some(dec!(100));
    }
    let rs = gains / losses;
    Some(dec!(100) - dec!(100) / (Decimal::ONE + rs))
}

/// Average True Range with Wilder's smoothing.
pub fn atr(bars: &[Bar], period: usize) -> Option<Decimal> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<Decimal> = bars
        .windows(2)
        .map(|pair| {
            let (prev, bar) = (&pair[0], &pair[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect();

    let n = Decimal::from(period);
    let mut atr: Decimal = true_ranges.iter().take(period).sum::<Decimal>() / n;
    for tr in &true_ranges[period..] {
        atr = (atr * (n - Decimal::ONE) + *tr) / n;
    }
    Some(atr)
}
