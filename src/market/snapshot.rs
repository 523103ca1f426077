//! Market snapshots: ordered bars for one symbol and interval.

use super::indicators;
use crate::error::TradeError;
use crate::exchange::{Bar, Interval, MarketDataProvider};
use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt::Write;

/// Bars for one symbol and interval, time-ascending. The last bar may still be forming.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub interval: Interval,
    pub bars: Vec<Bar>,
}

impl MarketSnapshot {
    pub async fn fetch(
        provider: &dyn MarketDataProvider,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Self> {
        let bars = provider
            .get_candles(symbol, interval, limit)
            .await
            .with_context(|| format!("Failed to fetch {} snapshot for {}", interval, symbol))?;
        Ok(Self {
            symbol: symbol.to_string(),
            interval,
            bars,
        })
    }

    /// All bars up to and including the last closed one.
    pub fn closed_bars(&self, now_ms: i64) -> &[Bar] {
        let closed = self
            .bars
            .iter()
            .rposition(|bar| bar.is_closed_at(now_ms))
            .map_or(0, |i| i + 1);
        &self.bars[..closed]
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.bars.iter().map(|bar| bar.close).collect()
    }
}

/// Mean of `(high - low) / close × 100` over `bars`.
pub fn average_range_percent(bars: &[Bar]) -> Result<Decimal> {
    if bars.is_empty() {
        return Err(TradeError::InsufficientData("no bars for average range".into()).into());
    }
    let mut total = Decimal::ZERO;
    for bar in bars {
        if bar.close <= Decimal::ZERO {
            return Err(TradeError::InsufficientData(format!(
                "non-positive close at {}",
                bar.open_time
            ))
            .into());
        }
        total += (bar.high - bar.low) / bar.close * dec!(100);
    }
    Ok(total / Decimal::from(bars.len()))
}

/// Fetch several timeframes concurrently.
pub async fn fetch_timeframes(
    provider: &dyn MarketDataProvider,
    symbol: &str,
    intervals: &[Interval],
    limit: usize,
) -> Result<Vec<MarketSnapshot>> {
    try_join_all(
        intervals
            .iter()
            .map(|interval| MarketSnapshot::fetch(provider, symbol, *interval, limit)),
    )
    .await
}

/// Render the multi-timeframe context handed to the trend classifier.
pub fn format_market_context(symbol: &str, price: Decimal, snapshots: &[MarketSnapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Symbol: {}", symbol);
    let _ = writeln!(out, "Current price: {}", price.round_dp(4));

    for snapshot in snapshots {
        let _ = writeln!(out, "\n## {} ({} bars)", snapshot.interval, snapshot.bars.len());
        let closes = snapshot.closes();
        let (Some(first), Some(last)) = (closes.first(), closes.last()) else {
            let _ = writeln!(out, "no data");
            continue;
        };

        if *first > Decimal::ZERO {
            let change = (*last - *first) / *first * dec!(100);
            let _ = writeln!(out, "Change over window: {}%", change.round_dp(2));
        }
        let high = snapshot.bars.iter().map(|b| b.high).max().unwrap_or(*last);
        let low = snapshot.bars.iter().map(|b| b.low).min().unwrap_or(*last);
        let _ = writeln!(out, "Window high/low: {} / {}", high.round_dp(4), low.round_dp(4));

        let fmt = |v: Option<Decimal>| v.map_or("n/a".to_string(), |v| v.round_dp(4).to_string());
        let _ = writeln!(
            out,
            "EMA20: {} | EMA50: {} | RSI14: {} | ATR14: {}",
            fmt(indicators::ema(&closes, 20)),
            fmt(indicators::ema(&closes, 50)),
            fmt(indicators::rsi(&closes, 14).map(|r| r.round_dp(2))),
            fmt(indicators::atr(&snapshot.bars, 14)),
        );

        let recent = &snapshot.bars[snapshot.bars.len().saturating_sub(5)..];
        for bar in recent {
            let _ = writeln!(
                out,
                "  {} O:{} H:{} L:{} C:{} V:{}",
                chrono::DateTime::from_timestamp_millis(bar.open_time)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default(),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume.round_dp(2),
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;

    fn hourly_bar(index: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        let open_time = index * Interval::Hour1.millis();
        Bar {
            open_time,
            open,
            high,
            low,
            close,
            volume: dec!(1),
            close_time: open_time + Interval::Hour1.millis() - 1,
        }
    }

    fn snapshot(bars: Vec<Bar>) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Hour1,
            bars,
        }
    }

    #[test]
    fn test_closed_bars_skip_forming_bar() {
        let snap = snapshot(vec![
            hourly_bar(0, dec!(100), dec!(101), dec!(99), dec!(100)),
            hourly_bar(1, dec!(100), dec!(102), dec!(99), dec!(101)),
            hourly_bar(2, dec!(101), dec!(101), dec!(100), dec!(100.5)),
        ]);
        let now = 2 * Interval::Hour1.millis() + 10_000;

        let closed = snap.closed_bars(now);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed.last().unwrap().open_time, Interval::Hour1.millis());
        assert!(snap.closed_bars(0).is_empty());
    }

    #[test]
    fn test_average_range_percent() {
        let bars = vec![
            hourly_bar(0, dec!(100), dec!(100.5), dec!(100), dec!(100)),
            hourly_bar(1, dec!(100), dec!(101), dec!(100.5), dec!(100)),
        ];
        assert_eq!(average_range_percent(&bars).unwrap(), dec!(0.5));
    }

    #[test]
    fn test_average_range_rejects_bad_data() {
        assert!(average_range_percent(&[]).is_err());
        let bars = vec![hourly_bar(0, dec!(1), dec!(1), dec!(0), dec!(0))];
        let err = average_range_percent(&bars).unwrap_err();
        assert!(err.downcast_ref::<TradeError>().is_some());
    }

    #[tokio::test]
    async fn test_fetch_timeframes_and_format() {
        let exchange = MockExchange::new(dec!(1000));
        for interval in [Interval::Min15, Interval::Hour1] {
            exchange
                .set_candles(
                    "BTCUSDT",
                    interval,
                    (0..30)
                        .map(|i| {
                            let close = dec!(100) + Decimal::from(i);
                            hourly_bar(i, close, close + dec!(1), close - dec!(1), close)
                        })
                        .collect(),
                )
                .await;
        }

        let snaps = fetch_timeframes(&exchange, "BTCUSDT", &[Interval::Min15, Interval::Hour1], 20)
            .await
            .unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[1].bars.len(), 20);

        let text = format_market_context("BTCUSDT", dec!(129), &snaps);
        assert!(text.contains("## 15m"));
        assert!(text.contains("## 1H"));
        assert!(text.contains("RSI14: 100"));
        assert!(text.contains("EMA50: n/a"));
    }
}
