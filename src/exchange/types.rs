//! Canonical trading types and Bitget wire types.
//!
//! Gateway responses are converted into one canonical shape at this
//! boundary; the trading core never sees raw field-name variants.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Side of a hedge-mode position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin mode for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginMode {
    Isolated,
    Crossed,
}

impl MarginMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginMode::Isolated => "isolated",
            MarginMode::Crossed => "crossed",
        }
    }
}

/// One open leveraged exposure on one symbol and side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    /// Size in base-asset units
    pub size: Decimal,
    pub leverage: u32,
}

impl Position {
    /// Both size and entry price must be positive to be tracked.
    pub fn is_valid(&self) -> bool {
        self.size > Decimal::ZERO && self.entry_price > Decimal::ZERO && self.leverage > 0
    }

    /// Notional value at entry.
    pub fn notional(&self) -> Decimal {
        self.entry_price * self.size
    }

    /// Margin posted for the position (notional / leverage).
    pub fn margin(&self) -> Decimal {
        if self.leverage == 0 {
            return self.notional();
        }
        self.notional() / Decimal::from(self.leverage)
    }

    /// Favorable price move in percent.
    pub fn price_change_percent(&self, current_price: Decimal) -> Decimal {
        if self.entry_price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let moved = match self.side {
            PositionSide::Long => current_price - self.entry_price,
            PositionSide::Short => self.entry_price - current_price,
        };
        moved / self.entry_price * dec!(100)
    }

    /// Leveraged ROI in percent: price change × leverage.
    pub fn roi_percent(&self, current_price: Decimal) -> Decimal {
        self.price_change_percent(current_price) * Decimal::from(self.leverage)
    }

    /// Unrealized PnL in quote currency.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (current_price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - current_price) * self.size,
        }
    }
}

/// Bar duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1H")]
    Hour1,
    #[serde(rename = "4H")]
    Hour4,
    #[serde(rename = "1D")]
    Day1,
}

impl Interval {
    /// Granularity string used by the exchange.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1H",
            Interval::Hour4 => "4H",
            Interval::Day1 => "1D",
        }
    }

    pub fn millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Interval::Min1 => MINUTE,
            Interval::Min5 => 5 * MINUTE,
            Interval::Min15 => 15 * MINUTE,
            Interval::Min30 => 30 * MINUTE,
            Interval::Hour1 => 60 * MINUTE,
            Interval::Hour4 => 240 * MINUTE,
            Interval::Day1 => 1440 * MINUTE,
        }
    }

    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.millis() as u64)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::Min1),
            "5m" => Ok(Interval::Min5),
            "15m" => Ok(Interval::Min15),
            "30m" => Ok(Interval::Min30),
            "1H" | "1h" => Ok(Interval::Hour1),
            "4H" | "4h" => Ok(Interval::Hour4),
            "1D" | "1d" => Ok(Interval::Day1),
            other => anyhow::bail!("unsupported interval: {other}"),
        }
    }
}

/// One OHLCV bar. Timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Bar {
    /// A bar is closed once its close time has passed.
    pub fn is_closed_at(&self, now_ms: i64) -> bool {
        self.close_time <= now_ms
    }
}

/// Account equity and free margin in the margin coin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub available: Decimal,
}

/// Contract metadata (MarketMeta).
#[derive(Debug, Clone, PartialEq)]
pub struct ContractSpec {
    pub symbol: String,
    pub price_tick: Decimal,
    pub size_step: Decimal,
    pub min_trade_size: Decimal,
}

/// Market order opening (or adding to) one side of a hedge-mode position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub preset_take_profit: Option<Decimal>,
    pub preset_stop_loss: Option<Decimal>,
    pub client_oid: Option<String>,
}

impl OrderRequest {
    pub fn market_open(symbol: &str, side: PositionSide, size: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size,
            preset_take_profit: None,
            preset_stop_loss: None,
            client_oid: None,
        }
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.preset_take_profit = Some(price);
        self
    }

    pub fn with_client_oid(mut self, client_oid: impl Into<String>) -> Self {
        self.client_oid = Some(client_oid.into());
        self
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub order_id: String,
    pub client_oid: Option<String>,
}

/// Normalize a symbol for comparison: upper-case, exchange suffixes such as
/// `_UMCBL` stripped, separators removed.
pub fn normalize_symbol(symbol: &str) -> String {
    let base = symbol.split('_').next().unwrap_or(symbol);
    base.chars()
        .filter(|c| *c != '-' && *c != '/')
        .collect::<String>()
        .to_uppercase()
}

// ==================== Bitget Wire Types ====================

/// Standard Bitget response envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

/// Position as returned by the position endpoints. Field names vary
/// between endpoints and API versions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPosition {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub hold_side: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub open_price_avg: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub average_open_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub total: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub hold_size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub leverage: Option<Decimal>,
}

/// Convert a raw position into the canonical shape.
///
/// Returns `None` when the side is unknown or a required number is missing.
/// Size and price positivity is checked by the consumer.
pub fn normalize_position(raw: &RawPosition) -> Option<Position> {
    let side = match raw.hold_side.to_ascii_lowercase().as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        _ => return None,
    };
    let entry_price = raw.open_price_avg.or(raw.average_open_price)?;
    let size = raw.total.or(raw.hold_size).or(raw.size)?;
    let leverage = raw
        .leverage
        .and_then(|l| l.trunc().to_u32())
        .filter(|l| *l > 0)
        .unwrap_or(1);

    Some(Position {
        symbol: normalize_symbol(&raw.symbol),
        side,
        entry_price,
        size,
        leverage,
    })
}

/// Account as returned by the single-account endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAccount {
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub account_equity: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub usdt_equity: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub available: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub crossed_max_available: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub isolated_max_available: Option<Decimal>,
}

impl RawAccount {
    pub fn to_snapshot(&self, margin_mode: MarginMode) -> AccountSnapshot {
        let mode_available = match margin_mode {
            MarginMode::Isolated => self.isolated_max_available,
            MarginMode::Crossed => self.crossed_max_available,
        };
        AccountSnapshot {
            equity: self
                .account_equity
                .or(self.usdt_equity)
                .unwrap_or(Decimal::ZERO),
            available: mode_available.or(self.available).unwrap_or(Decimal::ZERO),
        }
    }
}

/// Contract metadata as returned by the contracts endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawContract {
    pub symbol: String,
    /// Price decimal places
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price_place: Option<Decimal>,
    /// Price step in units of the last decimal place
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price_end_step: Option<Decimal>,
    /// Quantity decimal places
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub volume_place: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size_multiplier: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub min_trade_num: Option<Decimal>,
}

impl RawContract {
    pub fn to_spec(&self) -> Option<ContractSpec> {
        let places = |d: Decimal| d.trunc().to_u32();
        let price_unit = Decimal::new(1, places(self.price_place?)?);
        let price_tick = price_unit * self.price_end_step.unwrap_or(Decimal::ONE);
        let size_step = self
            .size_multiplier
            .filter(|m| *m > Decimal::ZERO)
            .or_else(|| self.volume_place.and_then(places).map(|p| Decimal::new(1, p)))?;

        Some(ContractSpec {
            symbol: normalize_symbol(&self.symbol),
            price_tick,
            size_step,
            min_trade_size: self.min_trade_num.unwrap_or(size_step),
        })
    }
}

/// Order acknowledgement.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOrderAck {
    pub order_id: String,
    #[serde(default)]
    pub client_oid: Option<String>,
}

/// Candle row: `[ts, open, high, low, close, baseVolume, quoteVolume]`.
pub type RawCandle = Vec<String>;

/// Parse one candle row. `interval_ms` supplies the close time, which the
/// exchange does not send.
pub fn parse_candle(row: &RawCandle, interval_ms: i64) -> Option<Bar> {
    if row.len() < 6 {
        return None;
    }
    let open_time: i64 = row[0].parse().ok()?;
    let num = |i: usize| Decimal::from_str(&row[i]).ok();
    Some(Bar {
        open_time,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
        close_time: open_time + interval_ms - 1,
    })
}

/// Accept decimals encoded as strings, numbers, or null/empty.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) if s.trim().is_empty() => Ok(None),
        serde_json::Value::String(s) => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .map(Some)
            .map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected decimal, got {other}"
        ))),
    }
}
