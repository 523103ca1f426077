//! Configuration management for the hedge bot.
//!
//! Loads settings from an optional config file, environment variables and `.env`.

use crate::exchange::{Interval, MarginMode};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Exchange credentials and account scope
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Hedge lifecycle controller settings
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Range-threshold controller settings
    #[serde(default)]
    pub range: RangeConfig,
    /// Capital reallocation policy
    #[serde(default)]
    pub reallocation: ReallocationConfig,
    /// Fallback contract metadata when the exchange cannot provide it
    #[serde(default)]
    pub contract_defaults: ContractDefaults,
    /// AI trend classifier
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// API passphrase
    #[serde(default)]
    pub passphrase: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Product line, e.g. USDT-FUTURES
    #[serde(default = "default_product_type")]
    pub product_type: String,
    #[serde(default = "default_margin_coin")]
    pub margin_coin: String,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: MarginMode,
    /// Taker fee as a fraction of notional, reserved when sizing opens
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: Decimal,
    /// HTTP timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Margin budget in quote currency. Unset = split account equity.
    #[serde(default)]
    pub capital: Option<Decimal>,
    /// Leveraged ROI (in %) at which a hedge leg is closed for profit
    #[serde(default = "default_profit_threshold")]
    pub profit_threshold_pct: Decimal,
    /// Sleep between the end of one cycle and the start of the next
    #[serde(default = "default_hedge_interval_secs")]
    pub interval_secs: u64,
    /// Sleep after a failed cycle
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Timeframes fetched for the classifier context
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Interval>,
    #[serde(default = "default_bars_per_timeframe")]
    pub bars_per_timeframe: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// Margin per trade. Unset = half of account equity.
    #[serde(default)]
    pub capital: Option<Decimal>,
    /// Bar duration, also the scheduling boundary
    #[serde(default = "default_range_interval")]
    pub interval: Interval,
    /// Trailing window used for the average range (720 hourly bars ~ 30 days)
    #[serde(default = "default_window_bars")]
    pub window_bars: usize,
    /// Delay after the boundary so the exchange has sealed the bar
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReallocationConfig {
    /// Extra fraction freed on top of the shortfall (0.10 = 10%)
    #[serde(default = "default_reallocation_buffer")]
    pub buffer: Decimal,
    /// A partial close may not leave less margin than this
    #[serde(default = "default_min_viable_margin")]
    pub min_viable_margin: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractDefaults {
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
    #[serde(default = "default_size_step")]
    pub size_step: Decimal,
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Empty disables the classifier; the trend then stays unclear
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_classifier_url")]
    pub api_url: String,
    #[serde(default = "default_classifier_model")]
    pub model: String,
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.bitget.com".to_string()
}

fn default_product_type() -> String {
    "USDT-FUTURES".to_string()
}

fn default_margin_coin() -> String {
    "USDT".to_string()
}

fn default_margin_mode() -> MarginMode {
    MarginMode::Isolated
}

fn default_taker_fee_rate() -> Decimal {
    Decimal::new(6, 4) // 0.06%
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_leverage() -> u32 {
    10
}

fn default_profit_threshold() -> Decimal {
    Decimal::new(50, 1) // 5.0%
}

fn default_hedge_interval_secs() -> u64 {
    300
}

fn default_error_backoff_secs() -> u64 {
    300 // 5 minutes
}

fn default_timeframes() -> Vec<Interval> {
    vec![
        Interval::Min5,
        Interval::Min15,
        Interval::Hour1,
        Interval::Hour4,
        Interval::Day1,
    ]
}

fn default_bars_per_timeframe() -> usize {
    100
}

fn default_range_interval() -> Interval {
    Interval::Hour1
}

fn default_window_bars() -> usize {
    720
}

fn default_settle_delay_secs() -> u64 {
    2
}

fn default_reallocation_buffer() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_min_viable_margin() -> Decimal {
    Decimal::ONE
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_size_step() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_min_trade_size() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_classifier_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PHB"))
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_env_credentials();
        Ok(config)
    }

    /// Fill empty credentials from the conventional variable names.
    fn apply_env_credentials(&mut self) {
        let fill = |slot: &mut String, var: &str| {
            if slot.is_empty() {
                *slot = std::env::var(var).unwrap_or_default();
            }
        };
        fill(&mut self.exchange.api_key, "BITGET_API_KEY");
        fill(&mut self.exchange.secret_key, "BITGET_SECRET_KEY");
        fill(&mut self.exchange.passphrase, "BITGET_PASSPHRASE");
        fill(&mut self.classifier.api_key, "OPENAI_API_KEY");
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        for (name, leverage) in [("hedge", self.hedge.leverage), ("range", self.range.leverage)] {
            anyhow::ensure!(
                (1..=125).contains(&leverage),
                "{name}.leverage must be between 1 and 125"
            );
        }

        for (name, capital) in [("hedge", self.hedge.capital), ("range", self.range.capital)] {
            if let Some(capital) = capital {
                anyhow::ensure!(capital > Decimal::ZERO, "{name}.capital must be positive");
            }
        }

        anyhow::ensure!(
            self.hedge.profit_threshold_pct > Decimal::ZERO,
            "hedge.profit_threshold_pct must be positive"
        );

        anyhow::ensure!(
            self.range.window_bars >= 2,
            "range.window_bars must be at least 2"
        );

        anyhow::ensure!(
            self.exchange.taker_fee_rate >= Decimal::ZERO
                && self.exchange.taker_fee_rate < Decimal::new(1, 2),
            "exchange.taker_fee_rate must be in [0, 0.01)"
        );

        anyhow::ensure!(
            self.reallocation.buffer >= Decimal::ZERO,
            "reallocation.buffer must not be negative"
        );

        anyhow::ensure!(
            self.reallocation.min_viable_margin >= Decimal::ZERO,
            "reallocation.min_viable_margin must not be negative"
        );

        Ok(())
    }

    /// Ensure signing credentials are present. Only live trading needs them.
    pub fn require_credentials(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("api_key", &self.exchange.api_key),
            ("secret_key", &self.exchange.secret_key),
            ("passphrase", &self.exchange.passphrase),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect();

        anyhow::ensure!(
            missing.is_empty(),
            "missing exchange credentials: {}",
            missing.join(", ")
        );
        Ok(())
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            passphrase: String::new(),
            base_url: default_base_url(),
            product_type: default_product_type(),
            margin_coin: default_margin_coin(),
            margin_mode: default_margin_mode(),
            taker_fee_rate: default_taker_fee_rate(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            leverage: default_leverage(),
            capital: None,
            profit_threshold_pct: default_profit_threshold(),
            interval_secs: default_hedge_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            timeframes: default_timeframes(),
            bars_per_timeframe: default_bars_per_timeframe(),
        }
    }
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            leverage: default_leverage(),
            capital: None,
            interval: default_range_interval(),
            window_bars: default_window_bars(),
            settle_delay_secs: default_settle_delay_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl Default for ReallocationConfig {
    fn default() -> Self {
        Self {
            buffer: default_reallocation_buffer(),
            min_viable_margin: default_min_viable_margin(),
        }
    }
}

impl Default for ContractDefaults {
    fn default() -> Self {
        Self {
            price_tick: default_price_tick(),
            size_step: default_size_step(),
            min_trade_size: default_min_trade_size(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_url: default_classifier_url(),
            model: default_classifier_model(),
            timeout_secs: default_classifier_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_documented_policy_defaults() {
        let config = Config::default();
        assert_eq!(config.hedge.profit_threshold_pct, dec!(5.0));
        assert_eq!(config.reallocation.buffer, dec!(0.10));
        assert_eq!(config.exchange.taker_fee_rate, dec!(0.0006));
        assert_eq!(config.reallocation.min_viable_margin, dec!(1));
        assert_eq!(config.range.window_bars, 720);
        assert_eq!(config.hedge.error_backoff_secs, 300);
        assert_eq!(config.hedge.timeframes.len(), 5);
        assert!(config.hedge.capital.is_none());
    }

    #[test]
    fn test_invalid_leverage_rejected() {
        let mut config = Config::default();
        config.hedge.leverage = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.range.leverage = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fee_rate_bounds() {
        let mut config = Config::default();
        config.exchange.taker_fee_rate = dec!(-0.0001);
        assert!(config.validate().is_err());

        config.exchange.taker_fee_rate = dec!(0.02);
        assert!(config.validate().is_err());

        config.exchange.taker_fee_rate = Decimal::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_positive_capital_rejected() {
        let mut config = Config::default();
        config.hedge.capital = Some(Decimal::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_credentials_reported() {
        let mut config = Config::default();
        config.exchange.api_key = "key".to_string();
        let err = config.require_credentials().unwrap_err().to_string();
        assert!(err.contains("secret_key"));
        assert!(err.contains("passphrase"));
        assert!(!err.contains("api_key"));

        config.exchange.secret_key = "secret".to_string();
        config.exchange.passphrase = "pass".to_string();
        assert!(config.require_credentials().is_ok());
    }
}
