//! # Perp Hedge Bot
//!
//! Leveraged hedge-position automation for Bitget USDT-margined perpetuals.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `error`: Typed errors the trading core reacts to
//! - `exchange`: Gateway traits, the Bitget REST client and a mock account
//! - `market`: Indicators and market snapshots
//! - `classifier`: Advisory trend classification
//! - `strategy`: Position tracking, capital reallocation, execution, controllers
//! - `scheduler`: Fixed-interval and boundary-aligned cycle loops
//! - `utils`: Shared utilities and decimal arithmetic

pub mod classifier;
pub mod config;
pub mod error;
pub mod exchange;
pub mod market;
pub mod scheduler;
pub mod strategy;
pub mod utils;

pub use config::Config;
