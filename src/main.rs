//! Perp Hedge Bot - Main Entry Point
//!
//! Runs the hedge lifecycle or the range-threshold controller against Bitget,
//! live or on a paper account priced from public market data.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use perp_hedge_bot::classifier::{LlmTrendClassifier, TrendClassifier};
use perp_hedge_bot::config::Config;
use perp_hedge_bot::exchange::{
    BitgetClient, ExecutionGateway, Interval, MarketDataProvider, MockExchange,
};
use perp_hedge_bot::scheduler::{spawn_signal_listener, Cadence, Scheduler, ShutdownFlag};
use perp_hedge_bot::strategy::{HedgeController, RangeController};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Perp Hedge Bot CLI
#[derive(Parser)]
#[command(name = "perp-hedge-bot")]
#[command(version, about = "Leveraged hedge-position automation on Bitget perpetuals")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long/short hedge lifecycle on a fixed interval
    Hedge(RunArgs),

    /// Run the range-threshold strategy once per closed bar
    Range {
        #[command(flatten)]
        run: RunArgs,

        /// Bar interval (1m, 5m, 15m, 30m, 1H, 4H, 1D)
        #[arg(short, long, value_parser = parse_interval)]
        interval: Option<Interval>,
    },

    /// Show account equity and open positions (needs credentials)
    Status,
}

#[derive(Args)]
struct RunArgs {
    /// Contract symbol, e.g. BTCUSDT
    #[arg(short, long)]
    symbol: Option<String>,

    /// Leverage applied to both sides
    #[arg(short, long)]
    leverage: Option<u32>,

    /// Margin budget in USDT (default: derived from account equity)
    #[arg(short, long)]
    capital: Option<Decimal>,

    /// Starting balance of the paper account
    #[arg(short = 'b', long, default_value = "10000")]
    paper_balance: Decimal,
}

impl RunArgs {
    fn apply(&self, symbol: &mut String, leverage: &mut u32, capital: &mut Option<Decimal>) {
        if let Some(s) = &self.symbol {
            *symbol = s.to_uppercase();
        }
        if let Some(l) = self.leverage {
            *leverage = l;
        }
        if self.capital.is_some() {
            *capital = self.capital;
        }
    }
}

fn parse_interval(s: &str) -> Result<Interval, String> {
    s.parse::<Interval>().map_err(|e| e.to_string())
}

/// Trading mode: Live (real money) or Mock (paper trading).
#[derive(Debug, Clone, Copy, PartialEq)]
enum TradingMode {
    Live,
    Mock,
}

/// Market data and order routing for one run.
struct Venue {
    market: Arc<dyn MarketDataProvider>,
    gateway: Arc<dyn ExecutionGateway>,
    paper: Option<Arc<MockExchange>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let mut config = Config::load()?;

    match cli.command {
        Commands::Hedge(args) => {
            args.apply(
                &mut config.hedge.symbol,
                &mut config.hedge.leverage,
                &mut config.hedge.capital,
            );
            config.validate()?;
            run_hedge(config, args.paper_balance).await
        }
        Commands::Range { run, interval } => {
            run.apply(
                &mut config.range.symbol,
                &mut config.range.leverage,
                &mut config.range.capital,
            );
            if let Some(interval) = interval {
                config.range.interval = interval;
            }
            config.validate()?;
            run_range(config, run.paper_balance).await
        }
        Commands::Status => {
            config.validate()?;
            show_status(&config).await
        }
    }
}

fn trading_mode() -> TradingMode {
    if std::env::var("LIVE_TRADING").unwrap_or_default() == "true" {
        TradingMode::Live
    } else {
        TradingMode::Mock
    }
}

fn print_banner(strategy: &str, mode: TradingMode) {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║                    PERP HEDGE BOT                          ║");
    info!("║     Leveraged hedge automation for Bitget perpetuals       ║");
    info!("╚════════════════════════════════════════════════════════════╝");
    info!(strategy, "Selected strategy");

    match mode {
        TradingMode::Live => warn!("⚠️  LIVE TRADING MODE - Real money at risk!"),
        TradingMode::Mock => info!("📝 MOCK TRADING MODE - Paper trading enabled"),
    }
}

/// Build the exchange handles for the selected mode.
///
/// Paper mode still prices from Bitget's public endpoints; credentials are
/// only required when orders go to the real account.
async fn connect(
    config: &Config,
    mode: TradingMode,
    paper_balance: Decimal,
    symbol: &str,
) -> Result<Venue> {
    match mode {
        TradingMode::Live => {
            config.require_credentials()?;
            let client = Arc::new(BitgetClient::new(&config.exchange)?);
            Ok(Venue {
                market: client.clone(),
                gateway: client,
                paper: None,
            })
        }
        TradingMode::Mock => {
            let public = Arc::new(BitgetClient::new(&config.exchange)?);
            let paper = MockExchange::new(paper_balance)
                .with_fee_rate(config.exchange.taker_fee_rate)
                .with_price_source(public.clone());

            match public.get_contract(symbol).await {
                Ok(spec) => paper.set_contract(spec).await,
                Err(e) => warn!(
                    symbol,
                    error = %e,
                    "Could not load contract metadata; paper account uses defaults"
                ),
            }

            let paper = Arc::new(paper);
            Ok(Venue {
                market: paper.clone(),
                gateway: paper.clone(),
                paper: Some(paper),
            })
        }
    }
}

fn build_classifier(config: &Config) -> Result<Option<Arc<dyn TrendClassifier>>> {
    if config.classifier.api_key.is_empty() {
        warn!("🧭 No classifier API key configured; trend stays unclear");
        return Ok(None);
    }
    let classifier = LlmTrendClassifier::new(&config.classifier)?;
    Ok(Some(Arc::new(classifier)))
}

async fn run_hedge(config: Config, paper_balance: Decimal) -> Result<()> {
    let mode = trading_mode();
    print_banner("hedge", mode);
    log_config(&config, "hedge");

    let venue = connect(&config, mode, paper_balance, &config.hedge.symbol).await?;
    let classifier = build_classifier(&config)?;

    let mut controller = HedgeController::new(
        &config,
        venue.market.clone(),
        venue.gateway.clone(),
        classifier,
    );

    let shutdown = ShutdownFlag::new();
    spawn_signal_listener(shutdown.clone());

    let scheduler = Scheduler::new(
        Cadence::FixedInterval(Duration::from_secs(config.hedge.interval_secs)),
        Duration::from_secs(config.hedge.error_backoff_secs),
        shutdown,
    );
    let cycles = scheduler.run(&mut controller).await;

    info!(cycles, trend = %controller.trend().trend, "👋 Hedge bot stopped");
    if let Some(paper) = &venue.paper {
        log_paper_summary(paper).await;
    }
    Ok(())
}

async fn run_range(config: Config, paper_balance: Decimal) -> Result<()> {
    let mode = trading_mode();
    print_banner("range", mode);
    log_config(&config, "range");

    let venue = connect(&config, mode, paper_balance, &config.range.symbol).await?;

    let mut controller =
        RangeController::new(&config, venue.market.clone(), venue.gateway.clone());

    let shutdown = ShutdownFlag::new();
    spawn_signal_listener(shutdown.clone());

    let scheduler = Scheduler::new(
        Cadence::BoundaryAligned {
            period: config.range.interval.duration(),
            settle: Duration::from_secs(config.range.settle_delay_secs),
        },
        Duration::from_secs(config.range.error_backoff_secs),
        shutdown,
    );
    let cycles = scheduler.run(&mut controller).await;

    info!(cycles, "👋 Range bot stopped");
    if let Some(paper) = &venue.paper {
        log_paper_summary(paper).await;
    }
    Ok(())
}

async fn log_paper_summary(paper: &MockExchange) {
    let state = paper.get_state().await;
    info!("📊 Paper account summary:");
    info!("   Initial Balance: ${:.2}", state.initial_balance);
    info!("   Available:       ${:.2}", state.available);
    info!("   Realized PnL:    ${:.4}", state.realized_pnl);
    info!("   Trading Fees:    ${:.4}", state.total_trading_fees);
    info!("   Orders:          {}", state.order_count);
    info!("   Open Positions:  {}", state.positions.len());
}

/// Print the live account and every open position at the latest price.
async fn show_status(config: &Config) -> Result<()> {
    config.require_credentials()?;
    let client = BitgetClient::new(&config.exchange)?;

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              PERP HEDGE BOT STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let account = client
        .get_account(&config.hedge.symbol)
        .await
        .context("Failed to load account")?;
    let positions = client
        .get_all_positions()
        .await
        .context("Failed to load positions")?;

    println!("\n📊 Account Summary");
    println!("   ├─ Equity:           ${:.2}", account.equity);
    println!("   ├─ Available:        ${:.2}", account.available);
    println!("   └─ Open Positions:   {}", positions.len());

    if positions.is_empty() {
        println!("\n   No open positions.");
        return Ok(());
    }

    println!("\n🔓 Open Positions");
    for position in positions.iter().filter(|p| p.is_valid()) {
        println!("   ┌─ {} {}", position.symbol, position.side);
        println!(
            "   ├─ Size:     {} @ ${} ({}x)",
            position.size, position.entry_price, position.leverage
        );
        println!("   ├─ Margin:   ${:.2}", position.margin());
        match client.latest_price(&position.symbol).await {
            Ok(price) => {
                println!("   ├─ Price:    ${}", price);
                println!("   ├─ uPnL:     ${:.4}", position.unrealized_pnl(price));
                println!("   └─ ROI:      {:+.2}%", position.roi_percent(price));
            }
            Err(e) => println!("   └─ Price unavailable: {}", e),
        }
    }

    Ok(())
}

/// Initialize logging with console and file output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "perp-hedge-bot.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("perp_hedge_bot=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, strategy: &str) {
    info!("📋 Configuration:");
    info!("   Margin Mode: {}", config.exchange.margin_mode.as_str());
    info!(
        "   Taker Fee: {:.3}%",
        config.exchange.taker_fee_rate * dec!(100)
    );
    match strategy {
        "hedge" => {
            let hedge = &config.hedge;
            info!("   Symbol: {}", hedge.symbol);
            info!("   Leverage: {}x", hedge.leverage);
            match hedge.capital {
                Some(capital) => info!("   Capital: ${}", capital),
                None => info!("   Capital: half of equity per leg"),
            }
            info!("   Profit Threshold: {}% ROI", hedge.profit_threshold_pct);
            info!("   Cycle Interval: {}s", hedge.interval_secs);
            info!("   Error Back-off: {}s", hedge.error_backoff_secs);
            info!(
                "   Timeframes: {}",
                hedge
                    .timeframes
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        _ => {
            let range = &config.range;
            info!("   Symbol: {}", range.symbol);
            info!("   Leverage: {}x", range.leverage);
            match range.capital {
                Some(capital) => info!("   Capital: ${}", capital),
                None => info!("   Capital: half of equity"),
            }
            info!("   Interval: {}", range.interval);
            info!("   Window: {} bars", range.window_bars);
            info!("   Error Back-off: {}s", range.error_backoff_secs);
        }
    }
    info!(
        "   Reallocation Buffer: {:.0}%",
        config.reallocation.buffer * dec!(100)
    );
    info!(
        "   Min Viable Margin: ${}",
        config.reallocation.min_viable_margin
    );
}
