//! Kraken spot dip-buying bot
//!
//! Buys short-term dips on a fixed set of instruments, sized by fractional
//! risk, and exits on ATR-based targets or a trailing stop.

mod api;
mod bot;
mod db;
mod error;
mod metrics;
mod models;
mod trading;

#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{canonical_symbol, Credentials, KrakenClient, MarketGateway, PaperConfig, PaperGateway};
use crate::bot::{Bot, BotConfig, BotStats, CycleState};
use crate::db::Database;
use crate::trading::{EntryTrendFilter, TradingConfig};

/// Kraken dip-buying bot CLI.
#[derive(Parser)]
#[command(name = "dipper")]
#[command(about = "Buy dips on Kraken spot markets with fractional risk sizing", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "DIPPER_DATABASE", default_value = "sqlite:./dipper.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

/// Strategy overrides shared by the trading commands.
#[derive(Args, Debug, Clone)]
struct StrategyArgs {
    /// Polling interval in seconds
    #[arg(short, long, env = "DIPPER_INTERVAL", default_value = "30")]
    interval: u64,

    /// Comma-separated instruments, e.g. SOL/USD,ETH/USD
    #[arg(short, long, env = "DIPPER_SYMBOLS", value_delimiter = ',')]
    symbols: Vec<String>,

    /// Maximum concurrently open positions
    #[arg(long, env = "DIPPER_MAX_OPEN")]
    max_open: Option<usize>,

    /// Fraction of equity risked per trade (0.02 = 2%)
    #[arg(long, env = "DIPPER_RISK")]
    risk: Option<Decimal>,

    /// Entry trend filter (below-trend, above-htf)
    #[arg(long, env = "DIPPER_TREND_FILTER")]
    trend_filter: Option<String>,
}

impl StrategyArgs {
    fn trading_config(&self) -> Result<TradingConfig> {
        let mut config = TradingConfig::default();

        if !self.symbols.is_empty() {
            config.symbols = self.symbols.iter().map(|s| canonical_symbol(s.trim())).collect();
        }
        if let Some(max_open) = self.max_open {
            config.max_open = max_open;
        }
        if let Some(risk) = self.risk {
            if risk <= Decimal::ZERO || risk >= Decimal::ONE {
                bail!("Risk fraction must be between 0 and 1, got {}", risk);
            }
            config.risk_fraction = risk;
        }
        if let Some(filter) = &self.trend_filter {
            config.trend_filter = EntryTrendFilter::parse(filter)
                .with_context(|| format!("Unknown trend filter: {}", filter))?;
        }

        Ok(config)
    }

    fn bot_config(&self, database: &str, mode: &str) -> Result<BotConfig> {
        Ok(BotConfig {
            poll_interval_secs: self.interval.max(1),
            database_url: database.to_string(),
            mode: mode.to_string(),
            trading: self.trading_config()?,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start live trading
    Run {
        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Start paper trading against live market data
    Paper {
        /// Initial cash in USD
        #[arg(short, long, default_value = "10000")]
        cash: Decimal,

        /// Simulated fee rate (0.0026 = 0.26%)
        #[arg(long, default_value = "0.0026")]
        fee: Decimal,

        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Show positions reconciled from wallet and trade history
    Reconcile {
        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Append recent exchange fills to the ledger
    Sync,

    /// Show current configuration
    Config {
        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Show bot status and statistics
    Status,
}

/// Authenticated client with the market table loaded.
async fn live_client() -> Result<KrakenClient> {
    let credentials = Credentials::from_env()?;
    let mut client = KrakenClient::new(Some(credentials))?;
    let count = client.load_markets().await?;
    info!(markets = count, "Kraken markets loaded");
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { strategy } => {
            let config = strategy.bot_config(&cli.database, "live")?;

            println!("\n=== Kraken Dip Bot ===");
            println!("Instruments: {}", config.trading.symbols.join(", "));
            println!("Polling interval: {}s", config.poll_interval_secs);
            println!("Risk per trade: {}%", config.trading.risk_fraction * Decimal::ONE_HUNDRED);
            println!("Mode: LIVE TRADING");
            println!("\nPress Ctrl+C to stop.\n");

            let client = live_client().await?;
            let mut bot = Bot::new(config, client).await?;
            bot.run().await?;
        }

        Commands::Paper {
            cash,
            fee,
            strategy,
        } => {
            if cash <= Decimal::ZERO {
                bail!("Initial cash must be positive");
            }
            if fee < Decimal::ZERO || fee >= Decimal::ONE {
                bail!("Fee rate must be between 0 and 1, got {}", fee);
            }
            let mut config = strategy.bot_config(&cli.database, "paper")?;
            // Entries are sized against the fee the paper wallet charges.
            config.trading.fee_rate = fee;
            let symbols = config.trading.symbols.clone();

            println!("\n=== Kraken Dip Bot (paper) ===");
            println!("Instruments: {}", symbols.join(", "));
            println!("Initial cash: ${}", cash);
            println!("Fee rate: {}%", fee * Decimal::ONE_HUNDRED);
            println!("\nPress Ctrl+C to stop.\n");

            let mut market = KrakenClient::new(None)?;
            market.load_markets().await?;
            let gateway = PaperGateway::new(
                market,
                PaperConfig {
                    initial_cash: cash,
                    fee_rate: fee,
                },
            );

            let mut bot = Bot::new(config, gateway).await?;
            bot.run().await?;

            let mut prices = HashMap::new();
            for symbol in &symbols {
                match bot.gateway().get_price(symbol).await {
                    Ok(Some(price)) => {
                        prices.insert(symbol.clone(), price);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(instrument = %symbol, error = %e, "No closing price"),
                }
            }
            println!("{}", bot.gateway().stats(&prices).await);
        }

        Commands::Reconcile { strategy } => {
            let config = strategy.bot_config(&cli.database, "live")?;
            let symbols = config.trading.symbols.clone();
            let client = live_client().await?;
            let bot = Bot::new(config, client).await?;

            let reconciled = bot.reconcile_all(&symbols).await?;

            println!(
                "\n{:<12} {:>16} {:>14} {:>14} {:>14}",
                "INSTRUMENT", "QTY", "AVG COST", "STOP", "TARGET"
            );
            println!("{}", "-".repeat(74));
            for symbol in &symbols {
                match reconciled.get(symbol) {
                    Some(Some(pos)) => println!(
                        "{:<12} {:>16} {:>14.4} {:>14.4} {:>14.4}",
                        symbol,
                        pos.quantity(),
                        pos.avg_cost(),
                        pos.stop_price(),
                        pos.target_price()
                    ),
                    Some(None) => println!("{:<12} {:>16}", symbol, "flat"),
                    None => println!("{:<12} {:>16}", symbol, "no price"),
                }
            }

            let state = CycleState::from_reconciled(reconciled);
            println!("\nOpen positions: {}", state.positions.len());
        }

        Commands::Sync => {
            let client = live_client().await?;
            let config = BotConfig {
                database_url: cli.database.clone(),
                ..BotConfig::default()
            };
            let bot = Bot::new(config, client).await?;

            let inserted = bot.sync_fills().await?;
            println!("Recorded {} new fills ({} total)", inserted, bot.db().fill_count().await?);
        }

        Commands::Config { strategy } => {
            let config = strategy.trading_config()?;

            println!("\n=== Trading Configuration ===\n");
            println!("Instruments:          {}", config.symbols.join(", "));
            println!("Polling Interval:     {}s", strategy.interval);

            println!("\nEntry:");
            println!("  Dip Threshold:      {}", config.dip_threshold);
            println!("  Trend Filter:       {:?}", config.trend_filter);
            println!("  Trend EMA:          {} x {}", config.ema_period, config.ema_granularity);
            println!("  Higher Timeframe:   {}", config.htf_granularity);
            println!("  Min Book Units:     {}", config.min_book_units);
            println!("  Depth Levels:       {} (alpha {})", config.depth_levels, config.depth_alpha);

            println!("\nExit:");
            println!("  ATR:                {} x {}", config.atr_period, config.atr_granularity);
            println!("  Take Profit:        {} x ATR", config.tp_mult);
            println!("  Stop Loss:          {} x ATR", config.sl_mult);
            println!("  Trailing Stop:      {}%", config.trail_pct * Decimal::ONE_HUNDRED);

            println!("\nRisk Management:");
            println!("  Risk per Trade:     {}%", config.risk_fraction * Decimal::ONE_HUNDRED);
            println!("  Max Open:           {}", config.max_open);
            println!("  Min Order:          ${}", config.min_order_notional);
            println!("  Fee Rate:           {}%", config.fee_rate * Decimal::ONE_HUNDRED);
            println!("  Dust Floor:         ${}", config.dust_floor);
            println!("  Reconcile Tol.:     {}", config.reconcile_tolerance);
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let stats = BotStats::load(&db).await?;
            println!("\n{}", stats);
        }
    }

    Ok(())
}
