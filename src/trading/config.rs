//! Trading configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Granularity;

/// Which trend condition an entry must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryTrendFilter {
    /// Contrarian: buy only while price is below its trend EMA
    #[default]
    BelowTrend,
    /// Momentum: buy only while price is above a higher-timeframe EMA
    AboveHigherTimeframe,
}

impl EntryTrendFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "below_trend" | "below" => Some(Self::BelowTrend),
            "above_higher_timeframe" | "above_htf" | "above" => Some(Self::AboveHigherTimeframe),
            _ => None,
        }
    }
}

/// Strategy constants for the dip buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instruments to trade, `BASE/QUOTE`
    pub symbols: Vec<String>,

    /// Enter when price ≤ previous cycle's price × this
    pub dip_threshold: Decimal,

    /// Trend EMA length in bars
    pub ema_period: usize,

    /// Trend EMA bar size
    pub ema_granularity: Granularity,

    /// Bar size of the higher-timeframe EMA (momentum filter only)
    pub htf_granularity: Granularity,

    /// Volatility (ATR) length in bar pairs
    pub atr_period: usize,

    /// ATR bar size
    pub atr_granularity: Granularity,

    /// Take-profit distance in ATRs
    pub tp_mult: Decimal,

    /// Stop-loss distance in ATRs
    pub sl_mult: Decimal,

    /// Trailing stop distance below the peak (0.0 to 1.0)
    pub trail_pct: Decimal,

    /// Fraction of equity risked per trade
    pub risk_fraction: Decimal,

    /// Maximum simultaneously open positions
    pub max_open: usize,

    /// Positions worth less than this (USD) are ignored
    pub dust_floor: Decimal,

    /// Minimum smoothed book depth (base units) to enter
    pub min_book_units: Decimal,

    /// Book levels per side summed for depth
    pub depth_levels: usize,

    /// Smoothing factor of the depth EMA
    pub depth_alpha: Decimal,

    /// Fee charged on each fill (0.0026 = 0.26%)
    pub fee_rate: Decimal,

    /// Lower bound of the entry ticket size (USD)
    pub min_order_notional: Decimal,

    /// Wallet vs. history quantity tolerance
    pub reconcile_tolerance: Decimal,

    /// Which trend condition gates entries
    pub trend_filter: EntryTrendFilter,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "SOL/USD".to_string(),
                "ETH/USD".to_string(),
                "BTC/USD".to_string(),
                "XRP/USD".to_string(),
                "DOGE/USD".to_string(),
                "TIA/USD".to_string(),
            ],
            dip_threshold: dec!(0.98),          // 2% drop since last cycle
            ema_period: 20,
            ema_granularity: Granularity::OneHour,
            htf_granularity: Granularity::FourHours,
            atr_period: 14,
            atr_granularity: Granularity::OneMinute,
            tp_mult: dec!(3.0),
            sl_mult: dec!(1.5),
            trail_pct: dec!(0.01),              // 1% below peak
            risk_fraction: dec!(0.02),          // 2% of equity
            max_open: 2,
            dust_floor: dec!(10),               // $10
            min_book_units: dec!(50),
            depth_levels: 5,
            depth_alpha: dec!(0.2),
            fee_rate: dec!(0.0026),             // Kraken taker
            min_order_notional: dec!(5),        // $5
            reconcile_tolerance: dec!(0.00000001),
            trend_filter: EntryTrendFilter::BelowTrend,
        }
    }
}
