//! Dip-buying decision engine.
//!
//! Each instrument is either FLAT (no position) or OPEN. Per cycle:
//! - FLAT instruments are checked against the entry filters (dip since last
//!   cycle, trend, book depth, cash) and sized by fractional risk
//! - OPEN instruments ratchet their trailing stop and exit on target or stop
//!
//! The engine is pure: the bot gathers market data, the engine proposes at
//! most one action per instrument, and state only changes once the exchange
//! confirms the order.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ActionTag, Position, TradeAction};

use super::config::EntryTrendFilter;
use super::{PositionSizer, TradingConfig};

/// Why an instrument produced no action this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    NoPrice,
    Inactive,
    NoTrendData,
    NoBook,
    MaxOpenReached,
    NoDip,
    AboveTrend,
    BelowTrend,
    ThinBook,
    CashBelowMin,
    QtyBelowMinLot,
    NoExitSignal,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoPrice => "no-price",
            SkipReason::Inactive => "inactive",
            SkipReason::NoTrendData => "no-trend-data",
            SkipReason::NoBook => "no-book",
            SkipReason::MaxOpenReached => "max-open-reached",
            SkipReason::NoDip => "no-dip",
            SkipReason::AboveTrend => "above-trend",
            SkipReason::BelowTrend => "below-trend",
            SkipReason::ThinBook => "thin-book",
            SkipReason::CashBelowMin => "cash<min",
            SkipReason::QtyBelowMinLot => "qty<minlot",
            SkipReason::NoExitSignal => "no-exit-signal",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a reason list as `a, b, c`.
pub fn join_reasons(reasons: &[SkipReason]) -> String {
    reasons
        .iter()
        .map(SkipReason::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Market observations of a FLAT instrument.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub instrument: String,
    pub price: Decimal,
    /// Price observed in the previous cycle
    pub last_price: Option<Decimal>,
    /// Reference EMA for the configured trend filter
    pub trend: Decimal,
    /// ATR, zero when unknown
    pub volatility: Decimal,
    /// Smoothed book depth in base units
    pub depth: Decimal,
    pub lot_step: Decimal,
}

/// Portfolio state an entry is sized against.
#[derive(Debug, Clone, Copy)]
pub struct EntryContext {
    pub equity: Decimal,
    /// Cash not yet committed to earlier proposals this cycle
    pub cash: Decimal,
    /// Open positions plus entries already proposed this cycle
    pub open_count: usize,
}

/// Outcome of evaluating one instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Act(TradeAction),
    Skip(Vec<SkipReason>),
}

impl Decision {
    fn skip(reason: SkipReason) -> Self {
        Decision::Skip(vec![reason])
    }

    pub fn action(&self) -> Option<&TradeAction> {
        match self {
            Decision::Act(action) => Some(action),
            Decision::Skip(_) => None,
        }
    }

    pub fn reasons(&self) -> &[SkipReason] {
        match self {
            Decision::Act(_) => &[],
            Decision::Skip(reasons) => reasons,
        }
    }
}

/// Per-instrument FLAT/OPEN state machine.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: TradingConfig,
    sizer: PositionSizer,
}

impl DecisionEngine {
    pub fn new(config: TradingConfig) -> Self {
        let sizer = PositionSizer::from_config(&config);
        Self { config, sizer }
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    /// Whether another position may be opened.
    pub fn can_open(&self, open_count: usize) -> bool {
        open_count < self.config.max_open
    }

    // ==================== Entry ====================

    /// Check every entry filter, reporting all failures together, and size
    /// the entry when they pass.
    pub fn evaluate_entry(&self, snap: &EntrySnapshot, ctx: &EntryContext) -> Decision {
        if !self.can_open(ctx.open_count) {
            return Decision::skip(SkipReason::MaxOpenReached);
        }

        let reasons = self.entry_filters(snap, ctx);
        if !reasons.is_empty() {
            debug!(instrument = %snap.instrument, reasons = %join_reasons(&reasons), "Entry filtered");
            return Decision::Skip(reasons);
        }

        let price = snap.price;
        let stop = price - snap.volatility * self.config.sl_mult;
        let target = price + snap.volatility * self.config.tp_mult;
        let qty = self
            .sizer
            .entry_quantity(price, stop, ctx.equity, ctx.cash, snap.lot_step);

        if qty.is_zero() || qty < snap.lot_step {
            debug!(instrument = %snap.instrument, qty = %qty, lot = %snap.lot_step, "Entry below min lot");
            return Decision::skip(SkipReason::QtyBelowMinLot);
        }

        Decision::Act(TradeAction::entry(
            snap.instrument.clone(),
            qty,
            price,
            stop,
            target,
        ))
    }

    fn entry_filters(&self, snap: &EntrySnapshot, ctx: &EntryContext) -> Vec<SkipReason> {
        let mut reasons = Vec::new();
        let price = snap.price;

        let dipped = snap
            .last_price
            .map(|last| price <= last * self.config.dip_threshold)
            .unwrap_or(false);
        if !dipped {
            reasons.push(SkipReason::NoDip);
        }

        match self.config.trend_filter {
            EntryTrendFilter::BelowTrend if price >= snap.trend => {
                reasons.push(SkipReason::AboveTrend)
            }
            EntryTrendFilter::AboveHigherTimeframe if price <= snap.trend => {
                reasons.push(SkipReason::BelowTrend)
            }
            _ => {}
        }

        if snap.depth < self.config.min_book_units {
            reasons.push(SkipReason::ThinBook);
        }

        if ctx.cash < snap.lot_step * price {
            reasons.push(SkipReason::CashBelowMin);
        }

        reasons
    }

    // ==================== Exit ====================

    /// Update the peak and trailing stop, then check target and stop.
    ///
    /// `position` and `peak` are updated in place; the stop never decreases
    /// and does not trail until the peak exceeds the entry cost.
    pub fn evaluate_exit(
        &self,
        instrument: &str,
        price: Decimal,
        position: &mut Position,
        peak: &mut Decimal,
    ) -> Decision {
        *peak = (*peak).max(price);

        // Trail only once the position has traded above its entry.
        if *peak > position.avg_cost() {
            let trailed = *peak * (Decimal::ONE - self.config.trail_pct);
            if position.ratchet_stop(trailed) {
                debug!(instrument, stop = %position.stop_price(), peak = %peak, "Trailing stop raised");
            }
        }

        let tag = if price >= position.target_price() {
            ActionTag::TakeProfit
        } else if price <= position.stop_price() {
            ActionTag::StopLoss
        } else {
            return Decision::skip(SkipReason::NoExitSignal);
        };

        Decision::Act(TradeAction::exit(instrument, position.quantity(), price, tag))
    }
}
