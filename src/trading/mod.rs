//! Trading logic: indicators, reconciliation, sizing and the decision engine.

mod config;
pub mod indicators;
mod position_sizer;
mod reconciler;
mod strategy;

pub use config::{EntryTrendFilter, TradingConfig};
pub use indicators::IndicatorEngine;
pub use position_sizer::{clamp_to_cash, round_to_lot, size, PositionSizer};
pub use reconciler::{fifo_replay, Inventory, Lot, Reconciler};
pub use strategy::{
    join_reasons, Decision, DecisionEngine, EntryContext, EntrySnapshot, SkipReason,
};
