//! Data models for fills, positions, market data and trade actions.

mod action;
mod fill;
mod instrument;
mod market;
mod position;

pub use action::{ActionTag, TradeAction};
pub use fill::{Fill, Side};
pub use instrument::{base_asset, quote_asset, InstrumentMeta, DEFAULT_LOT_STEP};
pub use market::{BookLevel, Candle, Granularity, OrderBook};
pub use position::Position;
