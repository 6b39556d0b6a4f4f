//! Exchange-agnostic market gateway used by the bot.
//!
//! Everything the decision core needs from an exchange goes through
//! [`MarketGateway`]. Live trading uses [`KrakenClient`](super::KrakenClient),
//! paper trading wraps it in [`PaperGateway`](super::PaperGateway).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GatewayError;
use crate::models::{Candle, Fill, Granularity, InstrumentMeta, OrderBook, Side};

/// Wallet balance for one asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    /// Available for new orders
    pub free: Decimal,
    /// Including amounts held by open orders
    pub total: Decimal,
}

/// Market order submission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
}

/// Exchange-reported order state after submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Accepted but not yet executed
    Open,
    Filled,
    /// Canceled or expired without executing
    Rejected,
}

impl OrderStatus {
    /// Only executed orders may change tracked positions.
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// Acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: OrderStatus,
}

/// Market data, wallet and order routing for one exchange account.
#[async_trait]
pub trait MarketGateway: Send + Sync {
    /// Last traded price, `None` when the exchange has no quote.
    async fn get_price(&self, instrument: &str) -> Result<Option<Decimal>, GatewayError>;

    /// Up to `count` most recent bars, oldest first.
    async fn get_ohlc(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    /// Top `depth` levels of each side of the book.
    async fn get_order_book(&self, instrument: &str, depth: usize)
        -> Result<OrderBook, GatewayError>;

    /// Wallet balances keyed by common asset name (`USD`, `BTC`, ...).
    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, GatewayError>;

    /// Full trade history for one instrument, ordered by id.
    async fn get_trade_history(&self, instrument: &str) -> Result<Vec<Fill>, GatewayError>;

    /// Most recent account fills across all instruments, newest first.
    async fn recent_fills(&self, limit: usize) -> Result<Vec<Fill>, GatewayError>;

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMeta, GatewayError>;
}
