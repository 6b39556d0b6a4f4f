//! Kraken REST response shapes.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::GatewayError;

use super::gateway::OrderStatus;

/// Envelope wrapping every Kraken REST response.
#[derive(Debug, Clone, Deserialize)]
pub struct KrakenResponse<T> {
    #[serde(default)]
    pub error: Vec<String>,
    pub result: Option<T>,
}

impl<T> KrakenResponse<T> {
    /// Unwrap the result, mapping exchange error strings to typed errors.
    pub fn into_result(self) -> Result<T, GatewayError> {
        if !self.error.is_empty() {
            return Err(map_kraken_error(&self.error));
        }
        self.result
            .ok_or_else(|| GatewayError::InvalidResponse("missing result".to_string()))
    }
}

/// Map Kraken's `Category:Message` error strings onto [`GatewayError`].
pub fn map_kraken_error(errors: &[String]) -> GatewayError {
    let joined = errors.join("; ");

    if errors.iter().any(|e| e.starts_with("EOrder:Insufficient funds")) {
        GatewayError::InsufficientFunds(joined)
    } else if errors.iter().any(|e| e.starts_with("EQuery:Unknown asset pair")) {
        GatewayError::UnknownInstrument(joined)
    } else if errors
        .iter()
        .any(|e| e.starts_with("EAPI:Invalid key") || e.starts_with("EAPI:Invalid signature") || e.starts_with("EAPI:Invalid nonce"))
    {
        GatewayError::Authentication(joined)
    } else if errors
        .iter()
        .any(|e| e.starts_with("EOrder:") || e.starts_with("EGeneral:"))
    {
        GatewayError::Rejected(joined)
    } else {
        GatewayError::Exchange(joined)
    }
}

/// One entry of `/0/public/AssetPairs`.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPairInfo {
    #[serde(default)]
    pub altname: String,
    pub wsname: Option<String>,
    pub base: String,
    pub quote: String,
    pub ordermin: Option<Decimal>,
    /// `online`, `cancel_only`, `post_only`, `limit_only`, `reduce_only`
    pub status: Option<String>,
}

impl AssetPairInfo {
    pub fn is_active(&self) -> bool {
        match self.status.as_deref() {
            None => true,
            Some(s) => s == "online" || s == "post_only" || s == "limit_only",
        }
    }
}

/// One entry of `/0/public/Ticker`. Only the last-trade field is used.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerInfo {
    /// `[price, lot volume]`
    #[serde(default)]
    pub c: Vec<Decimal>,
}

/// `[time, open, high, low, close, vwap, volume, count]`
#[derive(Debug, Clone, Deserialize)]
pub struct OhlcRow(
    pub i64,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub Decimal,
    pub u64,
);

/// `[price, volume, timestamp]`
#[derive(Debug, Clone, Deserialize)]
pub struct DepthLevel(pub Decimal, pub Decimal, pub serde_json::Value);

#[derive(Debug, Clone, Deserialize)]
pub struct DepthInfo {
    #[serde(default)]
    pub asks: Vec<DepthLevel>,
    #[serde(default)]
    pub bids: Vec<DepthLevel>,
}

/// One entry of `/0/private/BalanceEx`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceExEntry {
    pub balance: Decimal,
    #[serde(default)]
    pub hold_trade: Decimal,
}

/// One trade of `/0/private/TradesHistory`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeInfo {
    pub pair: String,
    pub time: f64,
    #[serde(rename = "type")]
    pub side: String,
    pub price: Decimal,
    #[serde(default)]
    pub cost: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    pub vol: Decimal,
    pub trade_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradesHistoryResult {
    #[serde(default)]
    pub trades: HashMap<String, TradeInfo>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddOrderResult {
    #[serde(default)]
    pub txid: Vec<String>,
}

/// One entry of a `QueryOrders` result.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderInfo {
    pub status: String,
    #[serde(default)]
    pub vol_exec: Decimal,
}

impl OrderInfo {
    pub fn order_status(&self) -> OrderStatus {
        match self.status.as_str() {
            "closed" => OrderStatus::Filled,
            "canceled" | "expired" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        }
    }
}
