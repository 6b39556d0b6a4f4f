//! In-memory gateway for unit tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::api::{AssetBalance, MarketGateway, OrderAck, OrderRequest, OrderStatus};
use crate::error::GatewayError;
use crate::models::{Candle, Fill, Granularity, InstrumentMeta, OrderBook, DEFAULT_LOT_STEP};

#[derive(Default)]
struct State {
    prices: HashMap<String, Decimal>,
    candles: HashMap<(String, Granularity), Vec<Candle>>,
    books: HashMap<String, OrderBook>,
    balances: HashMap<String, AssetBalance>,
    fills: HashMap<String, Vec<Fill>>,
    meta: HashMap<String, InstrumentMeta>,
    orders: Vec<OrderRequest>,
    reject_orders: bool,
    order_status: Option<OrderStatus>,
    /// Instruments the exchange does not list
    unlisted: Vec<String>,
}

/// Serves canned market data and records submitted orders.
#[derive(Default)]
pub struct StaticGateway {
    state: Mutex<State>,
}

impl StaticGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, instrument: &str, price: Decimal) -> Self {
        self.set_price(instrument, price);
        self
    }

    pub fn with_candles(self, instrument: &str, granularity: Granularity, candles: Vec<Candle>) -> Self {
        self.state
            .lock()
            .unwrap()
            .candles
            .insert((instrument.to_string(), granularity), candles);
        self
    }

    pub fn with_book(self, instrument: &str, book: OrderBook) -> Self {
        self.state.lock().unwrap().books.insert(instrument.to_string(), book);
        self
    }

    pub fn with_balance(self, asset: &str, free: Decimal, total: Decimal) -> Self {
        self.set_balance(asset, free, total);
        self
    }

    pub fn with_fills(self, instrument: &str, fills: Vec<Fill>) -> Self {
        self.state.lock().unwrap().fills.insert(instrument.to_string(), fills);
        self
    }

    pub fn with_meta(self, instrument: &str, meta: InstrumentMeta) -> Self {
        self.state.lock().unwrap().meta.insert(instrument.to_string(), meta);
        self
    }

    pub fn set_price(&self, instrument: &str, price: Decimal) {
        self.state.lock().unwrap().prices.insert(instrument.to_string(), price);
    }

    pub fn set_balance(&self, asset: &str, free: Decimal, total: Decimal) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(asset.to_string(), AssetBalance { free, total });
    }

    /// Treat `instrument` as unknown to the exchange.
    pub fn with_unlisted(self, instrument: &str) -> Self {
        self.state.lock().unwrap().unlisted.push(instrument.to_string());
        self
    }

    /// Status reported for accepted orders (`Filled` unless set).
    pub fn set_order_status(&self, status: OrderStatus) {
        self.state.lock().unwrap().order_status = Some(status);
    }

    /// Make every subsequent order fail with `InsufficientFunds`.
    pub fn reject_orders(&self, reject: bool) {
        self.state.lock().unwrap().reject_orders = reject;
    }

    pub fn orders(&self) -> Vec<OrderRequest> {
        self.state.lock().unwrap().orders.clone()
    }
}

#[async_trait]
impl MarketGateway for StaticGateway {
    async fn get_price(&self, instrument: &str) -> Result<Option<Decimal>, GatewayError> {
        Ok(self.state.lock().unwrap().prices.get(instrument).copied())
    }

    async fn get_ohlc(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let state = self.state.lock().unwrap();
        let candles = state
            .candles
            .get(&(instrument.to_string(), granularity))
            .cloned()
            .unwrap_or_default();
        let skip = candles.len().saturating_sub(count);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn get_order_book(&self, instrument: &str, depth: usize)
        -> Result<OrderBook, GatewayError>
    {
        let state = self.state.lock().unwrap();
        let book = state.books.get(instrument).cloned().unwrap_or_default();
        Ok(OrderBook {
            bids: book.bids.into_iter().take(depth).collect(),
            asks: book.asks.into_iter().take(depth).collect(),
        })
    }

    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, GatewayError> {
        Ok(self.state.lock().unwrap().balances.clone())
    }

    async fn get_trade_history(&self, instrument: &str) -> Result<Vec<Fill>, GatewayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .fills
            .get(instrument)
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_fills(&self, limit: usize) -> Result<Vec<Fill>, GatewayError> {
        let state = self.state.lock().unwrap();
        let mut all: Vec<Fill> = state.fills.values().flatten().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        Ok(all)
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError> {
        let mut state = self.state.lock().unwrap();
        if state.reject_orders {
            return Err(GatewayError::InsufficientFunds("rejected by test".to_string()));
        }
        if state.unlisted.contains(&order.instrument) {
            return Err(GatewayError::UnknownInstrument(order.instrument));
        }
        state.orders.push(order);
        Ok(OrderAck {
            id: format!("O{}", state.orders.len()),
            status: state.order_status.unwrap_or(OrderStatus::Filled),
        })
    }

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMeta, GatewayError> {
        let state = self.state.lock().unwrap();
        if state.unlisted.iter().any(|u| u == instrument) {
            return Err(GatewayError::UnknownInstrument(instrument.to_string()));
        }
        Ok(state
            .meta
            .get(instrument)
            .copied()
            .unwrap_or_else(|| InstrumentMeta::new(DEFAULT_LOT_STEP, true)))
    }
}
