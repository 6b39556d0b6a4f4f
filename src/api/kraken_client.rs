//! Kraken spot REST client.
//!
//! Public market data (`AssetPairs`, `Ticker`, `OHLC`, `Depth`) is fetched with
//! retry on transport failures. Private endpoints (`BalanceEx`,
//! `TradesHistory`, `AddOrder`) are signed with the account's API key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::models::{BookLevel, Candle, Fill, Granularity, InstrumentMeta, OrderBook, Side};

use super::auth::{sign_request, Credentials};
use super::gateway::{AssetBalance, MarketGateway, OrderAck, OrderRequest, OrderStatus};
use super::types::*;

const KRAKEN_API_BASE: &str = "https://api.kraken.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Kraken returns at most this many trades per `TradesHistory` page.
pub const TRADES_PAGE_SIZE: usize = 50;
pub const DEFAULT_MAX_HISTORY_PAGES: usize = 20;

/// `QueryOrders` attempts before a submitted order is reported as still open.
const ORDER_STATUS_POLLS: usize = 3;
const ORDER_STATUS_DELAY: Duration = Duration::from_millis(500);

/// Kraken asset codes that differ from their common names.
const ASSET_ALIASES: &[(&str, &str)] = &[("XBT", "BTC"), ("XDG", "DOGE")];

/// Map a Kraken asset code (`XXBT`, `ZUSD`, `SOL`) to its common name.
pub fn normalize_asset(code: &str) -> String {
    let stripped = if code.len() == 4 && (code.starts_with('X') || code.starts_with('Z')) {
        &code[1..]
    } else {
        code
    };
    ASSET_ALIASES
        .iter()
        .find(|(kraken, _)| *kraken == stripped)
        .map(|(_, common)| common.to_string())
        .unwrap_or_else(|| stripped.to_string())
}

/// Rewrite `XBT/USD` style symbols to `BTC/USD`.
pub fn canonical_symbol(symbol: &str) -> String {
    match symbol.split_once('/') {
        Some((base, quote)) => format!("{}/{}", normalize_asset(base), normalize_asset(quote)),
        None => symbol.to_string(),
    }
}

/// A tradable pair as listed by the exchange.
#[derive(Debug, Clone)]
struct MarketEntry {
    /// Key of the pair in Kraken responses, e.g. `XXBTZUSD`
    pair: String,
    /// Name accepted in requests, e.g. `XBTUSD`
    altname: String,
    meta: InstrumentMeta,
}

/// Kraken REST client implementing [`MarketGateway`].
pub struct KrakenClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    /// `BASE/QUOTE` symbol -> pair
    markets: HashMap<String, MarketEntry>,
    /// Any Kraken pair key or altname -> `BASE/QUOTE` symbol
    pair_symbols: HashMap<String, String>,
    max_history_pages: usize,
    last_nonce: AtomicU64,
}

impl KrakenClient {
    /// Create a client. Without credentials only public endpoints work.
    pub fn new(credentials: Option<Credentials>) -> Result<Self> {
        Self::with_base_url(KRAKEN_API_BASE.to_string(), credentials)
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String, credentials: Option<Credentials>) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url,
            credentials,
            markets: HashMap::new(),
            pair_symbols: HashMap::new(),
            max_history_pages: DEFAULT_MAX_HISTORY_PAGES,
            last_nonce: AtomicU64::new(0),
        })
    }

    /// Load the pair table. Must be called once before trading.
    pub async fn load_markets(&mut self) -> Result<usize> {
        let pairs: HashMap<String, AssetPairInfo> = self
            .public_get("AssetPairs", &[])
            .await
            .context("Failed to load asset pairs")?;

        self.markets.clear();
        self.pair_symbols.clear();

        for (pair, info) in pairs {
            // Dark-pool duplicates
            if pair.ends_with(".d") {
                continue;
            }
            let symbol = format!("{}/{}", normalize_asset(&info.base), normalize_asset(&info.quote));
            let meta = InstrumentMeta::new(info.ordermin.unwrap_or_default(), info.is_active());

            self.pair_symbols.insert(pair.clone(), symbol.clone());
            if !info.altname.is_empty() {
                self.pair_symbols.insert(info.altname.clone(), symbol.clone());
            }
            if let Some(ws) = &info.wsname {
                self.pair_symbols.insert(ws.clone(), symbol.clone());
            }
            self.markets.insert(
                symbol,
                MarketEntry {
                    pair,
                    altname: info.altname,
                    meta,
                },
            );
        }

        info!(count = self.markets.len(), "Loaded Kraken markets");
        Ok(self.markets.len())
    }

    fn market(&self, instrument: &str) -> Result<&MarketEntry, GatewayError> {
        self.markets
            .get(instrument)
            .or_else(|| self.markets.get(&canonical_symbol(instrument)))
            .ok_or_else(|| GatewayError::UnknownInstrument(instrument.to_string()))
    }

    /// Find the value for our pair in a result keyed by Kraken pair name.
    fn take_pair_entry<T>(
        &self,
        entry: &MarketEntry,
        mut result: HashMap<String, T>,
    ) -> Result<T, GatewayError> {
        result
            .remove(&entry.pair)
            .or_else(|| result.remove(&entry.altname))
            .ok_or_else(|| GatewayError::InvalidResponse(format!("no data for {}", entry.pair)))
    }

    fn next_nonce(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        // Strictly increasing even for calls within the same millisecond.
        let mut prev = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_nonce
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let url = format!("{}/0/public/{}", self.base_url, method);
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        debug!(url = %url, "Kraken public request");

        let http = &self.http;
        let url = url.as_str();
        backoff::future::retry(backoff, || async move {
            let response = http
                .get(url)
                .query(params)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(GatewayError::from(e)))?;

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(backoff::Error::transient(GatewayError::Http(format!(
                    "{} returned {}",
                    method, status
                ))));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(GatewayError::Http(format!(
                    "{} returned {} - {}",
                    method, status, body
                ))));
            }

            let parsed: KrakenResponse<T> = response.json().await.map_err(|e| {
                backoff::Error::permanent(GatewayError::InvalidResponse(e.to_string()))
            })?;
            parsed.into_result().map_err(backoff::Error::permanent)
        })
        .await
    }

    async fn private_post<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            GatewayError::Authentication("KRAKEN_API_KEY / KRAKEN_API_SECRET not set".to_string())
        })?;

        let path = format!("/0/private/{}", method);
        let nonce = self.next_nonce();

        // The serializer is not Send and must be gone before the first await.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("nonce", &nonce.to_string());
            for (key, value) in params {
                form.append_pair(key, value);
            }
            form.finish()
        };

        let signature = sign_request(&creds.api_secret, &path, nonce, &body)?;

        debug!(method, "Kraken private request");

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("API-Key", &creds.api_key)
            .header("API-Sign", signature)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Http(format!("{} returned {} - {}", method, status, text)));
        }

        let parsed: KrakenResponse<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        parsed.into_result()
    }

    fn to_fill(&self, txid: String, trade: TradeInfo) -> Option<Fill> {
        let side = Side::parse(&trade.side)?;
        let instrument = self
            .pair_symbols
            .get(&trade.pair)
            .cloned()
            .unwrap_or_else(|| trade.pair.clone());
        let timestamp = timestamp_from_secs(trade.time);
        // Older accounts lack trade_id; fall back to the timestamp in microseconds.
        let id = trade
            .trade_id
            .unwrap_or_else(|| timestamp.timestamp_micros().max(0) as u64);

        Some(Fill {
            id,
            txid,
            timestamp,
            instrument,
            side,
            quantity: trade.vol,
            price: trade.price,
            cost: trade.cost,
            fee: trade.fee,
        })
    }

    async fn trades_page(&self, offset: usize) -> Result<TradesHistoryResult, GatewayError> {
        self.private_post("TradesHistory", &[("ofs", offset.to_string())])
            .await
    }

    async fn query_order(&self, txid: &str) -> Result<OrderInfo, GatewayError> {
        let mut orders: HashMap<String, OrderInfo> = self
            .private_post("QueryOrders", &[("txid", txid.to_string())])
            .await?;
        orders
            .remove(txid)
            .ok_or_else(|| GatewayError::InvalidResponse(format!("QueryOrders: no entry for {}", txid)))
    }

    /// Poll a freshly submitted order until it leaves the open state.
    async fn settle_status(&self, txid: &str) -> OrderStatus {
        for attempt in 1..=ORDER_STATUS_POLLS {
            match self.query_order(txid).await {
                Ok(info) => {
                    let status = info.order_status();
                    debug!(txid, attempt, status = %info.status, filled = %info.vol_exec, "Order status");
                    if status != OrderStatus::Open {
                        return status;
                    }
                }
                Err(e) => warn!(txid, attempt, error = %e, "Order status query failed"),
            }
            if attempt < ORDER_STATUS_POLLS {
                tokio::time::sleep(ORDER_STATUS_DELAY).await;
            }
        }
        OrderStatus::Open
    }
}

fn timestamp_from_secs(secs: f64) -> DateTime<Utc> {
    let millis = (secs * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl MarketGateway for KrakenClient {
    async fn get_price(&self, instrument: &str) -> Result<Option<Decimal>, GatewayError> {
        // Unlisted pairs have no quote.
        let Ok(entry) = self.market(instrument) else {
            return Ok(None);
        };
        let result: HashMap<String, TickerInfo> = self
            .public_get("Ticker", &[("pair", entry.altname.clone())])
            .await?;
        let ticker = self.take_pair_entry(entry, result)?;

        Ok(ticker
            .c
            .first()
            .copied()
            .filter(|p| *p > Decimal::ZERO))
    }

    async fn get_ohlc(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let entry = self.market(instrument)?;
        let mut result: HashMap<String, serde_json::Value> = self
            .public_get(
                "OHLC",
                &[
                    ("pair", entry.altname.clone()),
                    ("interval", granularity.minutes().to_string()),
                ],
            )
            .await?;
        result.remove("last");

        let rows = self.take_pair_entry(entry, result)?;
        let rows: Vec<OhlcRow> = serde_json::from_value(rows)
            .map_err(|e| GatewayError::InvalidResponse(format!("OHLC: {}", e)))?;

        let skip = rows.len().saturating_sub(count);
        Ok(rows
            .into_iter()
            .skip(skip)
            .map(|r| Candle {
                open_time: Utc.timestamp_opt(r.0, 0).single().unwrap_or_else(Utc::now),
                open: r.1,
                high: r.2,
                low: r.3,
                close: r.4,
                volume: r.6,
            })
            .collect())
    }

    async fn get_order_book(&self, instrument: &str, depth: usize)
        -> Result<OrderBook, GatewayError>
    {
        let entry = self.market(instrument)?;
        let result: HashMap<String, DepthInfo> = self
            .public_get(
                "Depth",
                &[("pair", entry.altname.clone()), ("count", depth.to_string())],
            )
            .await?;
        let book = self.take_pair_entry(entry, result)?;

        let level = |l: &DepthLevel| BookLevel {
            price: l.0,
            quantity: l.1,
        };
        Ok(OrderBook {
            bids: book.bids.iter().take(depth).map(level).collect(),
            asks: book.asks.iter().take(depth).map(level).collect(),
        })
    }

    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, GatewayError> {
        let raw: HashMap<String, BalanceExEntry> = self.private_post("BalanceEx", &[]).await?;

        let mut balances: HashMap<String, AssetBalance> = HashMap::new();
        for (code, entry) in raw {
            let asset = normalize_asset(&code);
            let slot = balances.entry(asset).or_default();
            slot.total += entry.balance;
            slot.free += (entry.balance - entry.hold_trade).max(Decimal::ZERO);
        }
        Ok(balances)
    }

    async fn get_trade_history(&self, instrument: &str) -> Result<Vec<Fill>, GatewayError> {
        let symbol = canonical_symbol(instrument);
        let mut fills = Vec::new();
        let mut offset = 0;

        for page_num in 1..=self.max_history_pages {
            let page = self.trades_page(offset).await?;
            let page_len = page.trades.len();
            debug!(instrument, page = page_num, offset, trades = page_len, "Fetched trade page");

            offset += page_len;
            fills.extend(
                page.trades
                    .into_iter()
                    .filter_map(|(txid, t)| self.to_fill(txid, t))
                    .filter(|f| f.instrument == symbol),
            );

            if page_len < TRADES_PAGE_SIZE {
                break;
            }
            if page_num == self.max_history_pages {
                warn!(
                    instrument,
                    pages = page_num,
                    "Trade history page cap reached; older fills ignored"
                );
            }
        }

        fills.sort_by(|a, b| a.id.cmp(&b.id).then(a.timestamp.cmp(&b.timestamp)));
        Ok(fills)
    }

    async fn recent_fills(&self, limit: usize) -> Result<Vec<Fill>, GatewayError> {
        let page = self.trades_page(0).await?;
        let mut fills: Vec<Fill> = page
            .trades
            .into_iter()
            .filter_map(|(txid, t)| self.to_fill(txid, t))
            .collect();
        fills.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        fills.truncate(limit);
        Ok(fills)
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError> {
        let entry = self.market(&order.instrument)?;
        let params = [
            ("pair", entry.altname.clone()),
            ("type", order.side.as_str().to_string()),
            ("ordertype", "market".to_string()),
            ("volume", order.quantity.normalize().to_string()),
            ("cl_ord_id", uuid::Uuid::new_v4().to_string()),
        ];

        let result: AddOrderResult = self.private_post("AddOrder", &params).await?;
        let id = result
            .txid
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::InvalidResponse("AddOrder returned no txid".to_string()))?;

        info!(
            instrument = %order.instrument,
            side = %order.side,
            qty = %order.quantity,
            txid = %id,
            "Order accepted"
        );

        let status = self.settle_status(&id).await;
        Ok(OrderAck { id, status })
    }

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMeta, GatewayError> {
        Ok(self.market(instrument)?.meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_asset() {
        assert_eq!(normalize_asset("XXBT"), "BTC");
        assert_eq!(normalize_asset("ZUSD"), "USD");
        assert_eq!(normalize_asset("XXDG"), "DOGE");
        assert_eq!(normalize_asset("XETH"), "ETH");
        assert_eq!(normalize_asset("SOL"), "SOL");
        assert_eq!(normalize_asset("XBT"), "BTC");
    }

    #[test]
    fn test_canonical_symbol() {
        assert_eq!(canonical_symbol("XBT/USD"), "BTC/USD");
        assert_eq!(canonical_symbol("XDG/USD"), "DOGE/USD");
        assert_eq!(canonical_symbol("SOL/USD"), "SOL/USD");
    }

    #[test]
    fn test_nonce_strictly_increasing() {
        let client = KrakenClient::new(None).unwrap();
        let a = client.next_nonce();
        let b = client.next_nonce();
        let c = client.next_nonce();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_unknown_instrument() {
        let client = KrakenClient::new(None).unwrap();
        assert!(matches!(
            client.market("SOL/USD"),
            Err(GatewayError::UnknownInstrument(_))
        ));
    }

    #[tokio::test]
    async fn test_unlisted_instrument_has_no_price() {
        // No markets loaded and an unroutable base URL: must not reach the network.
        let client = KrakenClient::with_base_url("http://127.0.0.1:9".to_string(), None).unwrap();
        assert_eq!(client.get_price("GHIBLI/USD").await.unwrap(), None);
        assert!(matches!(
            client.instrument_metadata("GHIBLI/USD").await,
            Err(GatewayError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn test_private_request_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let client = KrakenClient::new(None).unwrap();
        let balance = client.get_balance();
        assert_send(&balance);
        let order = client.submit_order(OrderRequest {
            instrument: "SOL/USD".to_string(),
            side: Side::Buy,
            quantity: Decimal::ONE,
        });
        assert_send(&order);
        let status = client.settle_status("OQCLML-BW3P3-BUCMWZ");
        assert_send(&status);
    }

    #[tokio::test]
    async fn test_private_call_requires_credentials() {
        let client = KrakenClient::new(None).unwrap();
        let result = client.get_balance().await;
        assert!(matches!(result, Err(GatewayError::Authentication(_))));
    }
}
