//! Paper trading gateway: live market data, simulated wallet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::GatewayError;
use crate::models::{base_asset, quote_asset, Candle, Fill, Granularity, InstrumentMeta, OrderBook, Side};

use super::gateway::{AssetBalance, MarketGateway, OrderAck, OrderRequest, OrderStatus};

/// Paper trading configuration.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Starting quote-currency cash
    pub initial_cash: Decimal,

    /// Simulated fee rate charged on every fill
    pub fee_rate: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: dec!(10000),
            fee_rate: dec!(0.0026), // Kraken taker tier 0
        }
    }
}

#[derive(Debug, Default)]
struct PaperWallet {
    cash: Decimal,
    holdings: HashMap<String, Decimal>,
    fills: Vec<Fill>,
    total_fees: Decimal,
    next_id: u64,
}

/// Wraps a real gateway for market data and simulates order execution.
///
/// Market orders fill immediately and completely at the last traded price.
pub struct PaperGateway<G> {
    inner: G,
    config: PaperConfig,
    wallet: RwLock<PaperWallet>,
    started_at: DateTime<Utc>,
}

impl<G: MarketGateway> PaperGateway<G> {
    pub fn new(inner: G, config: PaperConfig) -> Self {
        let wallet = PaperWallet {
            cash: config.initial_cash,
            next_id: 1,
            ..Default::default()
        };
        Self {
            inner,
            config,
            wallet: RwLock::new(wallet),
            started_at: Utc::now(),
        }
    }

    /// Current statistics, marking holdings at `prices` (keyed by instrument).
    pub async fn stats(&self, prices: &HashMap<String, Decimal>) -> PaperStats {
        let wallet = self.wallet.read().await;
        let holdings_value: Decimal = prices
            .iter()
            .map(|(instrument, price)| {
                wallet
                    .holdings
                    .get(base_asset(instrument))
                    .copied()
                    .unwrap_or_default()
                    * *price
            })
            .sum();
        let equity = wallet.cash + holdings_value;
        let return_pct = if self.config.initial_cash > Decimal::ZERO {
            (equity - self.config.initial_cash) / self.config.initial_cash
        } else {
            Decimal::ZERO
        };

        PaperStats {
            initial_cash: self.config.initial_cash,
            current_equity: equity,
            cash_available: wallet.cash,
            return_pct,
            fills: wallet.fills.len(),
            total_fees: wallet.total_fees,
            running_since: self.started_at,
        }
    }
}

#[async_trait]
impl<G: MarketGateway> MarketGateway for PaperGateway<G> {
    async fn get_price(&self, instrument: &str) -> Result<Option<Decimal>, GatewayError> {
        self.inner.get_price(instrument).await
    }

    async fn get_ohlc(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.inner.get_ohlc(instrument, granularity, count).await
    }

    async fn get_order_book(&self, instrument: &str, depth: usize)
        -> Result<OrderBook, GatewayError>
    {
        self.inner.get_order_book(instrument, depth).await
    }

    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, GatewayError> {
        let wallet = self.wallet.read().await;
        let mut balances: HashMap<String, AssetBalance> = wallet
            .holdings
            .iter()
            .map(|(asset, qty)| {
                (
                    asset.clone(),
                    AssetBalance {
                        free: *qty,
                        total: *qty,
                    },
                )
            })
            .collect();
        balances.insert(
            "USD".to_string(),
            AssetBalance {
                free: wallet.cash,
                total: wallet.cash,
            },
        );
        Ok(balances)
    }

    async fn get_trade_history(&self, instrument: &str) -> Result<Vec<Fill>, GatewayError> {
        let wallet = self.wallet.read().await;
        Ok(wallet
            .fills
            .iter()
            .filter(|f| f.instrument == instrument)
            .cloned()
            .collect())
    }

    async fn recent_fills(&self, limit: usize) -> Result<Vec<Fill>, GatewayError> {
        let wallet = self.wallet.read().await;
        Ok(wallet.fills.iter().rev().take(limit).cloned().collect())
    }

    async fn submit_order(&self, order: OrderRequest) -> Result<OrderAck, GatewayError> {
        // Market orders fill at the current quote.
        let price = self
            .inner
            .get_price(&order.instrument)
            .await?
            .ok_or_else(|| GatewayError::Rejected(format!("no price for {}", order.instrument)))?;
        if order.quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(GatewayError::Rejected(format!(
                "invalid order {} @ {}",
                order.quantity, price
            )));
        }
        if quote_asset(&order.instrument) != "USD" {
            return Err(GatewayError::Rejected(format!(
                "paper wallet only holds USD, cannot trade {}",
                order.instrument
            )));
        }

        let base = base_asset(&order.instrument).to_string();
        let cost = order.quantity * price;
        let fee = cost * self.config.fee_rate;

        let mut wallet = self.wallet.write().await;
        match order.side {
            Side::Buy => {
                if cost + fee > wallet.cash {
                    return Err(GatewayError::InsufficientFunds(format!(
                        "need {} USD, have {}",
                        (cost + fee).round_dp(2),
                        wallet.cash.round_dp(2)
                    )));
                }
                wallet.cash -= cost + fee;
                *wallet.holdings.entry(base).or_default() += order.quantity;
            }
            Side::Sell => {
                let held = wallet.holdings.get(&base).copied().unwrap_or_default();
                if held < order.quantity {
                    return Err(GatewayError::InsufficientFunds(format!(
                        "need {} {}, have {}",
                        order.quantity, base, held
                    )));
                }
                wallet.cash += cost - fee;
                let remaining = held - order.quantity;
                if remaining.is_zero() {
                    wallet.holdings.remove(&base);
                } else {
                    wallet.holdings.insert(base, remaining);
                }
            }
        }

        let id = wallet.next_id;
        wallet.next_id += 1;
        wallet.total_fees += fee;
        let txid = format!("PAPER-{:06}", id);
        wallet.fills.push(Fill {
            id,
            txid: txid.clone(),
            timestamp: Utc::now(),
            instrument: order.instrument.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            cost,
            fee,
        });

        info!(
            instrument = %order.instrument,
            side = %order.side,
            qty = %order.quantity,
            price = %price,
            "Paper fill"
        );

        Ok(OrderAck {
            id: txid,
            status: OrderStatus::Filled,
        })
    }

    async fn instrument_metadata(&self, instrument: &str) -> Result<InstrumentMeta, GatewayError> {
        self.inner.instrument_metadata(instrument).await
    }
}

/// Paper trading statistics.
#[derive(Debug, Clone)]
pub struct PaperStats {
    pub initial_cash: Decimal,
    pub current_equity: Decimal,
    pub cash_available: Decimal,
    pub return_pct: Decimal,
    pub fills: usize,
    pub total_fees: Decimal,
    pub running_since: DateTime<Utc>,
}

impl std::fmt::Display for PaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " PAPER TRADING ")?;
        writeln!(f, "Running since: {}", self.running_since.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "Initial Cash:     ${:.2}", self.initial_cash)?;
        writeln!(f, "Current Equity:   ${:.2}", self.current_equity)?;
        writeln!(f, "Cash Available:   ${:.2}", self.cash_available)?;
        writeln!(f, "Return:           {:.2}%", self.return_pct * dec!(100))?;
        writeln!(f)?;
        writeln!(f, "Fills:            {}", self.fills)?;
        writeln!(f, "Total Fees:       ${:.2}", self.total_fees)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticGateway;

    fn paper(cash: Decimal) -> PaperGateway<StaticGateway> {
        let inner = StaticGateway::new().with_price("SOL/USD", dec!(100));
        PaperGateway::new(
            inner,
            PaperConfig {
                initial_cash: cash,
                fee_rate: dec!(0.01),
            },
        )
    }

    fn buy(qty: Decimal) -> OrderRequest {
        OrderRequest {
            instrument: "SOL/USD".to_string(),
            side: Side::Buy,
            quantity: qty,
        }
    }

    #[tokio::test]
    async fn test_buy_then_sell_updates_wallet() {
        let gw = paper(dec!(1000));

        let ack = gw.submit_order(buy(dec!(5))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        let bal = gw.get_balance().await.unwrap();
        assert_eq!(bal["USD"].free, dec!(495)); // 1000 - 500 - 5 fee
        assert_eq!(bal["SOL"].total, dec!(5));

        let sell = OrderRequest {
            side: Side::Sell,
            ..buy(dec!(5))
        };
        gw.submit_order(sell).await.unwrap();

        let bal = gw.get_balance().await.unwrap();
        assert_eq!(bal["USD"].free, dec!(990)); // + 500 - 5 fee
        assert!(!bal.contains_key("SOL"));

        let history = gw.get_trade_history("SOL/USD").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].id < history[1].id);

        let recent = gw.recent_fills(1).await.unwrap();
        assert_eq!(recent[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let gw = paper(dec!(100));

        let err = gw.submit_order(buy(dec!(1))).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientFunds(_)));

        let sell = OrderRequest {
            side: Side::Sell,
            ..buy(dec!(1))
        };
        let err = gw.submit_order(sell).await.unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientFunds(_)));

        // Nothing recorded on failure
        assert!(gw.recent_fills(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let gw = paper(dec!(1000));
        gw.submit_order(buy(dec!(2))).await.unwrap();

        let mut prices = HashMap::new();
        prices.insert("SOL/USD".to_string(), dec!(110));
        let stats = gw.stats(&prices).await;

        assert_eq!(stats.cash_available, dec!(798));
        assert_eq!(stats.current_equity, dec!(1018));
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.total_fees, dec!(2));
    }

    #[tokio::test]
    async fn test_fills_at_current_quote() {
        let gw = paper(dec!(1000));
        gw.submit_order(buy(dec!(2))).await.unwrap();

        gw.inner.set_price("SOL/USD", dec!(120));
        let sell = OrderRequest {
            side: Side::Sell,
            ..buy(dec!(2))
        };
        gw.submit_order(sell).await.unwrap();

        let recent = gw.recent_fills(2).await.unwrap();
        assert_eq!(recent[0].price, dec!(120));
        assert_eq!(recent[1].price, dec!(100));
        // 1000 - 202 + 240 - 2.4
        assert_eq!(gw.get_balance().await.unwrap()["USD"].free, dec!(1035.6));
    }
}
