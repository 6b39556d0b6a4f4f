//! Trend, volatility and liquidity indicators.
//!
//! The pure functions work on already-fetched bars; [`IndicatorEngine`]
//! fetches data through a gateway and owns the per-instrument depth state.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use crate::api::MarketGateway;
use crate::error::IndicatorError;
use crate::models::{Candle, Granularity, OrderBook};

/// Exponential moving average of `closes`, seeded with the first close.
///
/// `k = 2 / (period + 1)`, `e = price × k + e × (1 − k)`. `None` when
/// `closes` is empty.
pub fn ema(closes: &[Decimal], period: usize) -> Option<Decimal> {
    let (first, rest) = closes.split_first()?;
    let k = Decimal::TWO / Decimal::from(period as u64 + 1);
    let one_minus_k = Decimal::ONE - k;

    Some(rest.iter().fold(*first, |e, price| *price * k + e * one_minus_k))
}

/// Average true range over consecutive bar pairs.
///
/// Returns zero when fewer than two bars are available; callers treat zero
/// as unknown volatility.
pub fn atr(candles: &[Candle]) -> Decimal {
    if candles.len() < 2 {
        return Decimal::ZERO;
    }

    let total: Decimal = candles
        .windows(2)
        .map(|pair| {
            let prev_close = pair[0].close;
            let curr = &pair[1];
            (curr.high - curr.low)
                .max((curr.high - prev_close).abs())
                .max((curr.low - prev_close).abs())
        })
        .sum();

    total / Decimal::from(candles.len() as u64 - 1)
}

/// Indicator calculator with process-lifetime depth smoothing state.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    depth_alpha: Decimal,
    depth_levels: usize,
    depth_ema: HashMap<String, Decimal>,
}

impl IndicatorEngine {
    pub fn new(depth_alpha: Decimal, depth_levels: usize) -> Self {
        Self {
            depth_alpha,
            depth_levels,
            depth_ema: HashMap::new(),
        }
    }

    /// Fold a book snapshot into the instrument's depth EMA and return it.
    ///
    /// The first observation seeds the average with the raw total.
    pub fn update_depth(&mut self, instrument: &str, book: &OrderBook) -> Decimal {
        let total = book.depth(self.depth_levels);
        let prev = self.depth_ema.get(instrument).copied().unwrap_or(total);
        let next = self.depth_alpha * total + (Decimal::ONE - self.depth_alpha) * prev;

        self.depth_ema.insert(instrument.to_string(), next);
        next
    }

    /// Last smoothed depth, if the instrument has been observed.
    pub fn depth(&self, instrument: &str) -> Option<Decimal> {
        self.depth_ema.get(instrument).copied()
    }

    /// EMA of the last `period` closes at `granularity`.
    pub async fn fetch_ema<G: MarketGateway + ?Sized>(
        &self,
        gateway: &G,
        instrument: &str,
        granularity: Granularity,
        period: usize,
    ) -> Result<Decimal, IndicatorError> {
        let candles = gateway.get_ohlc(instrument, granularity, period).await?;
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();

        let value = ema(&closes, period).ok_or_else(|| IndicatorError::InsufficientData {
            instrument: instrument.to_string(),
            needed: 1,
            got: 0,
        })?;
        debug!(instrument, %granularity, bars = closes.len(), ema = %value, "EMA");
        Ok(value)
    }

    /// ATR over `period` bar pairs (`period + 1` bars), zero if unknown.
    pub async fn fetch_atr<G: MarketGateway + ?Sized>(
        &self,
        gateway: &G,
        instrument: &str,
        granularity: Granularity,
        period: usize,
    ) -> Result<Decimal, IndicatorError> {
        let candles = gateway.get_ohlc(instrument, granularity, period + 1).await?;
        Ok(atr(&candles))
    }

    /// Fetch the book and update the depth EMA. `None` for an empty book.
    pub async fn fetch_depth<G: MarketGateway + ?Sized>(
        &mut self,
        gateway: &G,
        instrument: &str,
    ) -> Result<Option<Decimal>, IndicatorError> {
        let book = gateway.get_order_book(instrument, self.depth_levels).await?;
        if book.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.update_depth(instrument, &book)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookLevel;
    use crate::testing::StaticGateway;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bar(high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: Decimal::ZERO,
        }
    }

    fn book(bid_qty: Decimal, ask_qty: Decimal) -> OrderBook {
        OrderBook {
            bids: vec![BookLevel {
                price: dec!(99),
                quantity: bid_qty,
            }],
            asks: vec![BookLevel {
                price: dec!(101),
                quantity: ask_qty,
            }],
        }
    }

    #[test]
    fn test_ema() {
        assert_eq!(ema(&[], 20), None);
        assert_eq!(ema(&[dec!(42)], 20), Some(dec!(42)));

        // k = 2/3 for period 2
        let value = ema(&[dec!(10), dec!(13)], 2).unwrap();
        assert_eq!(value.round_dp(10), dec!(12));

        // Constant series stays constant
        let flat = ema(&[dec!(5); 20], 20).unwrap();
        assert_eq!(flat.round_dp(10), dec!(5));
    }

    #[test]
    fn test_atr() {
        assert_eq!(atr(&[]), Decimal::ZERO);
        assert_eq!(atr(&[bar(dec!(11), dec!(9), dec!(10))]), Decimal::ZERO);

        let candles = vec![
            bar(dec!(11), dec!(9), dec!(10)),
            // range 2, gap up: |14 - 10| = 4
            bar(dec!(14), dec!(12), dec!(13)),
            // range 3, |10 - 13| = 3
            bar(dec!(13), dec!(10), dec!(11)),
        ];
        assert_eq!(atr(&candles), dec!(3.5));
    }

    #[test]
    fn test_depth_ema() {
        let mut engine = IndicatorEngine::new(dec!(0.2), 5);
        assert_eq!(engine.depth("SOL/USD"), None);

        // First observation seeds with the raw total
        assert_eq!(engine.update_depth("SOL/USD", &book(dec!(30), dec!(70))), dec!(100));

        // 0.2 × 50 + 0.8 × 100
        assert_eq!(engine.update_depth("SOL/USD", &book(dec!(25), dec!(25))), dec!(90));
        assert_eq!(engine.depth("SOL/USD"), Some(dec!(90)));

        // Independent per instrument
        assert_eq!(engine.update_depth("ETH/USD", &book(dec!(1), dec!(1))), dec!(2));
    }

    #[tokio::test]
    async fn test_fetch_ema_without_bars() {
        let gw = StaticGateway::new();
        let engine = IndicatorEngine::new(dec!(0.2), 5);

        let result = engine
            .fetch_ema(&gw, "SOL/USD", Granularity::OneHour, 20)
            .await;
        assert!(matches!(result, Err(IndicatorError::InsufficientData { .. })));

        let atr = engine
            .fetch_atr(&gw, "SOL/USD", Granularity::OneMinute, 14)
            .await
            .unwrap();
        assert_eq!(atr, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_fetch_depth_empty_book() {
        let gw = StaticGateway::new().with_book("SOL/USD", book(dec!(10), dec!(20)));
        let mut engine = IndicatorEngine::new(dec!(0.2), 5);

        assert_eq!(engine.fetch_depth(&gw, "ETH/USD").await.unwrap(), None);
        assert_eq!(engine.fetch_depth(&gw, "SOL/USD").await.unwrap(), Some(dec!(30)));
    }
}
