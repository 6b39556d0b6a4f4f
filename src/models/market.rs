//! Market data: candles, order books and bar granularities.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bar interval for OHLC requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Granularity {
    /// Interval length in minutes.
    pub fn minutes(&self) -> u32 {
        match self {
            Granularity::OneMinute => 1,
            Granularity::FiveMinutes => 5,
            Granularity::FifteenMinutes => 15,
            Granularity::OneHour => 60,
            Granularity::FourHours => 240,
            Granularity::OneDay => 1440,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::OneHour => "1h",
            Granularity::FourHours => "4h",
            Granularity::OneDay => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Granularity::OneMinute),
            "5m" => Some(Granularity::FiveMinutes),
            "15m" => Some(Granularity::FifteenMinutes),
            "1h" => Some(Granularity::OneHour),
            "4h" => Some(Granularity::FourHours),
            "1d" => Some(Granularity::OneDay),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLC bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// A single price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order-book snapshot, best levels first on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    /// Resting base quantity across the top `levels` of both sides.
    pub fn depth(&self, levels: usize) -> Decimal {
        let bids: Decimal = self.bids.iter().take(levels).map(|l| l.quantity).sum();
        let asks: Decimal = self.asks.iter().take(levels).map(|l| l.quantity).sum();
        bids + asks
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> BookLevel {
        BookLevel { price, quantity }
    }

    #[test]
    fn test_book_depth() {
        let book = OrderBook {
            bids: vec![
                level(dec!(99), dec!(10)),
                level(dec!(98), dec!(5)),
                level(dec!(97), dec!(100)),
            ],
            asks: vec![level(dec!(101), dec!(7)), level(dec!(102), dec!(3))],
        };

        assert_eq!(book.depth(2), dec!(25));
        assert_eq!(book.depth(5), dec!(125));
        assert!(OrderBook::default().is_empty());
    }

    #[test]
    fn test_granularity() {
        assert_eq!(Granularity::OneHour.minutes(), 60);
        assert_eq!(Granularity::parse("4h"), Some(Granularity::FourHours));
        assert_eq!(Granularity::parse("2h"), None);
        assert_eq!(Granularity::FourHours.to_string(), "4h");
    }
}
