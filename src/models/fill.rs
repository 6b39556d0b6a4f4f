//! Historical fills on our own account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Monotonic per-instrument ordering key
    pub id: u64,

    /// Exchange trade identifier
    pub txid: String,

    /// When the trade executed
    pub timestamp: DateTime<Utc>,

    /// Symbol in `BASE/QUOTE` form
    pub instrument: String,

    pub side: Side,

    /// Base-asset quantity (positive)
    pub quantity: Decimal,

    /// Price per unit in quote currency (positive)
    pub price: Decimal,

    /// Total quote value
    #[serde(default)]
    pub cost: Decimal,

    /// Fee paid in quote currency
    #[serde(default)]
    pub fee: Decimal,
}

impl Fill {
    /// Quote notional, falling back to `quantity × price` when the exchange
    /// did not report a cost.
    pub fn notional(&self) -> Decimal {
        if self.cost.is_zero() {
            self.quantity * self.price
        } else {
            self.cost
        }
    }
}
