//! Trade intents produced by the decision engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fill::Side;

/// Why an action was proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionTag {
    Entry,
    TakeProfit,
    StopLoss,
}

impl ActionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTag::Entry => "entry",
            ActionTag::TakeProfit => "TP",
            ActionTag::StopLoss => "SL",
        }
    }
}

impl std::fmt::Display for ActionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed order. Consumed once sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeAction {
    pub side: Side,
    pub instrument: String,
    pub quantity: Decimal,
    pub price: Decimal,
    pub tag: ActionTag,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
}

impl TradeAction {
    /// A buy opening a new position with its protective levels.
    pub fn entry(
        instrument: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Self {
        Self {
            side: Side::Buy,
            instrument: instrument.into(),
            quantity,
            price,
            tag: ActionTag::Entry,
            stop_price: Some(stop_price),
            target_price: Some(target_price),
        }
    }

    /// A sell closing an open position.
    pub fn exit(
        instrument: impl Into<String>,
        quantity: Decimal,
        price: Decimal,
        tag: ActionTag,
    ) -> Self {
        Self {
            side: Side::Sell,
            instrument: instrument.into(),
            quantity,
            price,
            tag,
            stop_price: None,
            target_price: None,
        }
    }

    /// Quote notional of the action.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}
