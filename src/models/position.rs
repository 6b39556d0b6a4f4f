//! Position model: our holding in one instrument, with protective levels.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PositionError;

/// An open long position.
///
/// A flat instrument has no `Position` at all; a value of this type always
/// carries a positive quantity and a positive average cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PositionRecord")]
pub struct Position {
    quantity: Decimal,
    avg_cost: Decimal,
    stop_price: Decimal,
    target_price: Decimal,
}

/// Unchecked wire form of [`Position`].
#[derive(Deserialize)]
struct PositionRecord {
    quantity: Decimal,
    avg_cost: Decimal,
    stop_price: Decimal,
    target_price: Decimal,
}

impl TryFrom<PositionRecord> for Position {
    type Error = PositionError;

    fn try_from(r: PositionRecord) -> Result<Self, Self::Error> {
        Position::new(r.quantity, r.avg_cost, r.stop_price, r.target_price)
    }
}

impl Position {
    /// Create a position, rejecting zero/negative quantity or cost.
    pub fn new(
        quantity: Decimal,
        avg_cost: Decimal,
        stop_price: Decimal,
        target_price: Decimal,
    ) -> Result<Self, PositionError> {
        if quantity <= Decimal::ZERO {
            return Err(PositionError::NonPositiveQuantity(quantity));
        }
        if avg_cost <= Decimal::ZERO {
            return Err(PositionError::NonPositiveCost(avg_cost));
        }

        Ok(Self {
            quantity,
            avg_cost,
            stop_price,
            target_price,
        })
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn avg_cost(&self) -> Decimal {
        self.avg_cost
    }

    pub fn stop_price(&self) -> Decimal {
        self.stop_price
    }

    pub fn target_price(&self) -> Decimal {
        self.target_price
    }

    /// Historical cost of the held quantity.
    pub fn cost_basis(&self) -> Decimal {
        self.quantity * self.avg_cost
    }

    /// Unrealized P&L if marked at `price`.
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.avg_cost) * self.quantity
    }

    /// Raise the stop to `candidate` if it is higher. Returns whether it moved.
    ///
    /// The stop never decreases.
    pub fn ratchet_stop(&mut self, candidate: Decimal) -> bool {
        if candidate > self.stop_price {
            self.stop_price = candidate;
            true
        } else {
            false
        }
    }

    /// Apply a confirmed sell of `quantity`.
    ///
    /// Returns the remaining position, or `None` when fully exited. The
    /// average cost of the remainder is unchanged.
    pub fn reduce(self, quantity: Decimal) -> Option<Self> {
        let remaining = self.quantity - quantity.min(self.quantity);
        if remaining <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            quantity: remaining,
            ..self
        })
    }
}
