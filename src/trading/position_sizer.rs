//! Fixed fractional-risk position sizing.

use rust_decimal::Decimal;

use super::TradingConfig;

/// Quantity whose loss at `stop` equals `risk_fraction` of `equity`.
///
/// Zero when entry and stop coincide.
pub fn size(entry: Decimal, stop: Decimal, equity: Decimal, risk_fraction: Decimal) -> Decimal {
    let risk = equity * risk_fraction;
    let unit = (entry - stop).abs();
    if unit.is_zero() || risk <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    risk / unit
}

/// Cap `quantity` at what `cash` can buy at `price` once the fee is paid.
pub fn clamp_to_cash(quantity: Decimal, cash: Decimal, price: Decimal, fee_rate: Decimal) -> Decimal {
    if price <= Decimal::ZERO || cash <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let unit_cost = price * (Decimal::ONE + fee_rate.max(Decimal::ZERO));
    quantity.min(cash / unit_cost)
}

/// Round `quantity` down to a multiple of `lot_step`.
///
/// The result never exceeds `quantity`.
pub fn round_to_lot(quantity: Decimal, lot_step: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO || lot_step <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut rounded = (quantity / lot_step).floor() * lot_step;
    // The quotient can round up in its last digit (e.g. 0.3 / 0.1 repeating).
    if rounded > quantity {
        rounded -= lot_step;
    }
    rounded.max(Decimal::ZERO).normalize()
}

/// Sizes new entries from portfolio equity and available cash.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    risk_fraction: Decimal,
    fee_rate: Decimal,
}

impl PositionSizer {
    pub fn new(risk_fraction: Decimal, fee_rate: Decimal) -> Self {
        Self {
            risk_fraction,
            fee_rate,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(config.risk_fraction, config.fee_rate)
    }

    pub fn risk_fraction(&self) -> Decimal {
        self.risk_fraction
    }

    /// Risk-sized quantity, clamped to cash and rounded down to the lot step.
    pub fn entry_quantity(
        &self,
        entry: Decimal,
        stop: Decimal,
        equity: Decimal,
        cash: Decimal,
        lot_step: Decimal,
    ) -> Decimal {
        let raw = size(entry, stop, equity, self.risk_fraction);
        let affordable = clamp_to_cash(raw, cash, entry, self.fee_rate);
        round_to_lot(affordable, lot_step)
    }
}
