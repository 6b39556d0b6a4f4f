//! Startup position reconciliation.
//!
//! The wallet says how much we hold; the trade history says what it cost.
//! The two disagree whenever coins arrive outside our own fills (deposits,
//! staking rewards, trades older than the history window). FIFO replay of the
//! fills gives the cost of what history accounts for, and any unexplained
//! difference is marked at spot.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::models::{Fill, Position, Side};

use super::TradingConfig;

/// Volatility fallback when the ATR is unknown: 1% of the average cost.
const FALLBACK_VOL_FRACTION: Decimal = dec!(0.01);

/// One unconsumed buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lot {
    pub quantity: Decimal,
    pub price: Decimal,
}

/// Residual buy lots after FIFO matching, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    lots: VecDeque<Lot>,
}

impl Inventory {
    pub fn buy(&mut self, quantity: Decimal, price: Decimal) {
        if quantity > Decimal::ZERO {
            self.lots.push_back(Lot { quantity, price });
        }
    }

    /// Consume `quantity` from the oldest lots. Sells beyond the inventory
    /// empty the queue; the excess is returned.
    pub fn sell(&mut self, quantity: Decimal) -> Decimal {
        let mut remaining = quantity;
        while remaining > Decimal::ZERO {
            let Some(front) = self.lots.front_mut() else {
                break;
            };
            if front.quantity > remaining {
                front.quantity -= remaining;
                remaining = Decimal::ZERO;
            } else {
                remaining -= front.quantity;
                self.lots.pop_front();
            }
        }
        remaining
    }

    pub fn quantity(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity).sum()
    }

    pub fn cost(&self) -> Decimal {
        self.lots.iter().map(|l| l.quantity * l.price).sum()
    }

    /// Volume-weighted cost of the residual lots, `None` when empty.
    pub fn avg_cost(&self) -> Option<Decimal> {
        let qty = self.quantity();
        if qty.is_zero() {
            None
        } else {
            Some(self.cost() / qty)
        }
    }

    pub fn lots(&self) -> impl Iterator<Item = &Lot> {
        self.lots.iter()
    }
}

/// Replay fills in id order with FIFO matching.
pub fn fifo_replay(fills: &[Fill]) -> Inventory {
    let mut ordered: Vec<&Fill> = fills.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id).then(a.timestamp.cmp(&b.timestamp)));

    let mut inventory = Inventory::default();
    for fill in ordered {
        match fill.side {
            Side::Buy => inventory.buy(fill.quantity, fill.price),
            Side::Sell => {
                let excess = inventory.sell(fill.quantity);
                if excess > Decimal::ZERO {
                    debug!(
                        instrument = %fill.instrument,
                        txid = %fill.txid,
                        excess = %excess,
                        "Sell exceeds replayed inventory"
                    );
                }
            }
        }
    }
    inventory
}

/// Builds the authoritative position of one instrument from wallet and fills.
#[derive(Debug, Clone)]
pub struct Reconciler {
    tolerance: Decimal,
    sl_mult: Decimal,
    tp_mult: Decimal,
}

impl Reconciler {
    pub fn new(tolerance: Decimal, sl_mult: Decimal, tp_mult: Decimal) -> Self {
        Self {
            tolerance,
            sl_mult,
            tp_mult,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(config.reconcile_tolerance, config.sl_mult, config.tp_mult)
    }

    /// Reconcile wallet quantity with trade history.
    ///
    /// Returns `None` when nothing worth tracking is held: an empty wallet,
    /// or exposure below `dust_floor` at `spot`.
    pub fn reconcile(
        &self,
        instrument: &str,
        wallet_qty: Decimal,
        fills: &[Fill],
        spot: Decimal,
        dust_floor: Decimal,
        volatility: Decimal,
    ) -> Option<Position> {
        if wallet_qty <= Decimal::ZERO {
            debug!(instrument, "Wallet empty, no position");
            return None;
        }

        let inventory = fifo_replay(fills);
        let hist_qty = inventory.quantity();
        let hist_avg = inventory.avg_cost();

        let (quantity, mut avg) = match hist_avg {
            Some(hist_avg) if (wallet_qty - hist_qty).abs() <= self.tolerance => (wallet_qty, hist_avg),
            _ if spot.is_zero() => {
                warn!(
                    instrument,
                    wallet = %wallet_qty,
                    history = %hist_qty,
                    "Wallet/history mismatch and no spot price, using history"
                );
                (hist_qty, hist_avg.unwrap_or_default())
            }
            _ => {
                let delta = wallet_qty - hist_qty;
                let hist_cost = hist_qty * hist_avg.unwrap_or_default();
                let blended = (hist_cost + delta * spot) / wallet_qty;
                warn!(
                    instrument,
                    wallet = %wallet_qty,
                    history = %hist_qty,
                    spot = %spot,
                    avg = %blended,
                    "Wallet/history mismatch, blending difference at spot"
                );
                (wallet_qty, blended)
            }
        };

        if wallet_qty * spot < dust_floor {
            debug!(instrument, qty = %wallet_qty, spot = %spot, "Below dust floor");
            return None;
        }

        if avg <= Decimal::ZERO {
            warn!(instrument, avg = %avg, "Non-positive reconciled cost, using spot");
            avg = spot;
        }

        let vol = if volatility > Decimal::ZERO {
            volatility
        } else {
            avg * FALLBACK_VOL_FRACTION
        };
        let stop = avg - vol * self.sl_mult;
        let target = avg + vol * self.tp_mult;

        match Position::new(quantity, avg, stop, target) {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(instrument, error = %e, "Discarding reconciled position");
                None
            }
        }
    }
}
