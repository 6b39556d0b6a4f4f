//! Per-cycle portfolio snapshot: cash, equity, exposure and entry ticket size.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::api::AssetBalance;
use crate::models::{base_asset, Position};

/// Immutable portfolio figures for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioMetrics {
    /// Free quote currency
    pub cash: Decimal,

    /// Mark-to-market value of priced wallet holdings
    pub wallet_value: Decimal,

    /// `cash + wallet_value`
    pub equity: Decimal,

    /// Historical cost of tracked positions
    pub cost_basis: Decimal,

    /// `equity − (cash + cost_basis)`
    pub unrealized_pnl: Decimal,

    pub open_count: usize,

    /// Quote notional for a new entry
    pub entry_ticket_size: Decimal,
}

impl PortfolioMetrics {
    /// Compute the snapshot.
    ///
    /// Instruments missing from `prices` are excluded from every sum.
    pub fn calculate(
        cash: Decimal,
        balances: &HashMap<String, AssetBalance>,
        prices: &HashMap<String, Decimal>,
        positions: &BTreeMap<String, Position>,
        risk_fraction: Decimal,
        min_order_notional: Decimal,
    ) -> Self {
        let wallet_value: Decimal = prices
            .iter()
            .map(|(instrument, price)| {
                let held = balances
                    .get(base_asset(instrument))
                    .map(|b| b.total)
                    .unwrap_or_default();
                held * *price
            })
            .sum();

        let cost_basis: Decimal = positions
            .iter()
            .filter(|(instrument, _)| prices.contains_key(*instrument))
            .map(|(_, pos)| pos.cost_basis())
            .sum();

        let equity = cash + wallet_value;

        Self {
            cash,
            wallet_value,
            equity,
            cost_basis,
            unrealized_pnl: equity - (cash + cost_basis),
            open_count: positions.len(),
            entry_ticket_size: (risk_fraction * equity).max(min_order_notional),
        }
    }
}

impl std::fmt::Display for PortfolioMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cash=${:.2} equity=${:.2} open={} ticket=${:.2} uPnL=${:.2}",
            self.cash, self.equity, self.open_count, self.entry_ticket_size, self.unrealized_pnl
        )
    }
}
