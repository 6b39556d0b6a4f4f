//! Instrument symbols and exchange metadata.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Lot step used when the exchange reports none.
pub const DEFAULT_LOT_STEP: Decimal = dec!(0.00000001);

/// Exchange-supplied trading rules for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentMeta {
    /// Smallest tradable quantity increment
    pub lot_step: Decimal,

    /// Whether the market is currently open for trading
    pub active: bool,
}

impl InstrumentMeta {
    pub fn new(lot_step: Decimal, active: bool) -> Self {
        let lot_step = if lot_step > Decimal::ZERO {
            lot_step
        } else {
            DEFAULT_LOT_STEP
        };
        Self { lot_step, active }
    }
}

/// Base asset of a `BASE/QUOTE` symbol.
pub fn base_asset(symbol: &str) -> &str {
    symbol.split('/').next().unwrap_or(symbol)
}

/// Quote asset of a `BASE/QUOTE` symbol, `USD` when the symbol has no slash.
pub fn quote_asset(symbol: &str) -> &str {
    symbol.split('/').nth(1).unwrap_or("USD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_split() {
        assert_eq!(base_asset("SOL/USD"), "SOL");
        assert_eq!(quote_asset("SOL/USD"), "USD");
        assert_eq!(base_asset("SOLUSD"), "SOLUSD");
        assert_eq!(quote_asset("SOLUSD"), "USD");
    }

    #[test]
    fn test_zero_lot_step_falls_back() {
        let meta = InstrumentMeta::new(Decimal::ZERO, true);
        assert_eq!(meta.lot_step, DEFAULT_LOT_STEP);

        let meta = InstrumentMeta::new(dec!(0.02), false);
        assert_eq!(meta.lot_step, dec!(0.02));
        assert!(!meta.active);
    }
}
