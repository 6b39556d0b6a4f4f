//! Typed errors for gateway calls, indicators and position construction.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors returned by a [`MarketGateway`](crate::api::MarketGateway).
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The account cannot cover the order
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The exchange refused the order for another reason
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Symbol is not listed by the exchange
    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    /// Credentials missing or refused
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Transport-level failure (connect, timeout, bad status)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The exchange answered with something we could not interpret
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Any other error reported by the exchange
    #[error("exchange error: {0}")]
    Exchange(String),
}

impl GatewayError {
    /// Execution failures leave state untouched and are retried next cycle.
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, Self::InsufficientFunds(_) | Self::Rejected(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

/// Indicator computation failures.
#[derive(Error, Debug)]
pub enum IndicatorError {
    #[error("insufficient data for {instrument}: need {needed} bars, got {got}")]
    InsufficientData {
        instrument: String,
        needed: usize,
        got: usize,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Violations of the [`Position`](crate::models::Position) invariants.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PositionError {
    #[error("position quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("average cost must be positive, got {0}")]
    NonPositiveCost(Decimal),
}
