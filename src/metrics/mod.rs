//! Portfolio metrics.

mod portfolio;

pub use portfolio::PortfolioMetrics;
