//! Exchange access: the gateway trait, the Kraken REST client and the paper wallet.

mod auth;
mod gateway;
mod kraken_client;
mod paper;
mod types;

pub use auth::Credentials;
pub use gateway::{AssetBalance, MarketGateway, OrderAck, OrderRequest, OrderStatus};
pub use kraken_client::{canonical_symbol, KrakenClient};
pub use paper::{PaperConfig, PaperGateway, PaperStats};
