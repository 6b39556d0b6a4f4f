//! Request signing for Kraken private endpoints.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::error::GatewayError;

type HmacSha512 = Hmac<Sha512>;

/// Compute the `API-Sign` header value.
///
/// `API-Sign = base64(HMAC-SHA512(path ‖ SHA256(nonce ‖ postdata), base64decode(secret)))`
///
/// # Arguments
/// * `secret` - API secret (base64 encoded, as issued by Kraken)
/// * `path` - URI path, e.g. `/0/private/BalanceEx`
/// * `nonce` - the same nonce sent in the form body
/// * `post_data` - url-encoded form body
pub fn sign_request(
    secret: &str,
    path: &str,
    nonce: u64,
    post_data: &str,
) -> Result<String, GatewayError> {
    let secret_bytes = BASE64
        .decode(secret)
        .map_err(|e| GatewayError::Authentication(format!("Failed to decode secret: {}", e)))?;

    let mut sha = Sha256::new();
    sha.update(nonce.to_string().as_bytes());
    sha.update(post_data.as_bytes());
    let digest = sha.finalize();

    let mut mac = HmacSha512::new_from_slice(&secret_bytes)
        .map_err(|e| GatewayError::Authentication(format!("Failed to create HMAC: {}", e)))?;
    mac.update(path.as_bytes());
    mac.update(&digest);

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// API key pair for private endpoints.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Create from environment variables:
    /// - KRAKEN_API_KEY
    /// - KRAKEN_API_SECRET
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("KRAKEN_API_KEY").context("KRAKEN_API_KEY not set")?;
        let api_secret =
            std::env::var("KRAKEN_API_SECRET").context("KRAKEN_API_SECRET not set")?;

        Ok(Self {
            api_key,
            api_secret,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}
