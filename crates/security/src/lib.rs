//! Identity for Parley: who is asking, and what may be done on their behalf.
//!
//! - **Sessions**: [`AuthPropagator`] verifies inbound bearer tokens and
//!   produces the request's [`AuthContext`](parley_core::AuthContext)
//! - **Token exchange**: audience-scoped tool tokens, minted locally or
//!   obtained over RFC 8693, cached until shortly before expiry
//! - **Audit logging**: structured record of every identity decision

pub mod audit;
pub mod exchange;
pub mod jwt;
pub mod propagator;

pub use audit::{AuditEntry, AuditEvent, AuditLogger, AuditOutcome, AuditSink, TracingSink};
pub use exchange::{CachingExchanger, LocalTokenMinter, OAuth2TokenExchange};
pub use jwt::{Audience, Claims, JwtKeys};
pub use propagator::AuthPropagator;

use parley_config::{AuthConfig, ExchangeMode};
use parley_core::auth::TokenExchanger;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Problems assembling the security layer from configuration.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("auth.jwt_secret is not set (or PARLEY_JWT_SECRET)")]
    MissingSecret,

    #[error("auth.exchange.{0} is required when exchange mode is oauth2")]
    MissingExchangeSetting(&'static str),

    #[error("token exchange client: {0}")]
    Client(String),
}

/// Short, stable, non-reversible identifier for a secret.
///
/// First 16 hex characters of its SHA-256.
pub fn fingerprint(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Signing keys from `auth.jwt_secret`.
pub fn keys_from_config(config: &AuthConfig) -> Result<Arc<JwtKeys>, SecurityError> {
    let secret = config.jwt_secret.as_deref().ok_or(SecurityError::MissingSecret)?;
    Ok(Arc::new(JwtKeys::from_secret(secret.as_bytes(), config.issuer.clone())))
}

/// The session verifier for inbound requests.
pub fn propagator_from_config(config: &AuthConfig) -> Result<AuthPropagator, SecurityError> {
    Ok(AuthPropagator::new(keys_from_config(config)?, config.audience.clone()))
}

/// The configured token exchanger, wrapped in a cache.
pub fn exchanger_from_config(
    config: &AuthConfig,
    keys: Arc<JwtKeys>,
    audit: Arc<AuditLogger>,
) -> Result<Arc<dyn TokenExchanger>, SecurityError> {
    let exchange = &config.exchange;
    let skew = chrono::Duration::seconds(exchange.cache_skew_secs as i64);
    let ttl = chrono::Duration::seconds(exchange.token_ttl_secs as i64);

    Ok(match exchange.mode {
        ExchangeMode::Local => Arc::new(
            CachingExchanger::new(LocalTokenMinter::new(keys, ttl), skew).with_audit(audit),
        ),
        ExchangeMode::Oauth2 => {
            let endpoint = exchange
                .token_endpoint
                .clone()
                .ok_or(SecurityError::MissingExchangeSetting("token_endpoint"))?;
            let client_id = exchange
                .client_id
                .clone()
                .ok_or(SecurityError::MissingExchangeSetting("client_id"))?;
            let oauth = OAuth2TokenExchange::new(endpoint, client_id, exchange.client_secret.clone())
                .map_err(|e| SecurityError::Client(e.to_string()))?
                .with_default_ttl(ttl);
            Arc::new(CachingExchanger::new(oauth, skew).with_audit(audit))
        }
    })
}
