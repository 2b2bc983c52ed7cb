//! Request-scoped identity and the credentials derived from it.
//!
//! An [`AuthContext`] is created once per inbound request and handed down
//! explicitly: gateway → pipeline → advisors → tool registry. Nothing in
//! Parley reads identity from ambient state.
//!
//! Raw credentials are wrapped in [`Credential`], whose `Debug` and
//! `Display` impls never print the secret.

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A secret string that redacts itself when formatted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the raw secret. Only transports and exchangers call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// The verified identity of the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
        }
    }
}

/// Identity + credential bundle for the current request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub credential: Credential,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    pub fn new(
        principal: Principal,
        credential: Credential,
        scopes: Vec<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal,
            credential,
            scopes,
            expires_at,
        }
    }

    pub fn principal_name(&self) -> &str {
        &self.principal.name
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// An authorization artifact scoped to one remote audience.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: Credential,
    pub audience: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Obtains an [`AccessToken`] for a specific audience on behalf of a caller.
///
/// The caller's own credential is never forwarded as-is: each remote
/// provider receives an artifact minted for its audience only.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    fn name(&self) -> &str;

    async fn exchange(
        &self,
        ctx: &AuthContext,
        audience: &str,
    ) -> std::result::Result<AccessToken, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(expires_in: i64) -> AuthContext {
        AuthContext::new(
            Principal::new("george"),
            Credential::new("eyJhbGciOi.secret.sig"),
            vec!["openid".into()],
            Utc::now() + chrono::Duration::seconds(expires_in),
        )
    }

    #[test]
    fn credential_is_redacted_everywhere() {
        let c = ctx(60);
        let debug = format!("{c:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("REDACTED"));
        assert_eq!(format!("{}", c.credential), "[REDACTED]");
        assert_eq!(c.credential.expose(), "eyJhbGciOi.secret.sig");
    }

    #[test]
    fn expiry_is_checked_against_now() {
        assert!(!ctx(60).is_expired());
        assert!(ctx(-1).is_expired());
    }
}
