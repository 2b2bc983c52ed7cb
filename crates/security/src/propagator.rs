//! Turns the inbound `Authorization` header into an [`AuthContext`].

use crate::jwt::JwtKeys;
use chrono::Duration;
use parley_core::auth::{AuthContext, Principal};
use parley_core::error::AuthError;
use std::sync::Arc;
use tracing::debug;

/// Verifies session tokens addressed to this service.
#[derive(Debug, Clone)]
pub struct AuthPropagator {
    keys: Arc<JwtKeys>,
    audience: String,
}

impl AuthPropagator {
    pub fn new(keys: Arc<JwtKeys>, audience: impl Into<String>) -> Self {
        Self {
            keys,
            audience: audience.into(),
        }
    }

    pub fn keys(&self) -> &Arc<JwtKeys> {
        &self.keys
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Build a context from the raw `Authorization` header value.
    ///
    /// Anything other than a valid, unexpired `Bearer` token for this
    /// service's audience is `Unauthenticated` (or `Expired`).
    pub fn extract(&self, authorization: Option<&str>) -> Result<AuthContext, AuthError> {
        let header = authorization
            .ok_or_else(|| AuthError::Unauthenticated("missing Authorization header".into()))?;
        let token = bearer_token(header)
            .ok_or_else(|| AuthError::Unauthenticated("expected a Bearer token".into()))?;

        let ctx = self.keys.authenticate(token, &self.audience)?;
        debug!(principal = %ctx.principal_name(), "Caller authenticated");
        Ok(ctx)
    }

    /// Sign a session token for `principal`, addressed to this service.
    pub fn issue_session(
        &self,
        principal: &Principal,
        scopes: &[String],
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let claims = self.keys.claims_for(principal, &self.audience, scopes, ttl);
        self.keys.sign(&claims)
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
