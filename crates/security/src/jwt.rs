//! HS256 JSON Web Tokens for sessions and audience-scoped tool tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use parley_core::auth::{AuthContext, Credential, Principal};
use parley_core::error::AuthError;
use serde::{Deserialize, Serialize};

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(a) => a == audience,
            Audience::Many(all) => all.iter().any(|a| a == audience),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    pub iss: String,
    pub aud: Audience,
    pub exp: i64,
    pub iat: i64,
    /// Space-separated scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

impl Claims {
    /// The display name of the principal.
    pub fn principal_name(&self) -> &str {
        self.preferred_username.as_deref().unwrap_or(&self.sub)
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }

    pub fn principal(&self) -> Principal {
        Principal {
            name: self.principal_name().to_string(),
            roles: self.roles.clone(),
        }
    }
}

/// Signing and verification keys plus the issuer they speak for.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl JwtKeys {
    pub fn from_secret(secret: &[u8], issuer: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Build claims for `principal` valid for `ttl`, addressed to `audience`.
    pub fn claims_for(
        &self,
        principal: &Principal,
        audience: &str,
        scopes: &[String],
        ttl: Duration,
    ) -> Claims {
        let now = Utc::now();
        Claims {
            sub: principal.name.clone(),
            preferred_username: Some(principal.name.clone()),
            iss: self.issuer.clone(),
            aud: Audience::One(audience.to_string()),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            scope: if scopes.is_empty() { None } else { Some(scopes.join(" ")) },
            roles: principal.roles.clone(),
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Unauthenticated(format!("token signing failed: {e}")))
    }

    /// Verify signature, issuer, audience and expiry.
    pub fn verify(&self, token: &str, audience: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 5;

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Unauthenticated(format!("invalid token: {e}")),
            })
    }

    /// Verify a token and turn it into a request-scoped context.
    pub fn authenticate(&self, token: &str, audience: &str) -> Result<AuthContext, AuthError> {
        let claims = self.verify(token, audience)?;
        Ok(AuthContext::new(
            claims.principal(),
            Credential::new(token),
            claims.scopes(),
            claims.expires_at(),
        ))
    }
}
