//! Audience-scoped token acquisition.
//!
//! The caller's session token is never forwarded to a tool provider.
//! Instead each provider audience gets its own short-lived token, either
//! minted locally ([`LocalTokenMinter`]) or obtained from an authorization
//! server through RFC 8693 token exchange ([`OAuth2TokenExchange`]).
//! [`CachingExchanger`] sits in front of either.

use crate::audit::{AuditEvent, AuditLogger, AuditOutcome};
use crate::fingerprint;
use crate::jwt::JwtKeys;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parley_core::auth::{AccessToken, AuthContext, Credential, TokenExchanger};
use parley_core::error::AuthError;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Signs tool tokens with the service's own key.
///
/// A minted token never outlives the caller's session.
pub struct LocalTokenMinter {
    keys: Arc<JwtKeys>,
    ttl: Duration,
}

impl LocalTokenMinter {
    pub fn new(keys: Arc<JwtKeys>, ttl: Duration) -> Self {
        Self { keys, ttl }
    }
}

#[async_trait]
impl TokenExchanger for LocalTokenMinter {
    fn name(&self) -> &str {
        "local"
    }

    async fn exchange(&self, ctx: &AuthContext, audience: &str) -> Result<AccessToken, AuthError> {
        if ctx.is_expired() {
            return Err(AuthError::Expired);
        }
        let mut claims = self
            .keys
            .claims_for(&ctx.principal, audience, &ctx.scopes, self.ttl);
        claims.exp = claims.exp.min(ctx.expires_at.timestamp());

        let token = self.keys.sign(&claims)?;
        Ok(AccessToken {
            token: Credential::new(token),
            audience: audience.to_string(),
            expires_at: claims.expires_at(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// RFC 8693 token exchange against an external authorization server.
pub struct OAuth2TokenExchange {
    client: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    default_ttl: Duration,
}

impl OAuth2TokenExchange {
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Exchange {
                audience: String::new(),
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret,
            default_ttl: Duration::seconds(300),
        })
    }

    /// Lifetime assumed when the server omits `expires_in`.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
}

#[async_trait]
impl TokenExchanger for OAuth2TokenExchange {
    fn name(&self) -> &str {
        "oauth2"
    }

    async fn exchange(&self, ctx: &AuthContext, audience: &str) -> Result<AccessToken, AuthError> {
        if ctx.is_expired() {
            return Err(AuthError::Expired);
        }
        let failed = |reason: String| AuthError::Exchange {
            audience: audience.to_string(),
            reason,
        };

        let form = [
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("subject_token", ctx.credential.expose()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("requested_token_type", ACCESS_TOKEN_TYPE),
            ("audience", audience),
        ];
        let response = self
            .client
            .post(&self.token_endpoint)
            .basic_auth(&self.client_id, self.client_secret.as_deref())
            .form(&form)
            .send()
            .await
            .map_err(|e| failed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("token endpoint returned {status}: {body}")));
        }

        let body: TokenExchangeResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("unreadable token response: {e}")))?;

        let ttl = body.expires_in.map(Duration::seconds).unwrap_or(self.default_ttl);
        Ok(AccessToken {
            token: Credential::new(body.access_token),
            audience: audience.to_string(),
            expires_at: (Utc::now() + ttl).min(ctx.expires_at),
        })
    }
}

/// Caches tokens per (caller credential, audience) until shortly before
/// they expire.
pub struct CachingExchanger<E> {
    inner: E,
    skew: Duration,
    cache: Mutex<HashMap<(String, String), AccessToken>>,
    audit: Option<Arc<AuditLogger>>,
}

impl<E: TokenExchanger> CachingExchanger<E> {
    pub fn new(inner: E, skew: Duration) -> Self {
        Self {
            inner,
            skew,
            cache: Mutex::new(HashMap::new()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lookup(&self, key: &(String, String)) -> Option<AccessToken> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        cache.retain(|_, token| token.expires_at - self.skew > now);
        cache.get(key).cloned()
    }

    fn audit(&self, ctx: &AuthContext, audience: &str, outcome: AuditOutcome, details: Option<String>) {
        if let Some(audit) = &self.audit {
            audit.log(
                AuditEvent::TokenExchange {
                    audience: audience.to_string(),
                },
                ctx.principal_name(),
                outcome,
                details,
            );
        }
    }
}

#[async_trait]
impl<E: TokenExchanger> TokenExchanger for CachingExchanger<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn exchange(&self, ctx: &AuthContext, audience: &str) -> Result<AccessToken, AuthError> {
        let key = (fingerprint(ctx.credential.expose()), audience.to_string());
        if let Some(token) = self.lookup(&key) {
            debug!(audience, principal = %ctx.principal_name(), "Using cached tool token");
            return Ok(token);
        }

        match self.inner.exchange(ctx, audience).await {
            Ok(token) => {
                self.audit(ctx, audience, AuditOutcome::Success, None);
                self.cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(key, token.clone());
                Ok(token)
            }
            Err(e) => {
                warn!(audience, exchanger = self.inner.name(), error = %e, "Token exchange failed");
                self.audit(ctx, audience, AuditOutcome::Failure, Some(e.to_string()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::auth::Principal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys() -> Arc<JwtKeys> {
        Arc::new(JwtKeys::from_secret(b"exchange-secret-exchange-secret!", "parley"))
    }

    fn george(expires_in: Duration) -> AuthContext {
        AuthContext::new(
            Principal::new("george"),
            Credential::new("session-token-for-george"),
            vec!["openid".into()],
            Utc::now() + expires_in,
        )
    }

    struct CountingExchanger {
        calls: AtomicUsize,
        ttl: Duration,
    }

    #[async_trait]
    impl TokenExchanger for CountingExchanger {
        fn name(&self) -> &str {
            "counting"
        }
        async fn exchange(&self, ctx: &AuthContext, audience: &str) -> Result<AccessToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: Credential::new(format!("{}-{audience}-{n}", ctx.principal_name())),
                audience: audience.into(),
                expires_at: Utc::now() + self.ttl,
            })
        }
    }

    #[tokio::test]
    async fn minted_token_is_scoped_to_audience() {
        let keys = keys();
        let minter = LocalTokenMinter::new(keys.clone(), Duration::minutes(5));
        let token = minter.exchange(&george(Duration::minutes(30)), "authserver").await.unwrap();

        assert_eq!(token.audience, "authserver");
        let claims = keys.verify(token.token.expose(), "authserver").unwrap();
        assert_eq!(claims.principal_name(), "george");
        assert!(keys.verify(token.token.expose(), "parley").is_err());
        assert_ne!(token.token.expose(), "session-token-for-george");
    }

    #[tokio::test]
    async fn minted_token_never_outlives_session() {
        let minter = LocalTokenMinter::new(keys(), Duration::hours(1));
        let ctx = george(Duration::minutes(2));
        let token = minter.exchange(&ctx, "authserver").await.unwrap();
        assert!(token.expires_at <= ctx.expires_at);
    }

    #[tokio::test]
    async fn expired_caller_cannot_mint() {
        let minter = LocalTokenMinter::new(keys(), Duration::minutes(5));
        let result = minter.exchange(&george(Duration::seconds(-1)), "authserver").await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn cache_reuses_per_audience() {
        let audit = Arc::new(AuditLogger::new());
        let caching = CachingExchanger::new(
            CountingExchanger {
                calls: AtomicUsize::new(0),
                ttl: Duration::minutes(5),
            },
            Duration::seconds(30),
        )
        .with_audit(audit.clone());
        let ctx = george(Duration::minutes(30));

        let a = caching.exchange(&ctx, "authserver").await.unwrap();
        let b = caching.exchange(&ctx, "authserver").await.unwrap();
        let c = caching.exchange(&ctx, "weather").await.unwrap();

        assert_eq!(a.token.expose(), b.token.expose());
        assert_ne!(a.token.expose(), c.token.expose());
        assert_eq!(caching.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(caching.cached(), 2);
        assert_eq!(audit.count(), 2);
    }

    #[tokio::test]
    async fn tokens_inside_skew_are_refreshed() {
        let caching = CachingExchanger::new(
            CountingExchanger {
                calls: AtomicUsize::new(0),
                ttl: Duration::seconds(10),
            },
            Duration::seconds(30),
        );
        let ctx = george(Duration::minutes(30));
        caching.exchange(&ctx, "authserver").await.unwrap();
        caching.exchange(&ctx, "authserver").await.unwrap();
        assert_eq!(caching.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oauth2_exchange_posts_rfc8693_form() {
        use axum::{Form, Json, Router, routing::post};
        use std::collections::HashMap;

        async fn token(Form(form): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
            assert_eq!(form["grant_type"], TOKEN_EXCHANGE_GRANT);
            assert_eq!(form["subject_token"], "session-token-for-george");
            Json(serde_json::json!({
                "access_token": format!("exchanged-for-{}", form["audience"]),
                "issued_token_type": ACCESS_TOKEN_TYPE,
                "token_type": "Bearer",
                "expires_in": 120
            }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/token", post(token)))
                .await
                .unwrap();
        });

        let exchange = OAuth2TokenExchange::new(
            format!("http://{addr}/token"),
            "parley",
            Some("client-secret".into()),
        )
        .unwrap();
        let token = exchange
            .exchange(&george(Duration::minutes(30)), "authserver")
            .await
            .unwrap();
        assert_eq!(token.token.expose(), "exchanged-for-authserver");
        assert_eq!(token.audience, "authserver");
        assert!(token.expires_at <= Utc::now() + Duration::seconds(121));
    }

    #[tokio::test]
    async fn oauth2_error_status_is_an_exchange_error() {
        use axum::{Router, http::StatusCode, routing::post};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route("/token", post(|| async { (StatusCode::BAD_REQUEST, "invalid_grant") }));
            axum::serve(listener, app).await.unwrap();
        });

        let exchange = OAuth2TokenExchange::new(format!("http://{addr}/token"), "parley", None).unwrap();
        let err = exchange
            .exchange(&george(Duration::minutes(30)), "authserver")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Exchange { ref audience, .. } if audience == "authserver"));
    }
}
