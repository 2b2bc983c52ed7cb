//! Session authentication for gateway routes.

use crate::SharedState;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parley_core::event::DomainEvent;
use parley_security::{AuditEvent, AuditOutcome};
use tracing::warn;

/// Verify the bearer session and attach its `AuthContext` to the request.
///
/// Refusals are audited and published as `AuthFailure`; the response says
/// only that a bearer token is required.
pub async fn require_session(State(state): State<SharedState>, mut req: Request, next: Next) -> Response {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.propagator.extract(authorization) {
        Ok(ctx) => {
            state.audit.log(AuditEvent::Session, ctx.principal_name(), AuditOutcome::Success, None);
            req.extensions_mut().insert(ctx);
            next.run(req).await
        }
        Err(e) => {
            let path = req.uri().path().to_string();
            warn!(path = %path, reason = %e, "Rejected unauthenticated request");
            state.audit.log(
                AuditEvent::Session,
                "anonymous",
                AuditOutcome::Denied,
                Some(e.to_string()),
            );
            state.event_bus.publish(DomainEvent::AuthFailure {
                context: format!("gateway {path}"),
                reason: e.to_string(),
                timestamp: chrono::Utc::now(),
            });
            unauthorized()
        }
    }
}

pub(crate) fn unauthorized() -> Response {
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
