//! HTTP gateway for Parley.
//!
//! - `GET /ask?question=…` answers as plain text for the bearer's principal
//! - `GET /tools` lists the tools the model can currently call
//! - `GET /health` is open for monitoring
//!
//! Every route except `/health` goes through [`auth::require_session`],
//! which turns the `Authorization` header into the request's
//! `AuthContext`. Handlers pass that context on by value; nothing about the
//! caller is stored outside the request.

pub mod auth;
pub mod routes;

use axum::{Router, middleware, routing::get};
use parley_agent::{ChatPipeline, ToolSource};
use parley_core::event::EventBus;
use parley_security::{AuditLogger, AuthPropagator};
use std::sync::Arc;
use tracing::info;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub pipeline: Arc<ChatPipeline>,
    pub propagator: AuthPropagator,
    pub tools: ToolSource,
    pub audit: Arc<AuditLogger>,
    pub event_bus: Arc<EventBus>,
}

pub type SharedState = Arc<GatewayState>;

/// Build the router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/ask", get(routes::ask_handler))
        .route("/tools", get(routes::tools_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_session));

    Router::new()
        .route("/health", get(routes::health_handler))
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn start(state: SharedState, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
