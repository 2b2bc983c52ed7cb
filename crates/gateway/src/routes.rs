//! Route handlers.

use crate::SharedState;
use axum::Extension;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use parley_core::auth::AuthContext;
use serde::{Deserialize, Serialize};
use tracing::error;

/// The only body a failed turn ever returns.
pub const GENERIC_FAILURE: &str = "Sorry, I couldn't answer that right now.";

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub(crate) async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Deserialize)]
pub(crate) struct AskParams {
    question: Option<String>,
}

pub(crate) async fn ask_handler(
    State(state): State<SharedState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<AskParams>,
) -> Response {
    let question = params.question.unwrap_or_default();
    if question.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "question must not be empty").into_response();
    }

    let principal = auth.principal_name().to_string();
    match state.pipeline.ask(&question, auth).await {
        Ok(answer) => answer.into_response(),
        Err(e) if e.is_caller_error() => crate::auth::unauthorized(),
        Err(e) => {
            error!(principal = %principal, error = %e, "Pipeline failed");
            (StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE).into_response()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub target: String,
    pub requires_auth: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolSummary>,
    pub count: usize,
}

pub(crate) async fn tools_handler(
    State(state): State<SharedState>,
    Extension(_auth): Extension<AuthContext>,
) -> Result<Json<ToolListResponse>, StatusCode> {
    let registry = state.tools.snapshot().await.map_err(|e| {
        error!(error = %e, "Tool registry unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let tools: Vec<ToolSummary> = registry
        .descriptors()
        .into_iter()
        .map(|d| ToolSummary {
            name: d.name.clone(),
            description: d.description.clone(),
            target: d.target.to_string(),
            requires_auth: d.auth.is_required(),
        })
        .collect();

    Ok(Json(ToolListResponse {
        count: tools.len(),
        tools,
    }))
}
