//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the top-level [`Error`]
//! wraps them for code that crosses contexts.

use thiserror::Error;

/// The top-level error type for Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    /// The durable backing could not be read or written.
    #[error("Memory store unavailable: {0}")]
    Unavailable(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Corrupt record in conversation {conversation_id}: {reason}")]
    Corrupt {
        conversation_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Retrieval index unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),
}

/// Failures of a single tool invocation.
///
/// These are recovered inside the model-call step and shown to the model
/// as an error payload; they never abort a pipeline turn.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool '{tool_name}' requires an authenticated caller: {reason}")]
    Unauthorized { tool_name: String, reason: String },

    #[error("Tool '{tool_name}' timed out after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool '{tool_name}' failed: {payload}")]
    Execution {
        tool_name: String,
        payload: serde_json::Value,
    },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Duplicate tool name '{name}' (from {first} and {second})")]
    DuplicateName {
        name: String,
        first: String,
        second: String,
    },

    #[error("Transport error on provider '{provider}': {reason}")]
    Transport { provider: String, reason: String },
}

impl ToolError {
    /// The payload shown to the model for this failure.
    pub fn to_model_payload(&self) -> serde_json::Value {
        match self {
            ToolError::Execution { payload, .. } => serde_json::json!({
                "error": "tool_execution_error",
                "details": payload,
            }),
            ToolError::NotFound(name) => serde_json::json!({
                "error": "tool_not_found",
                "details": format!("No tool named '{name}' is available"),
            }),
            ToolError::Unauthorized { tool_name, .. } => serde_json::json!({
                "error": "tool_unauthorized",
                "details": format!("'{tool_name}' requires a signed-in user"),
            }),
            ToolError::Timeout { tool_name, timeout_ms } => serde_json::json!({
                "error": "tool_timeout",
                "details": format!("'{tool_name}' did not answer within {timeout_ms}ms"),
            }),
            other => serde_json::json!({
                "error": "tool_error",
                "details": other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// No valid caller identity on the inbound request.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Credential expired")]
    Expired,

    #[error("Token exchange for audience '{audience}' failed: {reason}")]
    Exchange { audience: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn execution_payload_is_preserved_for_the_model() {
        let err = ToolError::Execution {
            tool_name: "schedule_adoption".into(),
            payload: serde_json::json!({"message": "no such dog"}),
        };
        let payload = err.to_model_payload();
        assert_eq!(payload["error"], "tool_execution_error");
        assert_eq!(payload["details"]["message"], "no such dog");
    }

    #[test]
    fn unauthorized_payload_leaks_no_reason() {
        let err = ToolError::Unauthorized {
            tool_name: "schedule_adoption".into(),
            reason: "exchange endpoint returned 500".into(),
        };
        let payload = err.to_model_payload().to_string();
        assert!(payload.contains("tool_unauthorized"));
        assert!(!payload.contains("500"));
    }
}
