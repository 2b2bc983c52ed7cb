use parley_core::error::{AuthError, MemoryError, ProviderError};
use thiserror::Error;

/// Failures that end a pipeline turn.
///
/// Tool failures are not here: they are handed back to the model as tool
/// results. Retrieval failures are absorbed by the retrieval advisor.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),

    #[error("Memory store unavailable: {0}")]
    MemoryStoreUnavailable(#[from] MemoryError),

    #[error("Model call failed: {0}")]
    Model(#[from] ProviderError),

    #[error("Internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the caller, not the service, is at fault.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, PipelineError::Unauthenticated(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_failures_blame_the_caller() {
        assert!(PipelineError::from(AuthError::Expired).is_caller_error());
        assert!(!PipelineError::from(MemoryError::Unavailable("db down".into())).is_caller_error());
        assert!(!PipelineError::Internal("x".into()).is_caller_error());
    }
}
