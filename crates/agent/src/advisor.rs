//! The advisor chain: middleware stages wrapped around the model call.
//!
//! Each [`Advisor`] receives the turn's [`PipelineRequest`] and a [`Next`]
//! handle. It may rewrite the request, call `next.run(request)`, rewrite the
//! response, or return without calling next at all. The chain is an ordered
//! slice fixed when the pipeline is built; the innermost stage is always the
//! [`ModelCall`].

use crate::error::PipelineError;
use crate::model_call::ModelCall;
use async_trait::async_trait;
use parley_core::auth::AuthContext;
use parley_core::message::{ConversationId, Message};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Identity of one turn, shared read-only by every stage.
#[derive(Debug)]
pub struct TurnContext {
    pub turn_id: String,
    pub conversation_id: ConversationId,
    pub auth: AuthContext,
}

impl TurnContext {
    pub fn new(auth: AuthContext) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            conversation_id: ConversationId::for_principal(auth.principal_name()),
            auth,
        }
    }
}

/// The prompt for one turn, as the advisors build it up.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// System instructions, possibly extended with a MEMORY section
    pub system: String,
    /// Prior messages sent verbatim before the user prompt
    pub history: Vec<Message>,
    /// The caller's question, unmodified
    pub user: String,
    /// Retrieved passages to ground the answer in
    pub context: Vec<String>,
    pub turn: Arc<TurnContext>,
}

impl PipelineRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, turn: Arc<TurnContext>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            user: user.into(),
            context: Vec::new(),
            turn,
        }
    }

    /// The user prompt with the context section appended.
    pub fn user_prompt(&self) -> String {
        if self.context.is_empty() {
            return self.user.clone();
        }
        format!(
            "{}\n\nContext information is below, surrounded by ---------------------\n\
             ---------------------\n{}\n---------------------\n\
             Given the context and provided history information and not prior knowledge, \
             reply to the user comment. If the answer is not in the context, inform the user \
             that you can't answer the question.",
            self.user,
            self.context.join("\n")
        )
    }
}

/// One tool invocation made while answering.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub correlation_id: String,
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
}

/// What comes back up the chain.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub answer: String,
    /// The final assistant message, as it should be remembered
    pub message: Message,
    pub model: String,
    pub tool_transcript: Vec<ToolInvocation>,
    /// Ids of the documents placed into the prompt
    pub document_ids: Vec<String>,
}

impl PipelineResponse {
    pub fn new(message: Message, model: impl Into<String>) -> Self {
        Self {
            answer: message.content.clone(),
            message,
            model: model.into(),
            tool_transcript: Vec::new(),
            document_ids: Vec::new(),
        }
    }
}

/// A middleware stage around the model call.
#[async_trait]
pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    async fn around(
        &self,
        request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError>;
}

/// The rest of the chain after the current advisor.
pub struct Next<'a> {
    advisors: &'a [Arc<dyn Advisor>],
    terminal: &'a ModelCall,
}

impl<'a> Next<'a> {
    pub fn new(advisors: &'a [Arc<dyn Advisor>], terminal: &'a ModelCall) -> Self {
        Self { advisors, terminal }
    }

    /// Run the next advisor, or the model call if none remain.
    pub async fn run(self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        match self.advisors.split_first() {
            Some((advisor, rest)) => {
                tracing::trace!(advisor = advisor.name(), "Entering advisor");
                advisor.around(request, Next::new(rest, self.terminal)).await
            }
            None => self.terminal.call(request).await,
        }
    }
}
