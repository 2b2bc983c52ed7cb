//! The terminal stage: the model call and its tool loop.
//!
//! Builds the provider request from the advised prompt, then loops while
//! the model asks for tools. Tool calls of one response run concurrently,
//! each on its own task, so a call that has been issued runs to completion
//! or to its deadline even if the turn is abandoned. Tool failures go back
//! to the model as tool results; only a provider failure ends the turn.

use crate::advisor::{PipelineRequest, PipelineResponse, ToolInvocation};
use crate::error::PipelineError;
use parley_core::error::ToolError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::message::{Message, MessageToolCall};
use parley_core::provider::{Provider, ProviderRequest};
use parley_core::tool::{ToolCallRequest, ToolRegistry};
use parley_security::{AuditEvent, AuditLogger, AuditOutcome};
use parley_tools::ToolCatalog;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;

const ITERATION_LIMIT_ANSWER: &str =
    "I've reached the maximum number of tool call iterations. Please provide further guidance.";

/// Where the model call gets its tools for a turn.
#[derive(Clone, Default)]
pub enum ToolSource {
    #[default]
    None,
    /// A registry fixed at construction
    Fixed(Arc<ToolRegistry>),
    /// A catalog that rebuilds its snapshot when providers reconnect
    Catalog(Arc<ToolCatalog>),
}

impl ToolSource {
    /// The registry to use for one turn.
    pub async fn snapshot(&self) -> Result<Arc<ToolRegistry>, ToolError> {
        match self {
            ToolSource::None => Ok(Arc::new(ToolRegistry::empty())),
            ToolSource::Fixed(registry) => Ok(registry.clone()),
            ToolSource::Catalog(catalog) => catalog.snapshot().await,
        }
    }
}

pub struct ModelCall {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    tools: ToolSource,
    max_iterations: usize,
    prompt_cache_key: Option<String>,
    event_bus: Option<Arc<EventBus>>,
    audit: Option<Arc<AuditLogger>>,
}

impl ModelCall {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            tools: ToolSource::None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            prompt_cache_key: None,
            event_bus: None,
            audit: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tools(mut self, tools: ToolSource) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_prompt_cache_key(mut self, key: Option<String>) -> Self {
        self.prompt_cache_key = key;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub(crate) async fn call(&self, request: PipelineRequest) -> Result<PipelineResponse, PipelineError> {
        let registry = self.tools.snapshot().await.map_err(|e| {
            PipelineError::Internal(format!("tool registry unavailable: {e}"))
        })?;
        let definitions = registry.definitions();

        let mut conversation = Vec::with_capacity(request.history.len() + 2);
        conversation.push(Message::system(&request.system));
        conversation.extend(request.history.iter().cloned());
        conversation.push(Message::user(request.user_prompt()));

        let mut transcript = Vec::new();

        for iteration in 0..self.max_iterations {
            debug!(
                iteration,
                messages = conversation.len(),
                tools = definitions.len(),
                "Calling provider"
            );
            let provider_request = ProviderRequest {
                model: self.model.clone(),
                messages: conversation.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                tools: definitions.clone(),
                prompt_cache_key: self.prompt_cache_key.clone(),
            };
            let response = self.provider.complete(provider_request).await?;

            if let Some(usage) = &response.usage {
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Token usage"
                );
            }

            if response.message.tool_calls.is_empty() {
                let mut result = PipelineResponse::new(response.message, response.model);
                result.tool_transcript = transcript;
                return Ok(result);
            }

            let calls = response.message.tool_calls.clone();
            info!(count = calls.len(), iteration, "Model requested tool calls");
            conversation.push(response.message);

            let results = self.run_tools(&registry, &request, calls).await;
            for (invocation, message) in results {
                transcript.push(invocation);
                conversation.push(message);
            }
        }

        warn!(max_iterations = self.max_iterations, "Tool loop hit its iteration limit");
        let mut result = PipelineResponse::new(Message::assistant(ITERATION_LIMIT_ANSWER), self.model.clone());
        result.tool_transcript = transcript;
        Ok(result)
    }

    /// Run one response's tool calls concurrently, returning results in
    /// the order the model asked for them.
    async fn run_tools(
        &self,
        registry: &Arc<ToolRegistry>,
        request: &PipelineRequest,
        calls: Vec<MessageToolCall>,
    ) -> Vec<(ToolInvocation, Message)> {
        let handles: Vec<_> = calls
            .into_iter()
            .map(|call| {
                let registry = registry.clone();
                let auth = request.turn.auth.clone();
                let id = call.id.clone();
                let name = call.name.clone();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let result = match parse_arguments(&call.arguments) {
                        Ok(arguments) => {
                            registry
                                .call(ToolCallRequest {
                                    correlation_id: call.id.clone(),
                                    name: call.name.clone(),
                                    arguments,
                                    auth: Some(auth),
                                })
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    (result, started.elapsed().as_millis() as u64)
                });
                (id, name, handle)
            })
            .collect();

        let actor = request.turn.auth.principal_name();
        let mut results = Vec::with_capacity(handles.len());
        for (id, name, handle) in handles {
            let (result, duration_ms) = match handle.await {
                Ok(done) => done,
                Err(e) => {
                    warn!(tool = %name, error = %e, "Tool task did not complete");
                    let payload = serde_json::json!({"error": "tool_error", "details": "the tool task was aborted"});
                    (Err(ToolError::Execution { tool_name: name.clone(), payload }), 0)
                }
            };

            let (success, content) = match result {
                Ok(output) => {
                    info!(tool = %name, duration_ms, "Tool executed");
                    (true, output.content)
                }
                Err(e) => {
                    warn!(tool = %name, duration_ms, error = %e, "Tool call failed");
                    (false, e.to_model_payload().to_string())
                }
            };

            if let Some(bus) = &self.event_bus {
                bus.publish(DomainEvent::ToolExecuted {
                    tool_name: name.clone(),
                    success,
                    duration_ms,
                    timestamp: chrono::Utc::now(),
                });
            }
            if let Some(audit) = &self.audit {
                let outcome = if success { AuditOutcome::Success } else { AuditOutcome::Failure };
                audit.log(
                    AuditEvent::ToolExecution { tool_name: name.clone() },
                    actor,
                    outcome,
                    Some(format!("correlation_id={id}")),
                );
            }

            results.push((
                ToolInvocation {
                    correlation_id: id.clone(),
                    name,
                    success,
                    duration_ms,
                },
                Message::tool_result(id, content),
            ));
        }
        results
    }
}

/// Models sometimes send an empty string for a tool without parameters.
fn parse_arguments(raw: &str) -> Result<serde_json::Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments(format!("not valid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::TurnContext;
    use crate::test_support::*;
    use async_trait::async_trait;
    use parley_core::error::ProviderError;
    use parley_core::message::Role;
    use parley_core::tool::{Tool, ToolContext, ToolOutput};
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Answers only once `parties` calls are in flight at the same time.
    struct Rendezvous {
        name: &'static str,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl Tool for Rendezvous {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Waits for its sibling"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            self.barrier.wait().await;
            let who = ctx.principal.as_ref().map(|p| p.name.clone()).unwrap_or_default();
            Ok(ToolOutput::text(format!("{} for {who}", self.name)))
        }
    }

    fn request(question: &str) -> PipelineRequest {
        PipelineRequest::new("You help people adopt dogs", question, Arc::new(TurnContext::new(caller("george"))))
    }

    #[tokio::test]
    async fn plain_answer_without_tools() {
        let provider = Arc::new(ScriptedProvider::text("We have Prancer."));
        let call = ModelCall::new(provider.clone(), "mock-model")
            .with_prompt_cache_key(Some("system_cache_key".into()));

        let response = call.call(request("any dogs?")).await.unwrap();
        assert_eq!(response.answer, "We have Prancer.");
        assert!(response.tool_transcript.is_empty());

        let sent = &provider.requests()[0];
        assert_eq!(sent.prompt_cache_key.as_deref(), Some("system_cache_key"));
        assert_eq!(sent.messages[0].role, Role::System);
        assert_eq!(sent.messages[1].content, "any dogs?");
        assert!(sent.tools.is_empty());
    }

    #[tokio::test]
    async fn tool_calls_of_one_response_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let registry = ToolRegistry::builder()
            .local(Arc::new(Rendezvous { name: "left", barrier: barrier.clone() }))
            .local(Arc::new(Rendezvous { name: "right", barrier }))
            .build()
            .unwrap();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![
                tool_call("call_1", "left", serde_json::json!({})),
                tool_call("call_2", "right", serde_json::json!({})),
            ])),
            Ok(text_response("both done")),
        ]));
        let call = ModelCall::new(provider.clone(), "mock-model")
            .with_tools(ToolSource::Fixed(Arc::new(registry)));

        let response = tokio::time::timeout(Duration::from_secs(5), call.call(request("go")))
            .await
            .expect("sequential tool calls would deadlock on the barrier")
            .unwrap();
        assert_eq!(response.answer, "both done");
        assert_eq!(response.tool_transcript.len(), 2);
        assert!(response.tool_transcript.iter().all(|t| t.success));

        let second = &provider.requests()[1];
        let tool_messages: Vec<_> = second.messages.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool_messages[0].content, "left for george");
        assert_eq!(tool_messages[1].content, "right for george");
        assert_eq!(second.tools.len(), 2);
    }

    #[tokio::test]
    async fn tool_errors_are_shown_to_the_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![
                tool_call("call_1", "teleport", serde_json::json!({})),
            ])),
            Ok(text_response("Sorry, I can't do that.")),
        ]));
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe();
        let audit = Arc::new(AuditLogger::new());
        let call = ModelCall::new(provider.clone(), "mock-model")
            .with_event_bus(bus)
            .with_audit(audit.clone());

        let response = call.call(request("teleport me")).await.unwrap();
        assert_eq!(response.answer, "Sorry, I can't do that.");
        assert!(!response.tool_transcript[0].success);

        let tool_message = provider.requests()[1]
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .cloned()
            .unwrap();
        assert!(tool_message.content.contains("tool_not_found"));

        match events.recv().await.unwrap().as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "teleport");
                assert!(!success);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(audit.entries_by_outcome(AuditOutcome::Failure).len(), 1);
        assert_eq!(audit.entries()[0].actor, "george");
    }

    #[tokio::test]
    async fn malformed_arguments_never_reach_the_tool() {
        let barrier = Arc::new(Barrier::new(2));
        let registry = ToolRegistry::builder()
            .local(Arc::new(Rendezvous { name: "left", barrier }))
            .build()
            .unwrap();
        let mut bad = tool_call("call_1", "left", serde_json::json!({}));
        bad.arguments = "{not json".into();
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![bad])),
            Ok(text_response("ok")),
        ]));
        let call = ModelCall::new(provider.clone(), "mock-model")
            .with_tools(ToolSource::Fixed(Arc::new(registry)));

        call.call(request("go")).await.unwrap();
        let tool_message = provider.requests()[1]
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .cloned()
            .unwrap();
        assert!(tool_message.content.contains("Invalid tool arguments"));
    }

    #[tokio::test]
    async fn iteration_limit_returns_guidance() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(tool_call_response(vec![tool_call("c1", "missing", serde_json::json!({}))])),
            Ok(tool_call_response(vec![tool_call("c2", "missing", serde_json::json!({}))])),
        ]));
        let call = ModelCall::new(provider.clone(), "mock-model").with_max_iterations(2);

        let response = call.call(request("loop")).await.unwrap();
        assert_eq!(response.answer, ITERATION_LIMIT_ANSWER);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(response.tool_transcript.len(), 2);
    }

    #[tokio::test]
    async fn provider_failure_ends_the_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::Network(
            "connection reset".into(),
        ))]));
        let call = ModelCall::new(provider, "mock-model");
        assert!(matches!(call.call(request("hi")).await, Err(PipelineError::Model(_))));
    }

    #[test]
    fn empty_arguments_are_an_empty_object() {
        assert_eq!(parse_arguments("").unwrap(), serde_json::json!({}));
        assert_eq!(parse_arguments("{\"dogId\":45}").unwrap()["dogId"], 45);
        assert!(parse_arguments("[").is_err());
    }
}
