//! `ChatPipeline`: one question in, one answer out.
//!
//! The advisor order is fixed when the pipeline is built: memory
//! (outermost), then retrieval, then the model call. Nothing is
//! registered at call time.

use crate::advisor::{Advisor, Next, PipelineRequest, PipelineResponse, TurnContext};
use crate::error::PipelineError;
use crate::memory_advisor::ChatMemoryAdvisor;
use crate::model_call::{ModelCall, ToolSource};
use crate::retrieval_advisor::RetrievalAdvisor;
use parley_config::{MemoryMode, PipelineConfig};
use parley_core::auth::AuthContext;
use parley_core::error::AuthError;
use parley_core::event::{DomainEvent, EventBus};
use parley_core::memory::ChatMemory;
use parley_core::provider::Provider;
use parley_core::retrieval::RetrievalIndex;
use parley_security::AuditLogger;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct ChatPipeline {
    system_prompt: String,
    advisors: Vec<Arc<dyn Advisor>>,
    model_call: ModelCall,
    event_bus: Option<Arc<EventBus>>,
}

pub struct ChatPipelineBuilder {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    config: PipelineConfig,
    memory: Option<Arc<dyn ChatMemory>>,
    retrieval: Option<(Arc<dyn RetrievalIndex>, usize, Option<f32>)>,
    tools: ToolSource,
    event_bus: Option<Arc<EventBus>>,
    audit: Option<Arc<AuditLogger>>,
}

impl ChatPipelineBuilder {
    /// Take system prompt, memory mode, iteration limit and cache key from config.
    pub fn config(mut self, config: &PipelineConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn memory_mode(mut self, mode: MemoryMode) -> Self {
        self.config.memory_mode = mode;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn ChatMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn retrieval(mut self, index: Arc<dyn RetrievalIndex>, top_k: usize, min_score: Option<f32>) -> Self {
        self.retrieval = Some((index, top_k, min_score));
        self
    }

    pub fn tools(mut self, tools: ToolSource) -> Self {
        self.tools = tools;
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn build(self) -> ChatPipeline {
        let mut advisors: Vec<Arc<dyn Advisor>> = Vec::new();
        if let Some(memory) = self.memory {
            advisors.push(Arc::new(
                ChatMemoryAdvisor::new(memory).with_mode(self.config.memory_mode),
            ));
        }
        if let Some((index, top_k, min_score)) = self.retrieval {
            let mut advisor = RetrievalAdvisor::new(index)
                .with_top_k(top_k)
                .with_min_score(min_score);
            if let Some(bus) = &self.event_bus {
                advisor = advisor.with_event_bus(bus.clone());
            }
            advisors.push(Arc::new(advisor));
        }

        let mut model_call = ModelCall::new(self.provider, self.model)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_tools(self.tools)
            .with_max_iterations(self.config.max_tool_iterations)
            .with_prompt_cache_key(self.config.prompt_cache_key);
        if let Some(bus) = &self.event_bus {
            model_call = model_call.with_event_bus(bus.clone());
        }
        if let Some(audit) = self.audit {
            model_call = model_call.with_audit(audit);
        }

        ChatPipeline {
            system_prompt: self.config.system_prompt,
            advisors,
            model_call,
            event_bus: self.event_bus,
        }
    }
}

impl ChatPipeline {
    pub fn builder(provider: Arc<dyn Provider>, model: impl Into<String>) -> ChatPipelineBuilder {
        ChatPipelineBuilder {
            provider,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            config: PipelineConfig::default(),
            memory: None,
            retrieval: None,
            tools: ToolSource::None,
            event_bus: None,
            audit: None,
        }
    }

    /// Advisor names, outermost first.
    pub fn advisor_names(&self) -> Vec<&str> {
        self.advisors.iter().map(|a| a.name()).collect()
    }

    /// Answer `question` for the caller identified by `auth`.
    pub async fn ask(&self, question: &str, auth: AuthContext) -> Result<String, PipelineError> {
        self.run(question, auth).await.map(|response| response.answer)
    }

    /// Like [`ask`](Self::ask), returning the whole response.
    pub async fn run(&self, question: &str, auth: AuthContext) -> Result<PipelineResponse, PipelineError> {
        if auth.is_expired() {
            return Err(AuthError::Expired.into());
        }
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::Internal("empty question".into()));
        }

        let started = Instant::now();
        let turn = Arc::new(TurnContext::new(auth));
        let conversation_id = turn.conversation_id.clone();
        info!(conversation = %conversation_id, turn = %turn.turn_id, "Turn started");

        let request = PipelineRequest::new(&self.system_prompt, question, turn);
        let result = Next::new(&self.advisors, &self.model_call).run(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                info!(
                    conversation = %conversation_id,
                    model = %response.model,
                    tool_calls = response.tool_transcript.len(),
                    documents = response.document_ids.len(),
                    duration_ms,
                    "Turn completed"
                );
                if let Some(bus) = &self.event_bus {
                    bus.publish(DomainEvent::TurnCompleted {
                        conversation_id: conversation_id.to_string(),
                        model: response.model.clone(),
                        tool_calls: response.tool_transcript.len(),
                        duration_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            Err(e) => warn!(conversation = %conversation_id, duration_ms, error = %e, "Turn failed"),
        }
        result
    }
}
