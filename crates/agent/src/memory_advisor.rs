//! Conversation memory around a turn.
//!
//! Holds the conversation's turn lock from the window read until the
//! `[user, assistant]` pair is written, so two turns for one principal
//! run one after the other and never see each other half-done.

use crate::advisor::{Advisor, Next, PipelineRequest, PipelineResponse};
use crate::error::PipelineError;
use async_trait::async_trait;
use parley_config::MemoryMode;
use parley_core::memory::{ChatMemory, MemoryWindow};
use parley_core::message::{Message, Role};
use std::sync::Arc;
use tracing::{debug, error};

pub struct ChatMemoryAdvisor {
    memory: Arc<dyn ChatMemory>,
    mode: MemoryMode,
}

impl ChatMemoryAdvisor {
    pub fn new(memory: Arc<dyn ChatMemory>) -> Self {
        Self {
            memory,
            mode: MemoryMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: MemoryMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Render the window as a MEMORY section for the system text.
fn render_memory(window: &MemoryWindow) -> String {
    let lines: Vec<String> = window
        .messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
        .collect();
    format!(
        "\n\nUse the conversation memory from the MEMORY section to provide accurate answers.\n\n\
         ---------------------\nMEMORY:\n{}\n---------------------\n",
        lines.join("\n")
    )
}

#[async_trait]
impl Advisor for ChatMemoryAdvisor {
    fn name(&self) -> &str {
        "chat_memory"
    }

    async fn around(
        &self,
        mut request: PipelineRequest,
        next: Next<'_>,
    ) -> Result<PipelineResponse, PipelineError> {
        let turn = request.turn.clone();
        let conversation_id = &turn.conversation_id;
        let _held = self.memory.lock_turn(conversation_id).await;

        let window = self.memory.read(conversation_id).await.map_err(|e| {
            error!(conversation = %conversation_id, error = %e, "Memory read failed");
            e
        })?;
        debug!(conversation = %conversation_id, remembered = window.len(), "Memory window loaded");

        if !window.is_empty() {
            match self.mode {
                MemoryMode::SystemText => request.system.push_str(&render_memory(&window)),
                MemoryMode::Messages => request.history.extend(window.messages.iter().cloned()),
            }
        }

        let user = Message::user(&request.user);
        let response = next.run(request).await?;

        self.memory
            .append_all(conversation_id, vec![user, response.message.clone()])
            .await
            .map_err(|e| {
                error!(conversation = %conversation_id, error = %e, "Memory write failed");
                e
            })?;
        Ok(response)
    }
}
