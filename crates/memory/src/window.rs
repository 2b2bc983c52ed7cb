//! Message-window chat memory over a durable repository.

use async_trait::async_trait;
use parley_core::error::MemoryError;
use parley_core::memory::{
    ChatMemory, ChatMemoryRepository, ConversationLocks, MemoryWindow, TurnGuard,
};
use parley_core::message::{ConversationId, Message};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_WINDOW_SIZE: usize = 20;

/// Keeps the newest `window_size` non-system messages per conversation,
/// with the latest system message pinned.
///
/// Two lock tables: `turns` is held by a pipeline for a whole turn, while
/// `writes` serializes each read-modify-write against the repository.
pub struct MessageWindowMemory<R: ChatMemoryRepository + ?Sized> {
    repository: Arc<R>,
    window_size: usize,
    turns: ConversationLocks,
    writes: ConversationLocks,
}

impl<R: ChatMemoryRepository + ?Sized> MessageWindowMemory<R> {
    pub fn new(repository: Arc<R>, window_size: usize) -> Self {
        Self {
            repository,
            window_size: window_size.max(1),
            turns: ConversationLocks::new(),
            writes: ConversationLocks::new(),
        }
    }

    pub fn with_default_window(repository: Arc<R>) -> Self {
        Self::new(repository, DEFAULT_WINDOW_SIZE)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    async fn load_window(&self, conversation_id: &ConversationId) -> Result<MemoryWindow, MemoryError> {
        let stored = self.repository.load(conversation_id).await?;
        Ok(MemoryWindow::from_messages(
            conversation_id.clone(),
            stored,
            self.window_size,
        ))
    }
}

#[async_trait]
impl<R: ChatMemoryRepository + ?Sized> ChatMemory for MessageWindowMemory<R> {
    async fn lock_turn(&self, conversation_id: &ConversationId) -> TurnGuard {
        self.turns.acquire(conversation_id).await
    }

    async fn append(&self, conversation_id: &ConversationId, message: Message) -> Result<(), MemoryError> {
        self.append_all(conversation_id, vec![message]).await
    }

    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<(), MemoryError> {
        if messages.is_empty() {
            return Ok(());
        }
        let _write = self.writes.acquire(conversation_id).await;

        let mut window = self.load_window(conversation_id).await?;
        let appended = messages.len();
        for message in messages {
            window.push(message);
        }
        let evicted = window.evict_to(self.window_size);

        self.repository
            .replace(conversation_id, &window.to_vec())
            .await?;
        debug!(
            conversation = %conversation_id,
            appended,
            evicted,
            size = window.len(),
            "Memory window updated"
        );
        Ok(())
    }

    async fn read(&self, conversation_id: &ConversationId) -> Result<MemoryWindow, MemoryError> {
        let _write = self.writes.acquire(conversation_id).await;
        self.load_window(conversation_id).await
    }

    async fn clear(&self, conversation_id: &ConversationId) -> Result<(), MemoryError> {
        let _write = self.writes.acquire(conversation_id).await;
        self.repository.delete(conversation_id).await
    }
}
