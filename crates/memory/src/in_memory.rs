//! In-memory repository: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use parley_core::error::MemoryError;
use parley_core::memory::ChatMemoryRepository;
use parley_core::message::{ConversationId, Message};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// A repository that keeps conversations in a map.
pub struct InMemoryRepository {
    conversations: Arc<RwLock<BTreeMap<ConversationId, Vec<Message>>>>,
    offline: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            conversations: Arc::new(RwLock::new(BTreeMap::new())),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable` (outage simulation).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), MemoryError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(MemoryError::Unavailable("in-memory store is offline".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatMemoryRepository for InMemoryRepository {
    fn name(&self) -> &str { "in_memory" }

    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, MemoryError> {
        self.check()?;
        Ok(self
            .conversations
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<(), MemoryError> {
        self.check()?;
        self.conversations
            .write()
            .await
            .insert(conversation_id.clone(), messages.to_vec());
        Ok(())
    }

    async fn delete(&self, conversation_id: &ConversationId) -> Result<(), MemoryError> {
        self.check()?;
        self.conversations.write().await.remove(conversation_id);
        Ok(())
    }

    async fn conversation_ids(&self) -> Result<Vec<ConversationId>, MemoryError> {
        self.check()?;
        Ok(self.conversations.read().await.keys().cloned().collect())
    }
}
