//! Chat memory: bounded, per-conversation message history.
//!
//! The pipeline only ever sees [`ChatMemory`]: append and read a window.
//! How messages are made durable is a [`ChatMemoryRepository`] concern.

use crate::error::MemoryError;
use crate::message::{ConversationId, Message};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// A snapshot of one conversation's history.
///
/// Holds at most one pinned system message and a bounded run of
/// non-system messages, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryWindow {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Message>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl MemoryWindow {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            system: None,
            messages: Vec::new(),
        }
    }

    /// Build a window from stored messages, keeping the latest system
    /// message pinned and the newest `size` non-system messages.
    pub fn from_messages(
        conversation_id: ConversationId,
        stored: impl IntoIterator<Item = Message>,
        size: usize,
    ) -> Self {
        let mut window = Self::empty(conversation_id);
        for message in stored {
            window.push(message);
        }
        window.evict_to(size);
        window
    }

    /// Append without enforcing the bound. A system message replaces the
    /// pinned one.
    pub fn push(&mut self, message: Message) {
        if message.is_system() {
            self.system = Some(message);
        } else {
            self.messages.push(message);
        }
    }

    /// Drop the oldest non-system messages until at most `size` remain.
    /// Returns how many were evicted.
    pub fn evict_to(&mut self, size: usize) -> usize {
        let excess = self.messages.len().saturating_sub(size);
        if excess > 0 {
            self.messages.drain(..excess);
        }
        excess
    }

    /// System message first, then the rest in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.system.iter().chain(self.messages.iter())
    }

    /// All messages in storage order.
    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// The newest message.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last().or(self.system.as_ref())
    }

    /// Number of messages including the pinned system message.
    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.system.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.system.is_none() && self.messages.is_empty()
    }
}

/// Per-conversation async mutexes.
///
/// Entries are created on first use and pruned once no guard or waiter
/// holds them.
#[derive(Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to one conversation.
    pub async fn acquire(&self, conversation_id: &ConversationId) -> TurnGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(conversation_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        TurnGuard {
            conversation_id: conversation_id.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Number of conversations with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive hold on one conversation; released on drop.
pub struct TurnGuard {
    conversation_id: ConversationId,
    _guard: OwnedMutexGuard<()>,
}

impl TurnGuard {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

impl std::fmt::Debug for TurnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnGuard")
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

/// The memory surface the pipeline uses.
///
/// `read` returns a snapshot. Appends for one conversation are serialized;
/// different conversations are independent. A pipeline turn holds
/// [`ChatMemory::lock_turn`] from its read until its write so that turns
/// for one conversation never interleave.
#[async_trait]
pub trait ChatMemory: Send + Sync {
    /// Hold the conversation for a whole read-model-write turn.
    async fn lock_turn(&self, conversation_id: &ConversationId) -> TurnGuard;

    async fn append(&self, conversation_id: &ConversationId, message: Message)
        -> std::result::Result<(), MemoryError>;

    /// Append several messages as one atomic step.
    async fn append_all(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
    ) -> std::result::Result<(), MemoryError>;

    async fn read(&self, conversation_id: &ConversationId)
        -> std::result::Result<MemoryWindow, MemoryError>;

    async fn clear(&self, conversation_id: &ConversationId) -> std::result::Result<(), MemoryError>;
}

/// Durable storage of conversation messages, one row per message keyed by
/// `(conversation_id, seq)`.
#[async_trait]
pub trait ChatMemoryRepository: Send + Sync {
    /// The backend name (e.g., "sqlite", "postgres", "in_memory").
    fn name(&self) -> &str;

    /// All stored messages for a conversation, in sequence order.
    async fn load(&self, conversation_id: &ConversationId)
        -> std::result::Result<Vec<Message>, MemoryError>;

    /// Replace a conversation's messages in a single transaction.
    async fn replace(
        &self,
        conversation_id: &ConversationId,
        messages: &[Message],
    ) -> std::result::Result<(), MemoryError>;

    async fn delete(&self, conversation_id: &ConversationId) -> std::result::Result<(), MemoryError>;

    async fn conversation_ids(&self) -> std::result::Result<Vec<ConversationId>, MemoryError>;
}
