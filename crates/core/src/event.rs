//! Pipeline events.
//!
//! Turns, tool calls, connection changes and refused callers are published
//! here for whoever is listening (the gateway logs, tests assert on them).
//! Publishing never blocks and never fails a turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A pipeline turn finished and was persisted
    TurnCompleted {
        conversation_id: String,
        model: String,
        tool_calls: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A remote provider connection moved to a new state
    ConnectionStateChanged {
        provider: String,
        generation: u64,
        state: String,
        timestamp: DateTime<Utc>,
    },

    /// Retrieval failed and the turn continued without context
    RetrievalDegraded {
        conversation_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// An inbound request or tool call was refused for lack of identity
    AuthFailure {
        context: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out of [`DomainEvent`]s to every live subscriber.
///
/// Slow subscribers lag and lose the oldest events rather than holding
/// up publishers.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// `capacity` events are buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        if self.sender.send(Arc::new(event)).is_err() {
            tracing::trace!("Event dropped, nobody subscribed");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
