//! Column encoding shared by the SQL repositories.

use chrono::{DateTime, Utc};
use parley_core::error::MemoryError;
use parley_core::message::{ConversationId, Message, MessageToolCall, Role};

/// A message flattened into `chat_messages` columns.
pub(crate) struct MessageRow {
    pub id: String,
    pub role: &'static str,
    pub content: String,
    pub tool_calls: String,
    pub tool_call_id: Option<String>,
    pub timestamp: String,
}

impl MessageRow {
    pub fn encode(message: &Message) -> Result<Self, MemoryError> {
        let tool_calls = serde_json::to_string(&message.tool_calls)
            .map_err(|e| MemoryError::Unavailable(format!("tool_calls serialization: {e}")))?;
        Ok(Self {
            id: message.id.clone(),
            role: message.role.as_str(),
            content: message.content.clone(),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
            timestamp: message.timestamp.to_rfc3339(),
        })
    }
}

/// Rebuild a message from raw column values.
pub(crate) fn decode(
    conversation_id: &ConversationId,
    id: String,
    role: &str,
    content: String,
    tool_calls: &str,
    tool_call_id: Option<String>,
    timestamp: &str,
) -> Result<Message, MemoryError> {
    let corrupt = |reason: String| MemoryError::Corrupt {
        conversation_id: conversation_id.to_string(),
        reason,
    };

    let role = Role::parse(role).ok_or_else(|| corrupt(format!("unknown role '{role}'")))?;
    let tool_calls: Vec<MessageToolCall> = serde_json::from_str(tool_calls)
        .map_err(|e| corrupt(format!("tool_calls of {id}: {e}")))?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("timestamp of {id}: {e}")))?;

    Ok(Message {
        id,
        role,
        content,
        tool_calls,
        tool_call_id,
        timestamp,
    })
}
