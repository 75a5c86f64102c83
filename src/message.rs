use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A turn in a session's conversation.
///
/// Messages are the unit the storage coordinator fans out: every accepted
/// user turn and every final model reply becomes exactly one `Message`.
/// A message is never mutated after creation; the tuple
/// `(session, content, timestamp)` is its archive deduplication key.
///
/// # Examples
///
/// ```
/// use taskweft::message::{Message, MessageRole};
///
/// let msg = Message::user("sess_1", "What's the weather like?");
/// assert_eq!(msg.role, MessageRole::User);
/// assert_eq!(msg.content(), "What's the weather like?");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Session that owns this message.
    pub session_id: String,
    /// Who produced the message.
    pub role: MessageRole,
    /// Ordered content parts.
    pub parts: Vec<MessagePart>,
    /// Wall-clock timestamp; non-decreasing within a session because the
    /// session executor is the single writer.
    pub timestamp: DateTime<Utc>,
    /// Tool calls the model requested while producing this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

/// The sender of a [`Message`]; the archive only knows these two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Model => "model",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a message: text, or an opaque media reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Media { uri: String, mime_type: String },
}

/// Record of a tool call the model emitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Message {
    /// Creates a message with a single text part, timestamped now.
    #[must_use]
    pub fn text(session_id: &str, role: MessageRole, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            role,
            parts: vec![MessagePart::Text {
                text: content.to_string(),
            }],
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(session_id: &str, content: &str) -> Self {
        Self::text(session_id, MessageRole::User, content)
    }

    /// Creates a model message.
    #[must_use]
    pub fn model(session_id: &str, content: &str) -> Self {
        Self::text(session_id, MessageRole::Model, content)
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Media { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Timestamp as nanoseconds since the epoch, the archive's dedup key
    /// component. Falls back to microsecond resolution near the i64 edge.
    #[must_use]
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000))
    }
}
