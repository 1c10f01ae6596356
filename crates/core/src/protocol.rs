//! Defines the WebSocket frame protocol between the session and the assistant backend.

use crate::models::{Message, Sender, UserLocation, VoicePriority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of trailing transcript messages sent as `conversation_history`.
pub const HISTORY_CONTEXT_TURNS: usize = 6;

/// Frames sent from the session to the backend.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Sent immediately after every successful connect.
    Init { context: InitContext },
    /// A user chat message, always requesting a streamed reply.
    Chat {
        message: String,
        stream: bool,
        context: ChatContext,
    },
    /// Liveness reply to a server `ping`, stamped in epoch milliseconds.
    Pong { timestamp: i64 },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InitContext {
    pub user_id: String,
    #[serde(rename = "userLocation", skip_serializing_if = "Option::is_none")]
    pub user_location: Option<UserLocation>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChatContext {
    pub user_id: String,
    #[serde(rename = "userLocation", skip_serializing_if = "Option::is_none")]
    pub user_location: Option<UserLocation>,
    pub conversation_history: Vec<HistoryEntry>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub role: Sender,
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.sender,
            content: message.content.clone(),
        }
    }
}

impl ClientFrame {
    pub fn init(user_id: &str, user_location: Option<UserLocation>, session_id: Uuid) -> Self {
        ClientFrame::Init {
            context: InitContext {
                user_id: user_id.to_string(),
                user_location,
                session_id,
                timestamp: Utc::now(),
            },
        }
    }

    /// Builds a chat frame carrying the tail of `history` as context.
    pub fn chat(
        text: &str,
        user_id: &str,
        user_location: Option<UserLocation>,
        session_id: Uuid,
        history: &[Message],
    ) -> Self {
        let start = history.len().saturating_sub(HISTORY_CONTEXT_TURNS);
        ClientFrame::Chat {
            message: text.to_string(),
            stream: true,
            context: ChatContext {
                user_id: user_id.to_string(),
                user_location,
                conversation_history: history[start..].iter().map(HistoryEntry::from).collect(),
                session_id,
                timestamp: Utc::now(),
            },
        }
    }

    pub fn pong() -> Self {
        ClientFrame::Pong {
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Frames received from the backend.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Opens a streamed reply, optionally with placeholder text.
    ChatResponseStart {
        #[serde(default)]
        content: Option<String>,
    },
    /// One fragment of a streamed reply.
    ChatResponseDelta {
        #[serde(default)]
        content: Option<String>,
    },
    /// Closes the streamed reply.
    ChatResponseComplete {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        voice_priority: Option<VoicePriority>,
    },
    /// A whole reply delivered at once.
    ChatResponse(FullResponse),
    /// Legacy spelling of `chat_response`.
    Response(FullResponse),
    UiAction(CommandFrame),
    VisualAction(CommandFrame),
    Ping {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Body of a non-streaming reply. Backends disagree on the field name.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FullResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
}

impl FullResponse {
    /// The first non-empty text among `content`, `message` and `response`.
    pub fn text(&self) -> &str {
        [&self.content, &self.message, &self.response]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|text| !text.trim().is_empty())
            .unwrap_or("")
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct CommandFrame {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Malformed frame: {reason}")]
pub struct MalformedFrame {
    pub reason: String,
    /// The raw payload, when it reads like something a person could understand.
    pub fallback_text: Option<String>,
}

/// Decodes one inbound text frame.
pub fn parse_server_frame(raw: &str) -> Result<ServerFrame, MalformedFrame> {
    serde_json::from_str(raw).map_err(|e| MalformedFrame {
        reason: e.to_string(),
        fallback_text: plausible_text(raw).map(str::to_string),
    })
}

/// Returns the trimmed payload if it looks like prose rather than broken JSON or binary noise.
pub fn plausible_text(raw: &str) -> Option<&str> {
    let text = raw.trim();
    if text.is_empty() || text.starts_with('{') || text.starts_with('[') {
        return None;
    }
    let total = text.chars().count();
    let control = text
        .chars()
        .filter(|c| c.is_control() && !c.is_whitespace())
        .count();
    let alphabetic = text.chars().filter(|c| c.is_alphabetic()).count();
    if control > 0 || alphabetic * 2 < total {
        return None;
    }
    Some(text)
}
