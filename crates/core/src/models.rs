//! Session Data Model
//!
//! The transcript messages, connection states and the persisted conversation
//! snapshot shared by the assembler, the connector and the snapshot store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of messages mirrored into the durable conversation snapshot.
pub const SNAPSHOT_MESSAGE_LIMIT: usize = 10;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "user"),
            Sender::Assistant => write!(f, "assistant"),
        }
    }
}

/// Priority hint for messages that should be spoken aloud.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum VoicePriority {
    Normal,
    Urgent,
}

/// A single transcript entry.
///
/// Content is append-only while `is_streaming` is set and immutable after the
/// message has been finalized.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_priority: Option<VoicePriority>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::finalized(Sender::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::finalized(Sender::Assistant, content)
    }

    fn finalized(sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            voice_priority: None,
        }
    }

    /// Creates an assistant message that is still receiving deltas.
    pub fn streaming(content: impl Into<String>) -> Self {
        Self {
            is_streaming: true,
            ..Self::assistant(content)
        }
    }
}

/// Connection lifecycle of the realtime socket.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Best-effort position attached to outbound context.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct UserLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// The locally persisted view of a conversation, keyed by user id.
///
/// Used only to pre-populate the transcript on reload or reconnect; the server
/// remains authoritative.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl ConversationSnapshot {
    /// Builds a snapshot from the tail of a transcript.
    pub fn capture(messages: &[Message], session_id: Uuid) -> Self {
        let start = messages.len().saturating_sub(SNAPSHOT_MESSAGE_LIMIT);
        Self {
            messages: messages[start..].to_vec(),
            session_id,
            timestamp: Utc::now(),
        }
    }
}
