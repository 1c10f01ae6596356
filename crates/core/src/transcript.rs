//! Message Stream Assembler
//!
//! Reassembles start/delta/complete framed assistant replies into the
//! insertion-ordered transcript owned by a session.

use crate::models::{Message, Sender, VoicePriority};
use crate::protocol::ServerFrame;
use tracing::{debug, warn};

/// Shown in place of an assistant reply that finished with no text.
pub const EMPTY_RESPONSE_APOLOGY: &str =
    "I'm sorry, I couldn't generate a response. Please try again.";

/// What a frame did to the transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptChange {
    /// The frame did not concern the transcript.
    Unchanged,
    /// A streaming message was created or extended.
    Streaming,
    /// An assistant message was finalized; carries a copy of it.
    Finalized(Message),
}

#[derive(Debug, Default, Clone)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a transcript from persisted messages.
    ///
    /// Messages that were still streaming when persisted are finalized so a
    /// stale stream can never be extended after a reload.
    pub fn restore(messages: Vec<Message>) -> Self {
        let mut transcript = Self { messages };
        for index in 0..transcript.messages.len() {
            if transcript.messages[index].is_streaming {
                transcript.finalize_at(index, None);
            }
        }
        transcript
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The last `n` messages in insertion order.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn push_user(&mut self, text: &str) -> Message {
        let message = Message::user(text);
        self.messages.push(message.clone());
        message
    }

    /// Appends an already complete assistant reply.
    pub fn push_assistant(&mut self, text: &str) -> Message {
        self.messages.push(Message::streaming(""));
        let index = self.messages.len() - 1;
        self.finalize_at(index, Some(text))
    }

    fn streaming_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.is_streaming)
    }

    /// Finalizes the message at `index`, substituting the apology for blank text.
    fn finalize_at(&mut self, index: usize, replacement: Option<&str>) -> Message {
        let message = &mut self.messages[index];
        if let Some(text) = replacement.filter(|t| !t.trim().is_empty()) {
            message.content = text.to_string();
        }
        if message.content.trim().is_empty() {
            warn!(message_id = %message.id, "Assistant reply was empty; showing apology instead");
            message.content = EMPTY_RESPONSE_APOLOGY.to_string();
        }
        message.is_streaming = false;
        message.clone()
    }

    /// Applies one inbound frame to the transcript.
    pub fn apply(&mut self, frame: &ServerFrame) -> TranscriptChange {
        match frame {
            ServerFrame::ChatResponseStart { content } => {
                if let Some(index) = self.streaming_index() {
                    debug!("New reply started while another was streaming; finalizing the old one");
                    self.finalize_at(index, None);
                }
                self.messages
                    .push(Message::streaming(content.clone().unwrap_or_default()));
                TranscriptChange::Streaming
            }
            ServerFrame::ChatResponseDelta { content } => {
                let fragment = content.as_deref().unwrap_or("");
                match self.streaming_index() {
                    Some(index) => self.messages[index].content.push_str(fragment),
                    None => self.messages.push(Message::streaming(fragment)),
                }
                TranscriptChange::Streaming
            }
            ServerFrame::ChatResponseComplete {
                content,
                voice_priority,
            } => {
                let index = match self.streaming_index() {
                    Some(index) => index,
                    None => {
                        self.messages.push(Message::streaming(""));
                        self.messages.len() - 1
                    }
                };
                self.messages[index].voice_priority = *voice_priority;
                TranscriptChange::Finalized(self.finalize_at(index, content.as_deref()))
            }
            ServerFrame::ChatResponse(body) | ServerFrame::Response(body) => {
                TranscriptChange::Finalized(self.push_assistant(body.text()))
            }
            _ => TranscriptChange::Unchanged,
        }
    }

    /// Marks a finalized assistant message for spoken output.
    pub fn flag_for_voice(&mut self, id: uuid::Uuid, priority: VoicePriority) {
        if let Some(message) = self
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.sender == Sender::Assistant)
        {
            message.voice_priority = Some(priority);
        }
    }
}
