//! Turn-Taking Coordinator
//!
//! Arbitrates the single audio output channel between the user's live speech
//! and synthesized assistant speech. It never talks over the user and never
//! speaks replies that were not explicitly flagged for voice output.

use crate::models::{Message, Sender, VoicePriority};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Silence required after the user's last speech before the assistant may speak.
pub const SILENCE_WINDOW: Duration = Duration::from_millis(2_000);

/// A unit of synthesized speech waiting for, or holding, the output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: Uuid,
    pub message_id: Uuid,
    pub text: String,
    pub priority: VoicePriority,
}

impl Utterance {
    /// Builds an utterance for a finalized, voice-flagged assistant message.
    pub fn for_message(message: &Message) -> Option<Self> {
        if message.sender != Sender::Assistant || message.is_streaming {
            return None;
        }
        let priority = message.voice_priority?;
        Some(Self {
            id: Uuid::new_v4(),
            message_id: message.id,
            text: message.content.clone(),
            priority,
        })
    }
}

/// Instructions for whoever owns the physical audio output.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackDirective {
    Start(Utterance),
    Stop(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SpeechRejected {
    #[error("voice mode is off")]
    VoiceModeOff,
    #[error("nothing to say")]
    EmptyText,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnState {
    pub user_speaking: bool,
    pub assistant_speaking: bool,
    pub last_silence_at: Option<Instant>,
}

#[derive(Debug)]
pub struct TurnCoordinator {
    state: TurnState,
    voice_mode: bool,
    silence_window: Duration,
    queue: VecDeque<Utterance>,
    active: Option<Utterance>,
}

impl Default for TurnCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnCoordinator {
    pub fn new() -> Self {
        Self::with_silence_window(SILENCE_WINDOW)
    }

    pub fn with_silence_window(silence_window: Duration) -> Self {
        Self {
            state: TurnState::default(),
            voice_mode: false,
            silence_window,
            queue: VecDeque::new(),
            active: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn voice_mode(&self) -> bool {
        self.voice_mode
    }

    pub fn active(&self) -> Option<&Utterance> {
        self.active.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Utterance> {
        self.queue.iter()
    }

    /// Enables or disables spoken replies. Turning voice off silences and
    /// forgets everything pending.
    pub fn set_voice_mode(&mut self, enabled: bool) -> Option<PlaybackDirective> {
        self.voice_mode = enabled;
        if enabled {
            return None;
        }
        self.clear()
    }

    /// Drops the queue and releases the output channel.
    pub fn clear(&mut self) -> Option<PlaybackDirective> {
        self.queue.clear();
        self.state.user_speaking = false;
        self.release()
    }

    fn release(&mut self) -> Option<PlaybackDirective> {
        self.state.assistant_speaking = false;
        self.active.take().map(|u| PlaybackDirective::Stop(u.id))
    }

    /// Queues an utterance for playback.
    ///
    /// An urgent utterance discards every queued normal one and goes ahead of
    /// them, but never interrupts the utterance already playing.
    pub fn request_speech(&mut self, utterance: Utterance) -> Result<(), SpeechRejected> {
        if !self.voice_mode {
            return Err(SpeechRejected::VoiceModeOff);
        }
        if utterance.text.trim().is_empty() {
            return Err(SpeechRejected::EmptyText);
        }
        if utterance.priority == VoicePriority::Urgent {
            self.queue.retain(|queued| queued.priority == VoicePriority::Urgent);
        }
        self.queue.push_back(utterance);
        Ok(())
    }

    /// Handles voice onset. Any playing utterance is stopped immediately.
    pub fn on_speech_start(&mut self, _now: Instant) -> Option<PlaybackDirective> {
        self.state.user_speaking = true;
        self.release()
    }

    /// Handles the end of user speech, recording when the silence began.
    pub fn on_speech_end(&mut self, silence_started: Instant) {
        self.state.user_speaking = false;
        self.state.last_silence_at = Some(silence_started);
    }

    /// Frees the output channel once `id` finished playing. Returns false for a
    /// stale notification about an utterance that is no longer active.
    pub fn on_playback_finished(&mut self, id: Uuid) -> bool {
        if self.active.as_ref().is_some_and(|u| u.id == id) {
            self.release();
            return true;
        }
        false
    }

    fn silence_satisfied(&self, now: Instant) -> bool {
        match self.state.last_silence_at {
            Some(silence) => now.saturating_duration_since(silence) >= self.silence_window,
            None => true,
        }
    }

    /// Starts the next queued utterance if the user has been quiet long enough.
    pub fn poll(&mut self, now: Instant) -> Option<PlaybackDirective> {
        if self.active.is_some() || self.state.user_speaking || !self.silence_satisfied(now) {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.state.assistant_speaking = true;
        self.active = Some(next.clone());
        Some(PlaybackDirective::Start(next))
    }

    /// When `poll` could next succeed, if anything is waiting.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self.queue.is_empty() || self.active.is_some() || self.state.user_speaking {
            return None;
        }
        match self.state.last_silence_at {
            Some(silence) => Some((silence + self.silence_window).max(now)),
            None => Some(now),
        }
    }
}
