//! Push-to-talk style capture of a single utterance from the live microphone.

use crate::audio::AudioFrame;
use base64::Engine;
use std::time::{Duration, Instant};

/// Recordings stop on their own after this long.
pub const MAX_RECORDING_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub duration: Duration,
    /// True when the recording hit the time limit instead of being stopped.
    pub auto_stopped: bool,
}

impl RecordedClip {
    /// Base64 little-endian PCM16, the form the assistant's upload endpoints take.
    pub fn to_base64(&self) -> String {
        let bytes: Vec<u8> = self
            .samples
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect();
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }
}

#[derive(Debug)]
pub struct Recorder {
    started_at: Instant,
    limit: Duration,
    samples: Vec<i16>,
    sample_rate: Option<u32>,
}

impl Recorder {
    pub fn start(now: Instant, limit: Duration) -> Self {
        Self {
            started_at: now,
            limit,
            samples: Vec::new(),
            sample_rate: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.limit
    }

    /// Appends a frame unless the recording has already run past its limit.
    pub fn push(&mut self, frame: &AudioFrame, now: Instant) {
        if now >= self.deadline() {
            return;
        }
        self.sample_rate.get_or_insert(frame.sample_rate);
        self.samples.extend(frame.to_pcm16());
    }

    pub fn finish(self, now: Instant, auto_stopped: bool) -> RecordedClip {
        let elapsed = now.saturating_duration_since(self.started_at).min(self.limit);
        RecordedClip {
            samples: self.samples,
            sample_rate: self.sample_rate.unwrap_or(0),
            duration: elapsed,
            auto_stopped,
        }
    }
}
