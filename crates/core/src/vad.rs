//! Energy-based voice activity detection.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS level (on samples normalized to [-1, 1]) at or above which a frame is speech.
    pub energy_threshold: f32,
    /// Contiguous silence required before speech is considered finished.
    pub hangover: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            hangover: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart { at: Instant },
    /// `silence_started` is the first silent frame after the speech.
    SpeechEnd { silence_started: Instant },
}

/// Root mean square of normalized f32 samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    speaking: bool,
    silence_since: Option<Instant>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speaking: false,
            silence_since: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Classifies one frame observed at `now`, emitting an event on a transition.
    pub fn process(&mut self, samples: &[f32], now: Instant) -> Option<VadEvent> {
        let is_speech = rms(samples) >= self.config.energy_threshold;

        if is_speech {
            self.silence_since = None;
            if !self.speaking {
                self.speaking = true;
                return Some(VadEvent::SpeechStart { at: now });
            }
            return None;
        }

        if !self.speaking {
            return None;
        }
        let silence_started = *self.silence_since.get_or_insert(now);
        if now.saturating_duration_since(silence_started) >= self.config.hangover {
            self.speaking = false;
            self.silence_since = None;
            return Some(VadEvent::SpeechEnd { silence_started });
        }
        None
    }

    /// Forgets any in-progress speech, e.g. when the microphone is detached.
    pub fn reset(&mut self) {
        self.speaking = false;
        self.silence_since = None;
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(VadConfig::default())
    }
}
