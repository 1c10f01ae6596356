//! Audio plumbing between the session and the host's capture and playback devices.

use base64::Engine;
use pam_core::MediaError;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One chunk of mono microphone samples normalized to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Builds a frame from little-endian PCM16 bytes as delivered by most capture APIs.
    /// A trailing odd byte is dropped.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Builds a frame from base64-encoded PCM16. Undecodable input yields an empty frame.
    pub fn from_base64_pcm16(base64_fragment: &str, sample_rate: u32) -> Self {
        match base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
            Ok(bytes) => Self::from_pcm16_le(&bytes, sample_rate),
            Err(e) => {
                tracing::error!("Failed to decode base64 audio frame: {}", e);
                Self::new(Vec::new(), sample_rate)
            }
        }
    }

    /// The samples as PCM16, clipping anything outside [-1, 1].
    pub fn to_pcm16(&self) -> Vec<i16> {
        let peak = f32::from(i16::MAX);
        self.samples
            .iter()
            .map(|&sample| (sample * peak).clamp(f32::from(i16::MIN), peak) as i16)
            .collect()
    }
}

/// Something that can be played on the output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechClip {
    /// Encoded audio, e.g. `audio/mpeg`.
    Audio { bytes: Vec<u8>, mime: String },
    /// No audio could be produced; the host may use a local synthesizer or just show the text.
    Text(String),
}

/// Handed to the output with every clip; reports when playback ends.
#[derive(Debug, Clone)]
pub struct PlaybackNotifier {
    id: Uuid,
    tx: mpsc::UnboundedSender<Uuid>,
}

impl PlaybackNotifier {
    pub(crate) fn new(id: Uuid, tx: mpsc::UnboundedSender<Uuid>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Signals that the clip finished (or was abandoned by the device).
    pub fn finished(self) {
        // The session may already be gone; nothing to report to then.
        let _ = self.tx.send(self.id);
    }
}

/// The host's single audio output channel.
pub trait AudioOutput: Send + Sync {
    /// Starts playing `clip`. `done.finished()` must be called once it ends naturally.
    fn play(&self, clip: SpeechClip, done: PlaybackNotifier) -> Result<(), MediaError>;
    /// Stops the clip with the given id immediately. Unknown ids are ignored.
    fn stop(&self, id: Uuid);
}
