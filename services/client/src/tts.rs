//! Speech synthesis for voice-flagged replies.

use crate::audio::SpeechClip;
use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use url::Url;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<SpeechClip>;
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
}

/// JSON shape returned when the endpoint did not stream audio directly.
#[derive(Deserialize, Default)]
struct SynthesisBody {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default, alias = "fallback")]
    text: Option<String>,
}

/// Interprets a synthesis response body, falling back to the spoken text.
fn clip_from_response(content_type: &str, bytes: Vec<u8>, text: &str) -> SpeechClip {
    if content_type.starts_with("audio/") {
        return SpeechClip::Audio {
            bytes,
            mime: content_type.to_string(),
        };
    }

    let body: SynthesisBody = serde_json::from_slice(&bytes).unwrap_or_default();
    if let Some(encoded) = body.audio.filter(|a| !a.is_empty()) {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => {
                return SpeechClip::Audio {
                    bytes,
                    mime: body.mime_type.unwrap_or_else(|| "audio/mpeg".to_string()),
                };
            }
            Err(e) => warn!("Synthesis returned undecodable audio: {}", e),
        }
    }
    SpeechClip::Text(body.text.unwrap_or_else(|| text.to_string()))
}

pub struct HttpSpeechSynthesizer {
    client: reqwest::Client,
    url: Url,
    voice: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(url: Url, voice: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            voice: voice.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    #[instrument(skip(self, text), fields(chars = text.len()))]
    async fn synthesize(&self, text: &str) -> anyhow::Result<SpeechClip> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&SynthesisRequest {
                text,
                voice: &self.voice,
            })
            .send()
            .await
            .context("Speech synthesis request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("Speech synthesis returned status {}", status);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .context("Failed to read synthesized audio")?;
        Ok(clip_from_response(&content_type, bytes.to_vec(), text))
    }
}
