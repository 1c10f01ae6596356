//! Terminal client for the PAM assistant.
//!
//! Reads lines from stdin and sends them as chat messages. Lines starting
//! with `/` are commands: `/connect`, `/disconnect`, `/voice on|off`, `/quit`.
//! UI commands from the assistant are printed instead of applied, and
//! "spoken" replies are printed with a speaker marker.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use pam_client::{
    PamSession, SendOptions, SessionDeps, SessionEvent, SessionHandle, SessionOptions,
    audio::{AudioOutput, PlaybackNotifier, SpeechClip},
    auth::{RefreshingTokenProvider, StaticTokenProvider, TokenProvider},
    config::Config,
    fallback::{ChatFallback, HttpChatFallback},
    store::FileSnapshotStore,
    tts::{HttpSpeechSynthesizer, SpeechSynthesizer},
};
use pam_core::actions::{DispatchError, Toast, UiSurface};
use pam_core::{MediaError, Sender};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(version, about = "Chat with the PAM assistant from a terminal")]
struct Args {
    /// Overrides PAM_USER_ID.
    #[arg(long)]
    user_id: Option<String>,
    /// Ask for every reply to be spoken.
    #[arg(long)]
    voice: bool,
    /// Start without connecting; messages go through the HTTP fallback if configured.
    #[arg(long)]
    offline: bool,
}

struct TerminalSurface;

impl UiSurface for TerminalSurface {
    fn navigate(&self, route: &str) -> Result<(), DispatchError> {
        println!("[ui] navigate to {}", route);
        Ok(())
    }

    fn set_field(&self, form_id: &str, field: &str, value: &Value) -> Result<(), DispatchError> {
        println!("[ui] {}.{} = {}", form_id, field, value);
        Ok(())
    }

    fn set_highlight(&self, element: &str, on: bool) -> Result<(), DispatchError> {
        if on {
            println!("[ui] highlight {}", element);
        }
        Ok(())
    }

    fn show_toast(&self, toast: &Toast) -> Result<(), DispatchError> {
        match &toast.title {
            Some(title) => println!("[{:?}] {}: {}", toast.severity, title, toast.message),
            None => println!("[{:?}] {}", toast.severity, toast.message),
        }
        Ok(())
    }
}

struct TerminalAudio;

impl AudioOutput for TerminalAudio {
    fn play(&self, clip: SpeechClip, done: PlaybackNotifier) -> Result<(), MediaError> {
        match clip {
            SpeechClip::Text(text) => println!("🔊 {}", text),
            SpeechClip::Audio { bytes, mime } => {
                println!("🔊 <{} bytes of {}>", bytes.len(), mime)
            }
        }
        done.finished();
        Ok(())
    }

    fn stop(&self, id: Uuid) {
        info!(%id, "Playback stopped");
    }
}

fn token_provider(config: &Config) -> Arc<dyn TokenProvider> {
    let expires_at = config
        .token_ttl
        .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| Utc::now() + ttl);
    match (&config.refresh_url, &config.refresh_token) {
        (Some(url), Some(refresh_token)) => Arc::new(RefreshingTokenProvider::new(
            url.clone(),
            refresh_token,
            config.access_token.as_deref(),
            expires_at,
        )),
        _ => Arc::new(StaticTokenProvider::new(
            config.access_token.as_deref(),
            expires_at,
        )),
    }
}

/// Prints finalized replies and notable events until the session goes away.
async fn print_events(handle: SessionHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageFinalized(message)) if message.sender == Sender::Assistant => {
                println!("PAM: {}", message.content);
            }
            Ok(SessionEvent::StatusChanged(state)) => println!("-- {}", state),
            Ok(SessionEvent::CannotConnect(reason)) => {
                println!("-- Cannot reach PAM right now: {}", reason)
            }
            Ok(SessionEvent::ServerError(message)) => println!("-- PAM error: {}", message),
            Ok(SessionEvent::Media(e)) => println!("-- {}", e.user_guidance()),
            Ok(SessionEvent::Notice(notice)) => println!("-- {}", notice),
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event printer skipped {} events", n)
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_repl(handle: SessionHandle, speak: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        let result = match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/connect" => handle.connect().await,
            "/disconnect" => handle.disconnect().await,
            "/voice on" => handle.set_voice_mode(true).await,
            "/voice off" => handle.set_voice_mode(false).await,
            text => {
                handle
                    .send_message_with(text, SendOptions { speak_reply: speak })
                    .await
            }
        };
        if let Err(e) = result {
            println!("-- {}", e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if args.user_id.is_some() {
        config.user_id = args.user_id.clone();
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Starting PAM session...");

    // --- 3. Build Collaborators ---
    let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = config
        .tts_url
        .clone()
        .map(|url| Arc::new(HttpSpeechSynthesizer::new(url, config.tts_voice.clone())) as _);
    let fallback: Option<Arc<dyn ChatFallback>> = config
        .fallback_url
        .clone()
        .map(|url| Arc::new(HttpChatFallback::new(url)) as _);

    let session = PamSession::init(SessionDeps {
        options: SessionOptions::from(&config),
        tokens: token_provider(&config),
        store: Arc::new(FileSnapshotStore::new(config.store_dir.clone())),
        surface: Arc::new(TerminalSurface),
        audio: Arc::new(TerminalAudio),
        synthesizer,
        fallback,
    })
    .await;
    let handle = session.handle();

    for message in handle.transcript().borrow().iter() {
        println!("{}: {}", message.sender, message.content);
    }
    tokio::spawn(print_events(handle.clone()));

    if args.voice {
        handle.set_voice_mode(true).await?;
    }
    if !args.offline {
        if let Err(e) = handle.connect().await {
            println!("-- {}", e);
        }
    }

    // --- 4. Run Until Quit or Ctrl+C ---
    tokio::select! {
        result = run_repl(handle.clone(), args.voice) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal. Shutting down gracefully..."),
    }

    session.dispose().await;
    Ok(())
}
