//! The PAM session: one actor task owning the socket, the transcript, the
//! turn-taking state and the UI dispatcher, driven by a `tokio::select!` loop.
//!
//! Callers talk to it through a cloneable [`SessionHandle`]; everything the
//! actor learns flows back out through watch channels (status, transcript)
//! and a broadcast channel of [`SessionEvent`]s.

use crate::audio::{AudioFrame, AudioOutput, PlaybackNotifier, SpeechClip};
use crate::auth::{TokenProvider, valid_token};
use crate::config::Config;
use crate::connector::{
    self, DEFAULT_CONNECT_TIMEOUT, WsSink, WsSource, authenticated_url, classify_close,
    close_normally, send_frame,
};
use crate::dispatcher::ActionDispatcher;
use crate::fallback::{ChatFallback, FallbackRequest};
use crate::recording::{MAX_RECORDING_DURATION, RecordedClip, Recorder};
use crate::store::SnapshotStore;
use crate::tts::SpeechSynthesizer;
use futures_util::StreamExt;
use pam_core::actions::UiSurface;
use pam_core::models::UserLocation;
use pam_core::protocol::{ClientFrame, HistoryEntry, ServerFrame, parse_server_frame};
use pam_core::reconnect::{CloseKind, ReconnectDecision, ReconnectPolicy};
use pam_core::transcript::{Transcript, TranscriptChange};
use pam_core::turn::{PlaybackDirective, SILENCE_WINDOW, TurnCoordinator, Utterance};
use pam_core::vad::{VadConfig, VadEvent, VoiceActivityDetector};
use pam_core::{
    ConnectionState, ConversationSnapshot, MediaError, Message, SessionError, VoicePriority,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 32;

/// Tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ws_url: Url,
    pub user_id: Option<String>,
    pub user_location: Option<UserLocation>,
    pub vad: VadConfig,
    pub silence_window: Duration,
    pub recording_limit: Duration,
    pub connect_timeout: Duration,
}

impl SessionOptions {
    pub fn new(ws_url: Url, user_id: Option<String>) -> Self {
        Self {
            ws_url,
            user_id,
            user_location: None,
            vad: VadConfig::default(),
            silence_window: SILENCE_WINDOW,
            recording_limit: MAX_RECORDING_DURATION,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            user_location: config.user_location,
            ..Self::new(config.ws_url.clone(), config.user_id.clone())
        }
    }
}

/// The collaborators a session is built from.
pub struct SessionDeps {
    pub options: SessionOptions,
    pub tokens: Arc<dyn TokenProvider>,
    pub store: Arc<dyn SnapshotStore>,
    pub surface: Arc<dyn UiSurface>,
    pub audio: Arc<dyn AudioOutput>,
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub fallback: Option<Arc<dyn ChatFallback>>,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged(ConnectionState),
    MessageFinalized(Message),
    /// Reconnection was abandoned; the user should be told the assistant is unreachable.
    CannotConnect(String),
    /// The backend reported an error frame.
    ServerError(String),
    AssistantOpened,
    RecordingFinished(RecordedClip),
    Media(MediaError),
    Notice(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Speak the reply to this message. Honored only while voice mode is on.
    pub speak_reply: bool,
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Send {
        text: String,
        options: SendOptions,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    OpenAssistant,
    Inject {
        text: String,
    },
    SetVoiceMode {
        enabled: bool,
    },
    AttachMicrophone {
        frames: mpsc::Receiver<AudioFrame>,
    },
    DetachMicrophone,
    ReportMediaError(MediaError),
    StartRecording {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Option<RecordedClip>>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<ConnectionState>,
    transcript: watch::Receiver<Vec<Message>>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.post(build(tx)).await?;
        rx.await.map_err(|_| SessionError::Disposed)
    }

    async fn post(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Disposed)
    }

    /// Opens the socket. Fails fast when nobody is signed in.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send_message_with(text, SendOptions::default()).await
    }

    /// Sends a chat message. Without a live socket the HTTP fallback is used
    /// if one is configured, otherwise this fails with `NotConnected`.
    pub async fn send_message_with(
        &self,
        text: impl Into<String>,
        options: SendOptions,
    ) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::Send {
            text,
            options,
            reply,
        })
        .await?
    }

    /// Closes the socket normally. No reconnection follows.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    pub async fn open_assistant(&self) -> Result<(), SessionError> {
        self.post(Command::OpenAssistant).await
    }

    /// Opens the assistant and sends `text` on the user's behalf.
    pub async fn inject_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.post(Command::Inject { text: text.into() }).await
    }

    pub async fn set_voice_mode(&self, enabled: bool) -> Result<(), SessionError> {
        self.post(Command::SetVoiceMode { enabled }).await
    }

    /// Feeds live microphone frames to the session. Dropping the receiver
    /// side (which the session does when voice is turned off) tells the host
    /// to close the device.
    pub async fn attach_microphone(
        &self,
        frames: mpsc::Receiver<AudioFrame>,
    ) -> Result<(), SessionError> {
        self.post(Command::AttachMicrophone { frames }).await
    }

    pub async fn detach_microphone(&self) -> Result<(), SessionError> {
        self.post(Command::DetachMicrophone).await
    }

    /// Lets the host report a capture or playback failure.
    pub async fn report_media_error(&self, error: MediaError) -> Result<(), SessionError> {
        self.post(Command::ReportMediaError(error)).await
    }

    pub async fn start_recording(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartRecording { reply })
            .await?
    }

    /// Ends the current recording, returning it if one was running.
    pub async fn stop_recording(&self) -> Result<Option<RecordedClip>, SessionError> {
        self.request(|reply| Command::StopRecording { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn transcript(&self) -> watch::Receiver<Vec<Message>> {
        self.transcript.clone()
    }
}

/// A running session. Dropping it without `dispose` leaves the actor running
/// for as long as any [`SessionHandle`] is alive.
pub struct PamSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl PamSession {
    /// Restores the user's last snapshot, if any, and starts the actor.
    pub async fn init(deps: SessionDeps) -> Self {
        let snapshot = match &deps.options.user_id {
            Some(user_id) => deps.store.load(user_id).await.unwrap_or_else(|e| {
                warn!("Could not load conversation snapshot: {}", e);
                None
            }),
            None => None,
        };
        let (transcript, session_id) = match snapshot {
            Some(snapshot) => {
                info!(
                    messages = snapshot.messages.len(),
                    session_id = %snapshot.session_id,
                    "Restored conversation snapshot"
                );
                (Transcript::restore(snapshot.messages), snapshot.session_id)
            }
            None => (Transcript::new(), Uuid::new_v4()),
        };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (transcript_tx, transcript_rx) = watch::channel(transcript.messages().to_vec());
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (synth_tx, synth_rx) = mpsc::unbounded_channel();
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();

        let SessionDeps {
            options,
            tokens,
            store,
            surface,
            audio,
            synthesizer,
            fallback,
        } = deps;

        let actor = SessionActor {
            turns: TurnCoordinator::with_silence_window(options.silence_window),
            vad: VoiceActivityDetector::new(options.vad),
            options,
            tokens,
            store,
            audio,
            synthesizer,
            fallback,
            dispatcher: ActionDispatcher::new(surface),
            transcript,
            session_id,
            policy: ReconnectPolicy::new(),
            sink: None,
            source: None,
            reconnect_at: None,
            refresh_before_connect: false,
            pending_replies: VecDeque::new(),
            mic: None,
            recorder: None,
            playback_tx,
            playback_rx,
            synth_tx,
            synth_rx,
            fallback_tx,
            fallback_rx,
            events: events.clone(),
            status_tx,
            transcript_tx,
        };
        let task = tokio::spawn(actor.run(command_rx));

        Self {
            handle: SessionHandle {
                commands: command_tx,
                events,
                status: status_rx,
                transcript: transcript_rx,
            },
            task,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Disconnects, silences audio, clears timers and waits for the actor to stop.
    pub async fn dispose(self) {
        if self
            .handle
            .request(|reply| Command::Dispose { reply })
            .await
            .is_err()
        {
            debug!("Session actor already stopped");
        }
        if let Err(e) = self.task.await {
            error!("Session actor panicked: {}", e);
        }
    }
}

struct FallbackReply {
    result: anyhow::Result<String>,
    speak: bool,
}

struct SessionActor {
    options: SessionOptions,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<dyn SnapshotStore>,
    audio: Arc<dyn AudioOutput>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    fallback: Option<Arc<dyn ChatFallback>>,
    dispatcher: ActionDispatcher,
    transcript: Transcript,
    session_id: Uuid,
    policy: ReconnectPolicy,
    turns: TurnCoordinator,
    vad: VoiceActivityDetector,
    sink: Option<WsSink>,
    source: Option<WsSource>,
    reconnect_at: Option<Instant>,
    refresh_before_connect: bool,
    /// One entry per chat request still awaiting its reply: whether that
    /// reply was asked to be spoken.
    pending_replies: VecDeque<bool>,
    mic: Option<mpsc::Receiver<AudioFrame>>,
    recorder: Option<Recorder>,
    playback_tx: mpsc::UnboundedSender<Uuid>,
    playback_rx: mpsc::UnboundedReceiver<Uuid>,
    synth_tx: mpsc::UnboundedSender<(Uuid, anyhow::Result<SpeechClip>)>,
    synth_rx: mpsc::UnboundedReceiver<(Uuid, anyhow::Result<SpeechClip>)>,
    fallback_tx: mpsc::UnboundedSender<FallbackReply>,
    fallback_rx: mpsc::UnboundedReceiver<FallbackReply>,
    events: broadcast::Sender<SessionEvent>,
    status_tx: watch::Sender<ConnectionState>,
    transcript_tx: watch::Sender<Vec<Message>>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn next_message(
    source: &mut Option<WsSource>,
) -> Option<Result<WsMessage, tungstenite::Error>> {
    match source {
        Some(source) => source.next().await,
        None => std::future::pending().await,
    }
}

async fn next_audio(mic: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match mic {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    #[instrument(name = "pam_session", skip_all, fields(session_id = %self.session_id))]
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Session started");
        loop {
            let now = Instant::now();
            let turn_wakeup = self.turns.next_wakeup(now);
            let ui_deadline = self.dispatcher.next_deadline();
            let recording_deadline = self.recorder.as_ref().map(Recorder::deadline);
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Dispose { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                message = next_message(&mut self.source) => self.handle_socket(message).await,
                frame = next_audio(&mut self.mic) => self.handle_audio(frame),
                Some(id) = self.playback_rx.recv() => {
                    if self.turns.on_playback_finished(id) {
                        self.advance_turns();
                    }
                }
                Some((id, clip)) = self.synth_rx.recv() => self.on_synthesized(id, clip),
                Some(reply) = self.fallback_rx.recv() => self.on_fallback_reply(reply).await,
                _ = sleep_until(reconnect_at) => {
                    self.reconnect_at = None;
                    if let Err(e) = self.connect().await {
                        debug!("Reconnect attempt failed: {}", e);
                    }
                }
                _ = sleep_until(turn_wakeup) => self.advance_turns(),
                _ = sleep_until(ui_deadline) => self.dispatcher.tick(Instant::now()),
                _ = sleep_until(recording_deadline) => {
                    self.finish_recording(true);
                }
            }
        }
        info!("Session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                self.reconnect_at = None;
                self.policy = ReconnectPolicy::new();
                let _ = reply.send(self.connect().await);
            }
            Command::Send {
                text,
                options,
                reply,
            } => {
                let _ = reply.send(self.send_message(&text, options).await);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::OpenAssistant => self.emit(SessionEvent::AssistantOpened),
            Command::Inject { text } => {
                self.emit(SessionEvent::AssistantOpened);
                if let Err(e) = self.send_message(&text, SendOptions::default()).await {
                    warn!("Injected message not sent: {}", e);
                    self.emit(SessionEvent::Notice(e.to_string()));
                }
            }
            Command::SetVoiceMode { enabled } => self.set_voice_mode(enabled),
            Command::AttachMicrophone { frames } => {
                info!("Microphone attached");
                self.mic = Some(frames);
                self.vad.reset();
            }
            Command::DetachMicrophone => self.release_microphone(),
            Command::ReportMediaError(e) => {
                warn!("Media error: {}", e);
                if !matches!(e, MediaError::PlaybackFailed(_)) {
                    self.release_microphone();
                }
                self.emit(SessionEvent::Media(e));
            }
            Command::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            Command::StopRecording { reply } => {
                let _ = reply.send(self.finish_recording(false));
            }
            Command::Dispose { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn set_status(&mut self, state: ConnectionState) {
        if *self.status_tx.borrow() == state {
            return;
        }
        debug!(%state, "Connection state changed");
        self.status_tx.send_replace(state);
        self.emit(SessionEvent::StatusChanged(state));
        self.persist().await;
    }

    fn publish_transcript(&self) {
        self.transcript_tx
            .send_replace(self.transcript.messages().to_vec());
    }

    async fn persist(&self) {
        let Some(user_id) = &self.options.user_id else {
            return;
        };
        let snapshot = ConversationSnapshot::capture(self.transcript.messages(), self.session_id);
        if let Err(e) = self.store.save(user_id, &snapshot).await {
            warn!("Could not persist conversation snapshot: {}", e);
        }
    }

    // ---- Session Connector -------------------------------------------------

    #[instrument(skip(self), fields(attempt = self.policy.attempts()))]
    async fn connect(&mut self) -> Result<(), SessionError> {
        if self.sink.is_some() {
            return Ok(());
        }
        let Some(user_id) = self.options.user_id.clone() else {
            warn!("Cannot connect without a signed-in user");
            self.set_status(ConnectionState::Disconnected).await;
            return Err(SessionError::MissingCredentials);
        };

        let refreshed = if std::mem::take(&mut self.refresh_before_connect) {
            match self.tokens.refresh().await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("Token refresh after authentication failure did not succeed: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        let token = match refreshed {
            Some(token) => token,
            None => match valid_token(self.tokens.as_ref()).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    warn!("Cannot connect without an access token");
                    self.reconnect_at = None;
                    self.set_status(ConnectionState::Disconnected).await;
                    return Err(SessionError::MissingCredentials);
                }
                Err(e) => {
                    let reason = format!("{:#}", e);
                    warn!("No usable access token: {}", reason);
                    self.reconnect_at = None;
                    self.policy = ReconnectPolicy::new();
                    self.set_status(ConnectionState::Disconnected).await;
                    self.emit(SessionEvent::CannotConnect(reason.clone()));
                    return Err(SessionError::AuthenticationFailed(reason));
                }
            },
        };

        if self.policy.attempts() == 0 {
            self.set_status(ConnectionState::Connecting).await;
        }

        let url = authenticated_url(&self.options.ws_url, token.expose());
        let stream = match connector::open(&url, self.options.connect_timeout).await {
            Ok(stream) => stream,
            Err(kind) => {
                let err = match &kind {
                    CloseKind::Authentication(reason) => {
                        SessionError::AuthenticationFailed(reason.clone())
                    }
                    CloseKind::Abnormal(reason) => SessionError::Transport(reason.clone()),
                    CloseKind::Normal => SessionError::Transport("closed during handshake".into()),
                };
                self.connection_lost(kind).await;
                return Err(err);
            }
        };

        let (mut sink, source) = stream.split();
        let init = ClientFrame::init(&user_id, self.options.user_location, self.session_id);
        if let Err(e) = send_frame(&mut sink, &init).await {
            self.connection_lost(CloseKind::Abnormal(e.to_string())).await;
            return Err(SessionError::Transport(e.to_string()));
        }

        self.sink = Some(sink);
        self.source = Some(source);
        self.policy.on_connected();
        info!("Connected to assistant");
        self.set_status(ConnectionState::Connected).await;
        Ok(())
    }

    async fn connection_lost(&mut self, kind: CloseKind) {
        self.sink = None;
        self.source = None;
        self.pending_replies.clear();
        match self.policy.on_closed(&kind) {
            ReconnectDecision::Stop => {
                info!("Connection closed normally");
                self.set_status(ConnectionState::Disconnected).await;
            }
            ReconnectDecision::Retry {
                attempt,
                delay,
                refresh_token,
            } => {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    refresh_token,
                    "Connection lost ({:?}); scheduling reconnect",
                    kind
                );
                self.refresh_before_connect |= refresh_token;
                self.reconnect_at = Some(Instant::now() + delay);
                self.set_status(ConnectionState::Reconnecting).await;
            }
            ReconnectDecision::GiveUp(reason) => {
                error!("Giving up on the assistant connection: {}", reason);
                self.reconnect_at = None;
                self.refresh_before_connect = false;
                self.set_status(ConnectionState::Disconnected).await;
                self.emit(SessionEvent::CannotConnect(reason));
            }
        }
    }

    async fn disconnect(&mut self) {
        self.reconnect_at = None;
        self.refresh_before_connect = false;
        self.policy = ReconnectPolicy::new();
        self.source = None;
        self.pending_replies.clear();
        if let Some(mut sink) = self.sink.take() {
            close_normally(&mut sink, "client disconnect").await;
            info!("Disconnected from assistant");
        }
        self.set_status(ConnectionState::Disconnected).await;
    }

    async fn handle_socket(&mut self, message: Option<Result<WsMessage, tungstenite::Error>>) {
        match message {
            Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()).await,
            Some(Ok(WsMessage::Close(frame))) => {
                let kind = classify_close(frame.as_ref());
                self.connection_lost(kind).await;
            }
            Some(Ok(WsMessage::Binary(bytes))) => {
                warn!(len = bytes.len(), "Discarding unexpected binary frame");
            }
            // Transport-level ping/pong is answered by tungstenite itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket error: {}", e);
                self.connection_lost(CloseKind::Abnormal(e.to_string()))
                    .await;
            }
            None => self.connection_lost(CloseKind::classify(None, "")).await,
        }
    }

    // ---- Message Stream Assembler ------------------------------------------

    async fn handle_text(&mut self, raw: &str) {
        let frame = match parse_server_frame(raw) {
            Ok(frame) => {
                self.policy.on_authenticated();
                frame
            }
            Err(malformed) => {
                warn!("Discarding malformed frame: {}", malformed.reason);
                if let Some(text) = malformed.fallback_text {
                    let message = self.transcript.push_assistant(&text);
                    self.publish_transcript();
                    self.on_finalized(message, false).await;
                }
                return;
            }
        };

        match &frame {
            ServerFrame::Ping { .. } => {
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = send_frame(sink, &ClientFrame::pong()).await {
                        warn!("Failed to answer ping: {}", e);
                    }
                }
            }
            ServerFrame::Pong { .. } => debug!("Received pong"),
            ServerFrame::UiAction(command) | ServerFrame::VisualAction(command) => {
                self.dispatcher.dispatch(
                    command.action.as_deref(),
                    &command.payload,
                    Instant::now(),
                );
            }
            ServerFrame::Error { message } => {
                let message = message
                    .clone()
                    .unwrap_or_else(|| "The assistant reported an error".to_string());
                warn!("Server error: {}", message);
                self.emit(SessionEvent::ServerError(message));
            }
            ServerFrame::Unknown => debug!("Ignoring unrecognized frame type"),
            _ => {
                let interrupts_reply = matches!(frame, ServerFrame::ChatResponseStart { .. })
                    && self.transcript.messages().iter().any(|m| m.is_streaming);
                if interrupts_reply {
                    // The cut-off reply still answered a request.
                    self.pending_replies.pop_front();
                }
                match self.transcript.apply(&frame) {
                    TranscriptChange::Unchanged => {}
                    TranscriptChange::Streaming => self.publish_transcript(),
                    TranscriptChange::Finalized(message) => {
                        self.publish_transcript();
                        let requested = self.pending_replies.pop_front().unwrap_or(false);
                        self.on_finalized(message, requested).await;
                    }
                }
            }
        }
    }

    /// `requested` is whether the user asked to hear this particular reply.
    async fn on_finalized(&mut self, mut message: Message, requested: bool) {
        self.persist().await;
        let priority = message
            .voice_priority
            .or(requested.then_some(VoicePriority::Normal));
        if let Some(priority) = priority {
            self.transcript.flag_for_voice(message.id, priority);
            self.publish_transcript();
            message.voice_priority = Some(priority);
            self.speak(&message);
        }
        self.emit(SessionEvent::MessageFinalized(message));
    }

    #[instrument(skip(self, text, options), fields(session_id = %self.session_id))]
    async fn send_message(&mut self, text: &str, options: SendOptions) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Protocol("message is empty".into()));
        }
        let user_id = self
            .options
            .user_id
            .clone()
            .ok_or(SessionError::MissingCredentials)?;

        if self.sink.is_some() {
            let frame = ClientFrame::chat(
                text,
                &user_id,
                self.options.user_location,
                self.session_id,
                self.transcript.messages(),
            );
            if let Some(sink) = self.sink.as_mut() {
                if let Err(e) = send_frame(sink, &frame).await {
                    self.connection_lost(CloseKind::Abnormal(e.to_string()))
                        .await;
                    return Err(SessionError::Transport(e.to_string()));
                }
            }
            self.transcript.push_user(text);
            self.pending_replies.push_back(options.speak_reply);
            self.publish_transcript();
            self.persist().await;
            return Ok(());
        }

        let Some(fallback) = self.fallback.clone() else {
            return Err(SessionError::NotConnected);
        };
        info!("Socket unavailable; sending through the HTTP fallback");
        let history: Vec<HistoryEntry> = self
            .transcript
            .recent(pam_core::protocol::HISTORY_CONTEXT_TURNS)
            .iter()
            .map(HistoryEntry::from)
            .collect();
        let request = FallbackRequest {
            message: text.to_string(),
            user_id,
            session_id: self.session_id,
            context: json!({
                "conversation_history": history,
                "userLocation": self.options.user_location,
                "timestamp": chrono::Utc::now(),
            }),
        };
        self.transcript.push_user(text);
        self.publish_transcript();

        let tx = self.fallback_tx.clone();
        let speak = options.speak_reply;
        tokio::spawn(async move {
            let result = fallback.send(request).await;
            let _ = tx.send(FallbackReply { result, speak });
        });
        Ok(())
    }

    async fn on_fallback_reply(&mut self, reply: FallbackReply) {
        let text = match reply.result {
            Ok(text) => text,
            Err(e) => {
                warn!("Fallback chat failed: {:#}", e);
                String::new()
            }
        };
        let message = self.transcript.push_assistant(&text);
        self.publish_transcript();
        self.on_finalized(message, reply.speak).await;
    }

    // ---- Turn-Taking Coordinator -------------------------------------------

    fn set_voice_mode(&mut self, enabled: bool) {
        info!(enabled, "Voice mode changed");
        if let Some(PlaybackDirective::Stop(id)) = self.turns.set_voice_mode(enabled) {
            self.audio.stop(id);
        }
        if !enabled {
            self.release_microphone();
        }
    }

    fn release_microphone(&mut self) {
        if self.mic.take().is_some() {
            info!("Microphone released");
        }
        self.vad.reset();
        if self.turns.state().user_speaking {
            self.turns.on_speech_end(Instant::now());
        }
        self.finish_recording(false);
    }

    fn handle_audio(&mut self, frame: Option<AudioFrame>) {
        let Some(frame) = frame else {
            debug!("Microphone stream ended");
            self.release_microphone();
            return;
        };
        let now = Instant::now();
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.push(&frame, now);
        }
        match self.vad.process(&frame.samples, now) {
            Some(VadEvent::SpeechStart { at }) => {
                if let Some(PlaybackDirective::Stop(id)) = self.turns.on_speech_start(at) {
                    info!("User started speaking; assistant playback interrupted");
                    self.audio.stop(id);
                }
            }
            Some(VadEvent::SpeechEnd { silence_started }) => {
                self.turns.on_speech_end(silence_started);
            }
            None => {}
        }
    }

    fn speak(&mut self, message: &Message) {
        let Some(utterance) = Utterance::for_message(message) else {
            return;
        };
        match self.turns.request_speech(utterance) {
            Ok(()) => self.advance_turns(),
            Err(reason) => debug!(%reason, "Reply will not be spoken"),
        }
    }

    fn advance_turns(&mut self) {
        match self.turns.poll(Instant::now()) {
            Some(PlaybackDirective::Start(utterance)) => self.begin_playback(utterance),
            Some(PlaybackDirective::Stop(id)) => self.audio.stop(id),
            None => {}
        }
    }

    fn begin_playback(&mut self, utterance: Utterance) {
        match &self.synthesizer {
            Some(synthesizer) => {
                let synthesizer = synthesizer.clone();
                let tx = self.synth_tx.clone();
                tokio::spawn(async move {
                    let clip = synthesizer.synthesize(&utterance.text).await;
                    let _ = tx.send((utterance.id, clip));
                });
            }
            None => self.play(utterance.id, SpeechClip::Text(utterance.text)),
        }
    }

    fn on_synthesized(&mut self, id: Uuid, clip: anyhow::Result<SpeechClip>) {
        let Some(active) = self.turns.active().filter(|u| u.id == id) else {
            debug!("Dropping speech for an utterance that was cancelled");
            return;
        };
        let clip = clip.unwrap_or_else(|e| {
            warn!("Speech synthesis failed, falling back to text: {:#}", e);
            SpeechClip::Text(active.text.clone())
        });
        self.play(id, clip);
    }

    fn play(&mut self, id: Uuid, clip: SpeechClip) {
        let done = PlaybackNotifier::new(id, self.playback_tx.clone());
        if let Err(e) = self.audio.play(clip, done) {
            warn!("Playback failed: {}", e);
            self.emit(SessionEvent::Media(e));
            if self.turns.on_playback_finished(id) {
                self.advance_turns();
            }
        }
    }

    // ---- Recording ---------------------------------------------------------

    fn start_recording(&mut self) -> Result<(), SessionError> {
        if self.mic.is_none() {
            let e = MediaError::DeviceNotFound;
            self.emit(SessionEvent::Media(e.clone()));
            return Err(e.into());
        }
        if self.recorder.is_none() {
            info!("Recording started");
            self.recorder = Some(Recorder::start(
                Instant::now(),
                self.options.recording_limit,
            ));
        }
        Ok(())
    }

    fn finish_recording(&mut self, auto_stopped: bool) -> Option<RecordedClip> {
        let recorder = self.recorder.take()?;
        let clip = recorder.finish(Instant::now(), auto_stopped);
        info!(
            duration_ms = clip.duration.as_millis() as u64,
            auto_stopped,
            "Recording finished"
        );
        self.emit(SessionEvent::RecordingFinished(clip.clone()));
        Some(clip)
    }

    async fn shutdown(&mut self) {
        self.disconnect().await;
        if let Some(PlaybackDirective::Stop(id)) = self.turns.set_voice_mode(false) {
            self.audio.stop(id);
        }
        self.release_microphone();
        self.dispatcher.reset();
        self.persist().await;
    }
}
