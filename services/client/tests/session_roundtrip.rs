//! End-to-end tests against an in-process WebSocket server.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pam_client::audio::{AudioFrame, AudioOutput, PlaybackNotifier, SpeechClip};
use pam_client::auth::{StaticTokenProvider, TokenProvider};
use pam_client::fallback::{ChatFallback, FallbackRequest};
use pam_client::store::{MemorySnapshotStore, SnapshotStore};
use pam_client::{PamSession, SendOptions, SessionDeps, SessionEvent, SessionOptions};
use pam_core::actions::{DispatchError, Toast, UiSurface};
use pam_core::{
    ConnectionState, ConversationSnapshot, MediaError, Message, SessionError, Sender,
    VoicePriority,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use url::Url;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct ChannelSurface {
    tx: mpsc::UnboundedSender<String>,
}

impl UiSurface for ChannelSurface {
    fn navigate(&self, route: &str) -> Result<(), DispatchError> {
        let _ = self.tx.send(format!("navigate {route}"));
        Ok(())
    }

    fn set_field(&self, form_id: &str, field: &str, value: &Value) -> Result<(), DispatchError> {
        let _ = self.tx.send(format!("field {form_id}.{field}={value}"));
        Ok(())
    }

    fn set_highlight(&self, element: &str, on: bool) -> Result<(), DispatchError> {
        let _ = self.tx.send(format!("highlight {element} {on}"));
        Ok(())
    }

    fn show_toast(&self, toast: &Toast) -> Result<(), DispatchError> {
        let _ = self.tx.send(format!("toast {}", toast.message));
        Ok(())
    }
}

/// Reports played and stopped clips. With `hold` set, clips keep playing
/// until stopped.
struct ChannelAudio {
    played: mpsc::UnboundedSender<(Uuid, SpeechClip)>,
    stopped: mpsc::UnboundedSender<Uuid>,
    hold: bool,
}

impl AudioOutput for ChannelAudio {
    fn play(&self, clip: SpeechClip, done: PlaybackNotifier) -> Result<(), MediaError> {
        let _ = self.played.send((done.id(), clip));
        if !self.hold {
            done.finished();
        }
        Ok(())
    }

    fn stop(&self, id: Uuid) {
        let _ = self.stopped.send(id);
    }
}

struct CannedFallback;

#[async_trait]
impl ChatFallback for CannedFallback {
    async fn send(&self, request: FallbackRequest) -> anyhow::Result<String> {
        Ok(format!("Offline reply to {}", request.message))
    }
}

struct Harness {
    session: PamSession,
    ui: mpsc::UnboundedReceiver<String>,
    played: mpsc::UnboundedReceiver<(Uuid, SpeechClip)>,
    stopped: mpsc::UnboundedReceiver<Uuid>,
}

impl Harness {
    async fn next_clip(&mut self) -> (Uuid, SpeechClip) {
        timeout(WAIT, self.played.recv())
            .await
            .expect("nothing was played")
            .unwrap()
    }
}

fn options(url: &Url, user_id: Option<&str>) -> SessionOptions {
    SessionOptions::new(url.clone(), user_id.map(str::to_string))
}

async fn start_session(
    options: SessionOptions,
    token: Option<&str>,
    store: Arc<dyn SnapshotStore>,
    fallback: Option<Arc<dyn ChatFallback>>,
) -> Harness {
    let tokens = Arc::new(StaticTokenProvider::new(token, None));
    start_session_with(options, tokens, store, fallback, false).await
}

async fn start_session_with(
    options: SessionOptions,
    tokens: Arc<dyn TokenProvider>,
    store: Arc<dyn SnapshotStore>,
    fallback: Option<Arc<dyn ChatFallback>>,
    hold_playback: bool,
) -> Harness {
    let (ui_tx, ui) = mpsc::unbounded_channel();
    let (played_tx, played) = mpsc::unbounded_channel();
    let (stopped_tx, stopped) = mpsc::unbounded_channel();
    let session = PamSession::init(SessionDeps {
        options,
        tokens,
        store,
        surface: Arc::new(ChannelSurface { tx: ui_tx }),
        audio: Arc::new(ChannelAudio {
            played: played_tx,
            stopped: stopped_tx,
            hold: hold_playback,
        }),
        synthesizer: None,
        fallback,
    })
    .await;
    Harness {
        session,
        ui,
        played,
        stopped,
    }
}

fn loud_frame() -> AudioFrame {
    AudioFrame::new(vec![0.5; 160], 16_000)
}

fn quiet_frame() -> AudioFrame {
    AudioFrame::new(vec![0.0; 160], 16_000)
}

async fn listen() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/api/v1/pam/ws", listener.local_addr().unwrap())).unwrap();
    (listener, url)
}

/// Accepts one client and returns the socket along with the requested URI.
async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut uri = String::new();
    let ws = accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            uri = request.uri().to_string();
            Ok(response)
        },
    )
    .await
    .unwrap();
    (ws, uri)
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(WsMessage::Text(value.to_string().into())).await.unwrap();
}

/// Reads until the client goes away.
async fn drain(mut ws: WebSocketStream<TcpStream>) {
    let _ = timeout(WAIT, async { while let Some(Ok(_)) = ws.next().await {} }).await;
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    matches: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_hello_round_trip_streams_reply() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, uri) = accept(&listener).await;
        let init = next_json(&mut ws).await;
        let chat = next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "chat_response_start", "content": "Hi"})).await;
        send_json(&mut ws, json!({"type": "chat_response_delta", "content": " there!"})).await;
        send_json(&mut ws, json!({"type": "chat_response_complete"})).await;
        drain(ws).await;
        (uri, init, chat)
    });

    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();

    handle.connect().await.unwrap();
    assert_eq!(handle.connection_state(), ConnectionState::Connected);
    handle.send_message("hello").await.unwrap();

    let mut transcript = handle.transcript();
    let messages = timeout(
        WAIT,
        transcript.wait_for(|m| m.len() == 2 && !m[1].is_streaming),
    )
    .await
    .expect("reply never finalized")
    .unwrap()
    .clone();

    assert_eq!(messages[0].sender, Sender::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].sender, Sender::Assistant);
    assert_eq!(messages[1].content, "Hi there!");

    harness.session.dispose().await;
    let (uri, init, chat) = server.await.unwrap();

    assert!(uri.contains("token=secret"), "uri was {uri}");
    assert_eq!(init["type"], "init");
    assert_eq!(init["context"]["user_id"], "user-1");
    assert_eq!(chat["type"], "chat");
    assert_eq!(chat["message"], "hello");
    assert_eq!(chat["stream"], true);
    assert_eq!(chat["context"]["session_id"], init["context"]["session_id"]);
}

#[tokio::test]
async fn test_server_ping_gets_pong() {
    let (listener, url) = listen().await;
    let (pong_tx, pong_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "ping", "timestamp": 1})).await;
        let _ = pong_tx.send(next_json(&mut ws).await);
        drain(ws).await;
    });

    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    harness.session.handle().connect().await.unwrap();

    let pong = timeout(WAIT, pong_rx).await.unwrap().unwrap();
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());
    // Liveness frames never reach the transcript.
    assert!(harness.session.handle().transcript().borrow().is_empty());

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_ui_action_reaches_surface() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "ui_action", "action": "toast", "payload": {"message": "Trip saved"}}),
        )
        .await;
        send_json(
            &mut ws,
            json!({"type": "visual_action", "action": "navigate", "payload": {"route": "/wins"}}),
        )
        .await;
        drain(ws).await;
    });

    let mut harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    harness.session.handle().connect().await.unwrap();

    let first = timeout(WAIT, harness.ui.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, harness.ui.recv()).await.unwrap().unwrap();
    assert_eq!(first, "toast Trip saved");
    assert_eq!(second, "navigate /wins");
    // UI commands never show up in the transcript.
    assert!(harness.session.handle().transcript().borrow().is_empty());

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_requested_reply_is_spoken_in_voice_mode() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "chat_response", "content": "Fuel up at the next exit"}))
            .await;
        drain(ws).await;
    });

    let mut harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();
    handle.set_voice_mode(true).await.unwrap();
    handle.connect().await.unwrap();
    handle
        .send_message_with("where should I stop?", SendOptions { speak_reply: true })
        .await
        .unwrap();

    let (_, clip) = harness.next_clip().await;
    assert_eq!(clip, SpeechClip::Text("Fuel up at the next exit".into()));

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_repeated_auth_failure_is_terminal() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        for _ in 0..2 {
            let (mut ws, _) = accept(&listener).await;
            next_json(&mut ws).await;
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4001),
                reason: String::from("Unauthorized").into(),
            }))
            .await
            .unwrap();
            drain(ws).await;
        }
        // No third attempt may follow.
        timeout(Duration::from_millis(1_500), listener.accept())
            .await
            .is_err()
    });

    let harness = start_session(
        options(&url, Some("user-1")),
        Some("expired"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();
    let mut events = handle.subscribe();
    handle.connect().await.unwrap();

    let event =
        wait_for_event(&mut events, |e| matches!(e, SessionEvent::CannotConnect(_))).await;
    match event {
        SessionEvent::CannotConnect(reason) => assert!(reason.contains("Authentication")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    assert!(server.await.unwrap(), "client retried after giving up");

    harness.session.dispose().await;
}

#[tokio::test]
async fn test_send_without_connection_or_fallback_fails() {
    let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();

    let err = handle.send_message("hello").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert!(handle.transcript().borrow().is_empty());

    harness.session.dispose().await;
    assert!(matches!(
        handle.send_message("hello").await,
        Err(SessionError::Disposed)
    ));
}

#[tokio::test]
async fn test_missing_user_fails_fast() {
    let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
    let harness = start_session(
        options(&url, None),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();

    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::MissingCredentials));
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);

    harness.session.dispose().await;
}

#[tokio::test]
async fn test_fallback_answers_while_offline() {
    let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        Some(Arc::new(CannedFallback)),
    )
    .await;
    let handle = harness.session.handle();

    handle.send_message("hello").await.unwrap();
    let mut transcript = handle.transcript();
    let messages = timeout(WAIT, transcript.wait_for(|m| m.len() == 2))
        .await
        .expect("fallback reply never arrived")
        .unwrap()
        .clone();

    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].content, "Offline reply to hello");
    assert!(!messages[1].is_streaming);

    harness.session.dispose().await;
}

#[tokio::test]
async fn test_snapshot_restores_transcript_and_session() {
    let store = Arc::new(MemorySnapshotStore::new());
    let session_id = Uuid::new_v4();
    let mut stale = Message::streaming("half a rep");
    stale.content.push_str("ly");
    let snapshot = ConversationSnapshot {
        messages: vec![Message::user("hi"), stale],
        session_id,
        timestamp: chrono::Utc::now(),
    };
    store.save("user-1", &snapshot).await.unwrap();

    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        let init = next_json(&mut ws).await;
        drain(ws).await;
        init
    });

    let harness = start_session(options(&url, Some("user-1")), Some("secret"), store.clone(), None).await;
    let handle = harness.session.handle();

    let restored = handle.transcript().borrow().clone();
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[1].content, "half a reply");
    assert!(!restored[1].is_streaming);

    handle.connect().await.unwrap();
    harness.session.dispose().await;

    let init = server.await.unwrap();
    assert_eq!(init["context"]["session_id"], session_id.to_string());
    let saved = store.load("user-1").await.unwrap().unwrap();
    assert_eq!(saved.session_id, session_id);
}

#[tokio::test]
async fn test_recording_and_microphone_release() {
    let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();

    assert!(matches!(
        handle.start_recording().await,
        Err(SessionError::Media(MediaError::DeviceNotFound))
    ));

    let (mic, frames) = mpsc::channel(8);
    handle.set_voice_mode(true).await.unwrap();
    handle.attach_microphone(frames).await.unwrap();
    handle.start_recording().await.unwrap();
    mic.send(loud_frame()).await.unwrap();
    mic.send(quiet_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let clip = handle.stop_recording().await.unwrap().expect("recording was running");
    assert_eq!(clip.samples.len(), 320);
    assert_eq!(clip.sample_rate, 16_000);
    assert!(!clip.auto_stopped);

    handle.set_voice_mode(false).await.unwrap();
    timeout(WAIT, mic.closed())
        .await
        .expect("microphone left open after voice mode was turned off");

    harness.session.dispose().await;
}

#[tokio::test]
async fn test_expired_token_is_never_sent() {
    let (listener, url) = listen().await;
    let expired = chrono::Utc::now() - chrono::Duration::hours(1);
    let tokens = Arc::new(StaticTokenProvider::new(Some("EXPIRED"), Some(expired)));
    let harness = start_session_with(
        options(&url, Some("user-1")),
        tokens,
        Arc::new(MemorySnapshotStore::new()),
        None,
        false,
    )
    .await;
    let handle = harness.session.handle();
    let mut events = handle.subscribe();

    let err = handle.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::AuthenticationFailed(_)), "got {err:?}");
    assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    wait_for_event(&mut events, |e| matches!(e, SessionEvent::CannotConnect(_))).await;
    assert!(
        timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err(),
        "client dialed with an expired token"
    );

    harness.session.dispose().await;
}

#[tokio::test]
async fn test_voice_request_follows_its_own_reply() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        ws.send(WsMessage::Text(String::from("Server restarting soon").into()))
            .await
            .unwrap();
        send_json(&mut ws, json!({"type": "chat_response", "content": "reply to typed question"}))
            .await;
        send_json(&mut ws, json!({"type": "chat_response", "content": "reply to spoken question"}))
            .await;
        drain(ws).await;
    });

    let mut harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();
    handle.set_voice_mode(true).await.unwrap();
    handle.connect().await.unwrap();
    handle
        .send_message_with("typed question", SendOptions { speak_reply: false })
        .await
        .unwrap();
    handle
        .send_message_with("spoken question", SendOptions { speak_reply: true })
        .await
        .unwrap();

    let (_, clip) = harness.next_clip().await;
    assert_eq!(clip, SpeechClip::Text("reply to spoken question".into()));

    let mut transcript = handle.transcript();
    let messages = timeout(WAIT, transcript.wait_for(|m| m.len() == 5))
        .await
        .expect("replies never arrived")
        .unwrap()
        .clone();
    assert_eq!(messages[2].content, "Server restarting soon");
    assert_eq!(messages[2].voice_priority, None);
    assert_eq!(messages[3].voice_priority, None);
    assert_eq!(messages[4].voice_priority, Some(VoicePriority::Normal));
    assert!(harness.played.try_recv().is_err());

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_speech_onset_interrupts_playback() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"type": "chat_response", "content": "The campground is 40 km ahead"}),
        )
        .await;
        drain(ws).await;
    });

    let mut harness = start_session_with(
        options(&url, Some("user-1")),
        Arc::new(StaticTokenProvider::new(Some("secret"), None)),
        Arc::new(MemorySnapshotStore::new()),
        None,
        true,
    )
    .await;
    let handle = harness.session.handle();
    let (mic, frames) = mpsc::channel(8);
    handle.set_voice_mode(true).await.unwrap();
    handle.attach_microphone(frames).await.unwrap();
    handle.connect().await.unwrap();
    handle
        .send_message_with("how far to camp?", SendOptions { speak_reply: true })
        .await
        .unwrap();

    let (playing, _) = harness.next_clip().await;
    mic.send(loud_frame()).await.unwrap();

    let stopped = timeout(WAIT, harness.stopped.recv())
        .await
        .expect("playback was not interrupted")
        .unwrap();
    assert_eq!(stopped, playing);

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_spoken_reply_waits_for_silence_window() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        next_json(&mut ws).await;
        send_json(&mut ws, json!({"type": "chat_response", "content": "Rest area in 5 km"}))
            .await;
        drain(ws).await;
    });

    let mut harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();
    let (mic, frames) = mpsc::channel(8);
    handle.set_voice_mode(true).await.unwrap();
    handle.attach_microphone(frames).await.unwrap();
    handle.connect().await.unwrap();

    mic.send(loud_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let silence_began = Instant::now();
    mic.send(quiet_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    mic.send(quiet_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle
        .send_message_with("any rest stops?", SendOptions { speak_reply: true })
        .await
        .unwrap();

    let (_, clip) = harness.next_clip().await;
    assert_eq!(clip, SpeechClip::Text("Rest area in 5 km".into()));
    assert!(
        silence_began.elapsed() >= Duration::from_secs(2),
        "spoke {:?} after the user went quiet",
        silence_began.elapsed()
    );

    harness.session.dispose().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_recording_stops_itself_at_limit() {
    let url = Url::parse("ws://127.0.0.1:9/ws").unwrap();
    let mut opts = options(&url, Some("user-1"));
    opts.recording_limit = Duration::from_millis(200);
    let harness = start_session(opts, Some("secret"), Arc::new(MemorySnapshotStore::new()), None).await;
    let handle = harness.session.handle();
    let mut events = handle.subscribe();

    let (mic, frames) = mpsc::channel(8);
    handle.attach_microphone(frames).await.unwrap();
    handle.start_recording().await.unwrap();
    mic.send(quiet_frame()).await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, SessionEvent::RecordingFinished(_))
    })
    .await;
    match event {
        SessionEvent::RecordingFinished(clip) => {
            assert!(clip.auto_stopped);
            assert_eq!(clip.samples.len(), 160);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(handle.stop_recording().await.unwrap().is_none());

    drop(mic);
    harness.session.dispose().await;
}

#[tokio::test]
async fn test_binary_frames_are_discarded() {
    let (listener, url) = listen().await;
    let server = tokio::spawn(async move {
        let (mut ws, _) = accept(&listener).await;
        next_json(&mut ws).await;
        ws.send(WsMessage::Binary(vec![0u8, 159, 146, 150].into()))
            .await
            .unwrap();
        send_json(&mut ws, json!({"type": "chat_response", "content": "Still here"})).await;
        drain(ws).await;
    });

    let harness = start_session(
        options(&url, Some("user-1")),
        Some("secret"),
        Arc::new(MemorySnapshotStore::new()),
        None,
    )
    .await;
    let handle = harness.session.handle();
    handle.connect().await.unwrap();

    let mut transcript = handle.transcript();
    let messages = timeout(WAIT, transcript.wait_for(|m| !m.is_empty()))
        .await
        .expect("reply never arrived")
        .unwrap()
        .clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "Still here");
    assert_eq!(handle.connection_state(), ConnectionState::Connected);

    harness.session.dispose().await;
    server.await.unwrap();
}
