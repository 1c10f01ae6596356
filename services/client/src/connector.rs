//! Session Connector transport helpers: the authenticated socket URL, the
//! handshake with its timeout, and frame encoding.

use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use pam_core::protocol::ClientFrame;
use pam_core::reconnect::{CloseKind, NORMAL_CLOSURE};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, instrument};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, WsMessage>;
pub type WsSource = SplitStream<WsStream>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Appends the access token as the `token` query parameter, replacing any previous one.
pub fn authenticated_url(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("token", token);
    url
}

/// Maps a failed handshake to how the connection ended.
pub fn classify_connect_error(err: &tungstenite::Error) -> CloseKind {
    let status = match err {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    };
    CloseKind::from_handshake(status, &err.to_string())
}

/// Maps a close frame (or its absence) to how the connection ended.
pub fn classify_close(frame: Option<&CloseFrame>) -> CloseKind {
    match frame {
        Some(frame) => CloseKind::classify(Some(u16::from(frame.code)), &frame.reason),
        None => CloseKind::classify(None, ""),
    }
}

/// Opens the socket, giving up after `timeout`.
#[instrument(skip(url), fields(host = url.host_str().unwrap_or("")))]
pub async fn open(url: &Url, timeout: Duration) -> Result<WsStream, CloseKind> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Err(_) => Err(CloseKind::Abnormal(format!(
            "connection attempt timed out after {}s",
            timeout.as_secs()
        ))),
        Ok(Err(e)) => Err(classify_connect_error(&e)),
        Ok(Ok((stream, response))) => {
            debug!(status = %response.status(), "WebSocket handshake complete");
            Ok(stream)
        }
    }
}

/// Serializes and sends a frame.
pub async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> anyhow::Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

/// Sends a normal closure frame. Errors are irrelevant at this point.
pub async fn close_normally(sink: &mut WsSink, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(NORMAL_CLOSURE),
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!("Close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
}
