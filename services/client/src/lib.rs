//! PAM Client
//!
//! Runs a realtime assistant session on tokio: the authenticated WebSocket
//! connection with its reconnect loop, the streamed transcript, spoken
//! replies arbitrated against the user's microphone, and UI commands applied
//! to a host surface.

pub mod audio;
pub mod auth;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod fallback;
pub mod recording;
pub mod session;
pub mod store;
pub mod tts;

pub use session::{PamSession, SendOptions, SessionDeps, SessionEvent, SessionHandle, SessionOptions};
