//! PAM Session Core
//!
//! The IO-free heart of the realtime assistant session: data model, wire
//! frames, reconnection policy, reply reassembly, voice activity detection,
//! turn-taking and UI command interpretation. The `pam-client` crate drives
//! these pieces from a tokio runtime.

pub mod actions;
pub mod error;
pub mod models;
pub mod protocol;
pub mod reconnect;
pub mod transcript;
pub mod turn;
pub mod vad;

pub use error::{MediaError, SessionError};
pub use models::{ConnectionState, ConversationSnapshot, Message, Sender, VoicePriority};
