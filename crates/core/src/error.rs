//! Error types surfaced by the session to its embedding application.

/// Failures a caller of the session can observe.
///
/// Transport problems are absorbed by the connector's reconnection loop and
/// only reach callers through these variants when an operation cannot proceed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Not connected to the assistant")]
    NotConnected,
    #[error("No signed-in user or auth token available")]
    MissingCredentials,
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("Session has been disposed")]
    Disposed,
}

/// Microphone and playback failures, each mapped to guidance for the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("No audio input device found")]
    DeviceNotFound,
    #[error("Audio device is busy")]
    DeviceBusy,
    #[error("Audio playback failed: {0}")]
    PlaybackFailed(String),
    #[error("Audio capture is not supported")]
    Unsupported,
    #[error("Media error: {0}")]
    Other(String),
}

impl MediaError {
    /// Maps a host media error name (as reported by capture backends) to a variant.
    pub fn from_name(name: &str, detail: &str) -> Self {
        match name {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                MediaError::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
                MediaError::DeviceNotFound
            }
            "NotReadableError" | "TrackStartError" | "AbortError" => MediaError::DeviceBusy,
            "NotSupportedError" | "TypeError" => MediaError::Unsupported,
            "PlaybackError" | "MediaError" => MediaError::PlaybackFailed(detail.to_string()),
            _ => MediaError::Other(format!("{name}: {detail}")),
        }
    }

    /// Text shown to the user explaining how to recover.
    pub fn user_guidance(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => {
                "Microphone access was blocked. Allow microphone access in your settings and try again."
            }
            MediaError::DeviceNotFound => {
                "No microphone was found. Connect a microphone and try again."
            }
            MediaError::DeviceBusy => {
                "Your microphone is being used by another application. Close it and try again."
            }
            MediaError::PlaybackFailed(_) => {
                "Audio playback failed. You can still read PAM's reply in the chat."
            }
            MediaError::Unsupported => "Voice features are not supported on this device.",
            MediaError::Other(_) => "Something went wrong with audio. Please try again.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        assert_eq!(
            SessionError::NotConnected.to_string(),
            "Not connected to the assistant"
        );
        assert_eq!(
            SessionError::AuthenticationFailed("expired".into()).to_string(),
            "Authentication failed: expired"
        );
    }

    #[test]
    fn test_media_error_from_known_names() {
        assert_eq!(
            MediaError::from_name("NotAllowedError", ""),
            MediaError::PermissionDenied
        );
        assert_eq!(
            MediaError::from_name("NotFoundError", ""),
            MediaError::DeviceNotFound
        );
        assert_eq!(
            MediaError::from_name("NotReadableError", "in use"),
            MediaError::DeviceBusy
        );
        assert_eq!(
            MediaError::from_name("Weird", "boom"),
            MediaError::Other("Weird: boom".into())
        );
    }

    #[test]
    fn test_every_media_error_has_guidance() {
        let errors = [
            MediaError::PermissionDenied,
            MediaError::DeviceNotFound,
            MediaError::DeviceBusy,
            MediaError::PlaybackFailed("decode".into()),
            MediaError::Unsupported,
            MediaError::Other("x".into()),
        ];
        for error in errors {
            assert!(!error.user_guidance().is_empty());
        }
    }
}
