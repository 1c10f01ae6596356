//! Reconnection policy for the realtime socket.
//!
//! The policy is a pure state machine: the connector reports how each
//! connection ended and the policy decides whether, when and how to retry.

use std::time::Duration;

/// Attempts allowed after a connection is lost before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_millis(10_000);
/// Consecutive authentication failures tolerated before the session is terminal.
pub const MAX_AUTH_FAILURES: u32 = 2;

/// WebSocket close code for a deliberate, normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

const AUTH_CLOSE_CODES: [u16; 5] = [1008, 4001, 4003, 4401, 4403];
const AUTH_REASON_MARKERS: [&str; 6] = ["auth", "unauthorized", "forbidden", "token", "401", "403"];

/// How a connection (or connection attempt) ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseKind {
    /// Closed on purpose with code 1000.
    Normal,
    /// Rejected or closed because the credential was not accepted.
    Authentication(String),
    /// Any other loss of connectivity.
    Abnormal(String),
}

impl CloseKind {
    /// Classifies a close frame by its code and reason.
    pub fn classify(code: Option<u16>, reason: &str) -> Self {
        if code == Some(NORMAL_CLOSURE) {
            return CloseKind::Normal;
        }
        if is_auth_failure(code, reason) {
            return CloseKind::Authentication(describe(code, reason));
        }
        CloseKind::Abnormal(describe(code, reason))
    }

    /// Classifies a failed handshake by its HTTP status, if any.
    pub fn from_handshake(status: Option<u16>, detail: &str) -> Self {
        match status {
            Some(401) | Some(403) => CloseKind::Authentication(detail.to_string()),
            _ if is_auth_failure(None, detail) => CloseKind::Authentication(detail.to_string()),
            _ => CloseKind::Abnormal(detail.to_string()),
        }
    }
}

fn is_auth_failure(code: Option<u16>, reason: &str) -> bool {
    if code.is_some_and(|c| AUTH_CLOSE_CODES.contains(&c)) {
        return true;
    }
    let reason = reason.to_lowercase();
    AUTH_REASON_MARKERS.iter().any(|marker| reason.contains(marker))
}

fn describe(code: Option<u16>, reason: &str) -> String {
    match (code, reason.is_empty()) {
        (Some(code), true) => format!("closed with code {code}"),
        (Some(code), false) => format!("closed with code {code}: {reason}"),
        (None, true) => "connection lost".to_string(),
        (None, false) => reason.to_string(),
    }
}

/// What the connector should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The closure was deliberate; stay disconnected.
    Stop,
    /// Retry after `delay`. When `refresh_token` is set the credential must be
    /// refreshed before the attempt.
    Retry {
        attempt: u32,
        delay: Duration,
        refresh_token: bool,
    },
    /// Terminal: surface "cannot connect" and schedule nothing further.
    GiveUp(String),
}

/// Delay before the `attempt`-th retry (1-based): `min(1s * 2^(attempt-1), 10s)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BASE_RECONNECT_DELAY
        .saturating_mul(1u32 << exponent)
        .min(MAX_RECONNECT_DELAY)
}

#[derive(Debug, Default, Clone)]
pub struct ReconnectPolicy {
    attempts: u32,
    auth_failures: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries scheduled since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn auth_failures(&self) -> u32 {
        self.auth_failures
    }

    /// Resets the retry budget once a connection has been established.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Clears the authentication failure streak once the server has accepted
    /// the session, i.e. sent a frame on it. A socket that opens and is then
    /// closed for auth reasons still counts as a consecutive failure.
    pub fn on_authenticated(&mut self) {
        self.auth_failures = 0;
    }

    /// Records how the connection ended and returns the next step.
    pub fn on_closed(&mut self, kind: &CloseKind) -> ReconnectDecision {
        let refresh_token = match kind {
            CloseKind::Normal => return ReconnectDecision::Stop,
            CloseKind::Authentication(reason) => {
                self.auth_failures += 1;
                if self.auth_failures >= MAX_AUTH_FAILURES {
                    return ReconnectDecision::GiveUp(format!(
                        "Authentication failed {} times in a row: {}",
                        self.auth_failures, reason
                    ));
                }
                true
            }
            CloseKind::Abnormal(_) => {
                self.auth_failures = 0;
                false
            }
        };

        if self.attempts >= MAX_RECONNECT_ATTEMPTS {
            return ReconnectDecision::GiveUp(format!(
                "Unable to reach the assistant after {} attempts",
                self.attempts
            ));
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: backoff_delay(self.attempts),
            refresh_token,
        }
    }
}
