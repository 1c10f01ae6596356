//! UI commands pushed by the assistant and the surface they are applied to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_HIGHLIGHT_DURATION: Duration = Duration::from_millis(3_000);
/// How long an element is outlined before a navigation or form fill acts on it.
pub const PREVIEW_HIGHLIGHT_DURATION: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastSeverity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastSeverity {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_lowercase).as_deref() {
            Some("success") => ToastSeverity::Success,
            Some("warning") | Some("warn") => ToastSeverity::Warning,
            Some("error") | Some("destructive") => ToastSeverity::Error,
            _ => ToastSeverity::Info,
        }
    }
}

/// A transient notice shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub message: String,
    pub title: Option<String>,
    pub severity: ToastSeverity,
}

/// A transient instruction from the assistant. Never stored.
#[derive(Debug, Clone, PartialEq)]
pub enum UiCommand {
    Navigate {
        route: String,
        trigger: Option<String>,
    },
    FillForm {
        form_id: String,
        data: Map<String, Value>,
    },
    Highlight {
        element: String,
        duration: Duration,
    },
    Toast(Toast),
    /// A kind this client does not understand yet.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Command frame has no action")]
    MissingAction,
    #[error("Action '{action}' is missing field '{field}'")]
    MissingField {
        action: &'static str,
        field: &'static str,
    },
    #[error("Element '{0}' not found")]
    TargetNotFound(String),
    #[error("Surface error: {0}")]
    Surface(String),
}

fn first_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .find(|value| !value.trim().is_empty())
}

impl UiCommand {
    /// Interprets an `{action, payload}` command frame.
    pub fn parse(action: Option<&str>, payload: &Value) -> Result<Self, DispatchError> {
        let action = action.ok_or(DispatchError::MissingAction)?;
        let command = match action {
            "navigate" => UiCommand::Navigate {
                route: first_str(payload, &["route", "path", "url"])
                    .ok_or(DispatchError::MissingField {
                        action: "navigate",
                        field: "route",
                    })?
                    .to_string(),
                trigger: first_str(payload, &["element", "highlight"]).map(str::to_string),
            },
            "fill_form" => UiCommand::FillForm {
                form_id: first_str(payload, &["form_id", "formId", "form"])
                    .ok_or(DispatchError::MissingField {
                        action: "fill_form",
                        field: "form_id",
                    })?
                    .to_string(),
                data: payload
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .ok_or(DispatchError::MissingField {
                        action: "fill_form",
                        field: "data",
                    })?,
            },
            "highlight" => UiCommand::Highlight {
                element: first_str(payload, &["element", "selector"])
                    .ok_or(DispatchError::MissingField {
                        action: "highlight",
                        field: "element",
                    })?
                    .to_string(),
                duration: payload
                    .get("duration")
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_HIGHLIGHT_DURATION),
            },
            "toast" => UiCommand::Toast(Toast {
                message: first_str(payload, &["message", "text", "description"])
                    .ok_or(DispatchError::MissingField {
                        action: "toast",
                        field: "message",
                    })?
                    .to_string(),
                title: first_str(payload, &["title"]).map(str::to_string),
                severity: ToastSeverity::parse(first_str(payload, &["severity", "variant", "type"])),
            }),
            other => UiCommand::Unknown(other.to_string()),
        };
        Ok(command)
    }
}

/// The host UI the assistant can act on.
#[cfg_attr(test, mockall::automock)]
pub trait UiSurface: Send + Sync {
    fn navigate(&self, route: &str) -> Result<(), DispatchError>;
    fn set_field(&self, form_id: &str, field: &str, value: &Value) -> Result<(), DispatchError>;
    fn set_highlight(&self, element: &str, on: bool) -> Result<(), DispatchError>;
    fn show_toast(&self, toast: &Toast) -> Result<(), DispatchError>;
}

/// Tracks when each highlighted element must be cleared.
///
/// Re-highlighting an element moves its deadline to the latest call; every
/// element is eventually returned by `expire`.
#[derive(Debug, Default)]
pub struct HighlightTracker {
    deadlines: HashMap<String, Instant>,
}

impl HighlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a highlight and returns its deadline.
    pub fn highlight(&mut self, element: &str, duration: Duration, now: Instant) -> Instant {
        let deadline = now + duration;
        self.deadlines.insert(element.to_string(), deadline);
        deadline
    }

    /// Like [`highlight`](Self::highlight), but never shortens an outline
    /// that is already due to last longer.
    pub fn extend(&mut self, element: &str, duration: Duration, now: Instant) -> Instant {
        let deadline = now + duration;
        let entry = self.deadlines.entry(element.to_string()).or_insert(deadline);
        *entry = (*entry).max(deadline);
        deadline
    }

    pub fn is_highlighted(&self, element: &str, now: Instant) -> bool {
        self.deadlines.get(element).is_some_and(|d| *d > now)
    }

    /// Removes and returns every element whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(element, _)| element.clone())
            .collect();
        for element in &expired {
            self.deadlines.remove(element);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes every tracked element, returning them so they can be cleared.
    pub fn drain(&mut self) -> Vec<String> {
        self.deadlines.drain().map(|(element, _)| element).collect()
    }
}
