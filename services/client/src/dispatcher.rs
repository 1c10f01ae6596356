//! Action Dispatcher
//!
//! Applies assistant-issued UI commands to the host surface. Commands are
//! fire-and-forget: failures are logged and never reach the transcript.
//! Timed work (highlight removal, actions that follow a preview highlight)
//! is kept as deadlines that the session loop drives through [`ActionDispatcher::tick`].

use pam_core::actions::{
    DispatchError, HighlightTracker, PREVIEW_HIGHLIGHT_DURATION, UiCommand, UiSurface,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
enum Deferred {
    Navigate(String),
    FillForm {
        form_id: String,
        data: Map<String, Value>,
    },
}

pub struct ActionDispatcher {
    surface: Arc<dyn UiSurface>,
    highlights: HighlightTracker,
    deferred: Vec<(Instant, Deferred)>,
}

impl ActionDispatcher {
    pub fn new(surface: Arc<dyn UiSurface>) -> Self {
        Self {
            surface,
            highlights: HighlightTracker::new(),
            deferred: Vec::new(),
        }
    }

    /// Parses and applies one command frame.
    #[instrument(skip(self, payload))]
    pub fn dispatch(&mut self, action: Option<&str>, payload: &Value, now: Instant) {
        match UiCommand::parse(action, payload) {
            Ok(command) => self.apply(command, now),
            Err(e) => warn!("Ignoring UI command: {}", e),
        }
    }

    pub fn apply(&mut self, command: UiCommand, now: Instant) {
        let result = match command {
            UiCommand::Navigate { route, trigger } => match trigger {
                Some(element) => self
                    .preview(&element, now)
                    .map(|at| self.deferred.push((at, Deferred::Navigate(route)))),
                None => self.surface.navigate(&route),
            },
            UiCommand::FillForm { form_id, data } => self
                .preview(&form_id, now)
                .map(|at| self.deferred.push((at, Deferred::FillForm { form_id, data }))),
            UiCommand::Highlight { element, duration } => {
                self.highlights.highlight(&element, duration, now);
                self.surface.set_highlight(&element, true)
            }
            UiCommand::Toast(toast) => self.surface.show_toast(&toast),
            UiCommand::Unknown(kind) => {
                debug!(kind, "Unknown UI command ignored");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("UI command failed: {}", e);
        }
    }

    /// Briefly outlines `element` and returns when the follow-up action is due.
    fn preview(&mut self, element: &str, now: Instant) -> Result<Instant, DispatchError> {
        let at = self
            .highlights
            .extend(element, PREVIEW_HIGHLIGHT_DURATION, now);
        match self.surface.set_highlight(element, true) {
            // A missing preview target must not block the action itself.
            Err(DispatchError::TargetNotFound(target)) => {
                debug!(target, "Preview highlight target not found");
                Ok(now)
            }
            other => other.map(|_| at),
        }
    }

    /// The earliest instant `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let deferred = self.deferred.iter().map(|(at, _)| *at).min();
        match (deferred, self.highlights.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs due follow-up actions and removes expired highlights.
    pub fn tick(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.deferred.drain(..).partition(|(at, _)| *at <= now);
        self.deferred = pending;

        for (_, action) in due {
            let result = match action {
                Deferred::Navigate(route) => self.surface.navigate(&route),
                Deferred::FillForm { form_id, data } => self.fill_form(&form_id, &data),
            };
            if let Err(e) = result {
                warn!("UI command failed: {}", e);
            }
        }

        for element in self.highlights.expire(now) {
            if let Err(e) = self.surface.set_highlight(&element, false) {
                debug!("Could not clear highlight on {}: {}", element, e);
            }
        }
    }

    fn fill_form(&self, form_id: &str, data: &Map<String, Value>) -> Result<(), DispatchError> {
        for (field, value) in data {
            self.surface.set_field(form_id, field, value)?;
        }
        Ok(())
    }

    /// Drops pending actions and clears every highlight.
    pub fn reset(&mut self) {
        self.deferred.clear();
        for element in self.highlights.drain() {
            let _ = self.surface.set_highlight(&element, false);
        }
    }
}
