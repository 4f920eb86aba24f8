//! Session State Machine for one listen -> respond interaction.
//!
//! `transition` is the single authoritative writer: it accepts only an edge
//! of the graph below from the current state and ignores everything else.
//!
//! ```text
//! Idle -> Listening -> Transcribing -> Generating -> Speaking -> Idle
//!                      Transcribing -> Idle
//! any  -> Error -> Idle
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::feedback::FeedbackDevice;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Transcribing,
    Generating,
    Speaking,
    Error,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        Self::Idle,
        Self::Listening,
        Self::Transcribing,
        Self::Generating,
        Self::Speaking,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Listening)
                | (Listening, Transcribing)
                | (Transcribing, Generating)
                | (Transcribing, Idle)
                | (Generating, Speaking)
                | (Speaking, Idle)
                | (Error, Idle)
        ) || (next == Error && self != Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted edge, as delivered to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub state: SessionState,
    pub last_transition: DateTime<Utc>,
    /// Set while in `Error`, cleared when the session resets to `Idle`
    pub error: Option<String>,
    /// Completed listen -> respond cycles
    pub cycle: u64,
}

pub struct SessionMachine {
    session: Mutex<Session>,
    sinks: Vec<Arc<dyn FeedbackDevice>>,
    events: broadcast::Sender<Transition>,
}

impl SessionMachine {
    pub fn new(sinks: Vec<Arc<dyn FeedbackDevice>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let machine = Self {
            session: Mutex::new(Session {
                state: SessionState::Idle,
                last_transition: Utc::now(),
                error: None,
                cycle: 0,
            }),
            sinks,
            events,
        };
        machine.deliver(SessionState::Idle);
        machine
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    /// Apply `to` if it is a valid edge from the current state.
    /// Returns whether the transition was taken.
    pub fn transition(&self, to: SessionState) -> bool {
        self.apply(None, to, None)
    }

    /// Apply `to` only if the session is still in `expected`. Lets a late
    /// writer (a timeout, a cancelled turn) lose the race quietly.
    pub fn transition_from(&self, expected: SessionState, to: SessionState) -> bool {
        self.apply(Some(expected), to, None)
    }

    /// Enter `Error` with a detail for observers
    pub fn fail(&self, detail: impl Into<String>) -> bool {
        self.apply(None, SessionState::Error, Some(detail.into()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, expected: Option<SessionState>, to: SessionState, detail: Option<String>) -> bool {
        let mut session = self.lock();
        let from = session.state;

        if expected.is_some_and(|e| e != from) || !from.can_transition_to(to) {
            tracing::trace!(from = from.as_str(), to = to.as_str(), "transition rejected");
            return false;
        }

        let at = Utc::now();
        session.state = to;
        session.last_transition = at;
        match to {
            SessionState::Error => session.error = detail.clone(),
            SessionState::Idle => {
                session.error = None;
                session.cycle += 1;
            }
            _ => {}
        }
        tracing::debug!(from = from.as_str(), state = to.as_str(), "session transition");

        // Delivered under the lock so devices see states in program order
        self.deliver(to);
        let _ = self.events.send(Transition { from, to, at, detail });
        true
    }

    fn deliver(&self, state: SessionState) {
        for sink in &self.sinks {
            if let Err(e) = sink.apply(state) {
                tracing::warn!(state = state.as_str(), error = %e, "feedback device failed");
            }
        }
    }
}
