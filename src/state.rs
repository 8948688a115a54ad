//! Conversational state machine
//!
//! The presentation layer observes [`SessionState`] through a watch channel;
//! only [`StateMachine::apply`] changes it.

use std::fmt;

use tokio::sync::watch;

/// State shown by the on-screen indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Which kind of conversation is driving the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One-shot text submission answered by TTS
    Text,
    /// Continuous bidirectional audio session
    Live,
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// User submitted text
    TextSubmitted,
    /// Live capture started
    LiveStarted,
    /// Live connection confirmed by the server
    ConnectionOpened,
    /// Server finished the user's turn; synthesis begins
    TurnComplete,
    /// Audio for the response arrived
    AudioArrived,
    /// Last segment ended with nothing else queued
    PlaybackDrained,
    /// Server interrupted playback
    Interrupted,
    /// Session closed
    Closed,
    /// Operation failed fatally
    Failed,
}

/// Owner of the current [`SessionState`]
pub struct StateMachine {
    mode: Option<Mode>,
    tx: watch::Sender<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Idle);
        Self { mode: None, tx }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    #[must_use]
    pub const fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Observer for the presentation layer
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Apply an event, returning the new state if it changed
    pub fn apply(&mut self, event: StateEvent) -> Option<SessionState> {
        let from = self.state();
        let Some((to, mode)) = transition(from, self.mode, event) else {
            tracing::trace!(%from, ?event, mode = ?self.mode, "event ignored");
            return None;
        };

        self.mode = mode;
        if to == from {
            return None;
        }

        tracing::debug!(%from, %to, ?event, "session state changed");
        self.tx.send_replace(to);
        Some(to)
    }
}

/// Transition table; `None` means the event has no effect in this state
fn transition(
    from: SessionState,
    mode: Option<Mode>,
    event: StateEvent,
) -> Option<(SessionState, Option<Mode>)> {
    use SessionState::{Idle, Listening, Speaking, Thinking};

    match (from, mode, event) {
        (_, _, StateEvent::Closed | StateEvent::Failed) => Some((Idle, None)),

        (Idle, _, StateEvent::TextSubmitted) => Some((Listening, Some(Mode::Text))),
        (Idle, _, StateEvent::LiveStarted) => Some((Listening, Some(Mode::Live))),

        (Listening, _, StateEvent::ConnectionOpened) => Some((Listening, mode)),

        (Listening, Some(Mode::Text), StateEvent::TurnComplete) => Some((Thinking, mode)),
        (Listening, Some(Mode::Live), StateEvent::TurnComplete) => Some((Listening, mode)),

        (Thinking, Some(_), StateEvent::AudioArrived)
        | (Listening, Some(Mode::Live), StateEvent::AudioArrived)
        | (Speaking, Some(_), StateEvent::AudioArrived) => Some((Speaking, mode)),

        (Speaking, Some(Mode::Text), StateEvent::PlaybackDrained) => Some((Idle, None)),
        (Speaking, Some(Mode::Live), StateEvent::PlaybackDrained) => Some((Listening, mode)),

        (_, Some(Mode::Live), StateEvent::Interrupted) => Some((Listening, mode)),

        _ => None,
    }
}
