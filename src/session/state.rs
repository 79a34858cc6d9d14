//! Session lifecycle state machine.
//!
//! `Connecting -> Authenticating -> Streaming -> Closing -> Closed`, with
//! `Failed(reason)` reachable from any non-terminal state. Termination is
//! first-signal-wins: once a session is Closing or terminal, further close
//! and failure requests are no-ops rather than errors.

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of one browser-to-shell pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Browser handshake accepted; no shell yet.
    Connecting,
    /// Shell open (connect + auth + PTY) in flight.
    Authenticating,
    /// Pump active.
    Streaming,
    /// Both sides being closed.
    Closing,
    /// Fully torn down.
    Closed,
    /// Terminated with an error.
    Failed,
}

impl SessionState {
    /// Whether no further transitions are accepted.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Invalid lifecycle transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid session state transition: {from:?} -> {to:?}")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Tracks one session's lifecycle and failure reason.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    failure: Option<String>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    /// New machine in `Connecting`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            failure: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Failure reason, once `Failed`.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn invalid(&self, to: SessionState) -> StateError {
        StateError {
            from: self.state,
            to,
        }
    }

    /// Credentials and dimensions received; shell open starting.
    ///
    /// # Errors
    /// Only valid from `Connecting`.
    pub fn begin_authentication(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Connecting => {
                self.state = SessionState::Authenticating;
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Authenticating)),
        }
    }

    /// Shell open succeeded; pump starting.
    ///
    /// # Errors
    /// Only valid from `Authenticating`.
    pub fn begin_streaming(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Authenticating => {
                self.state = SessionState::Streaming;
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Streaming)),
        }
    }

    /// A termination signal was observed. Idempotent: repeated requests and
    /// requests against a terminal state are accepted and ignored.
    pub fn begin_close(&mut self) {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {}
            _ => self.state = SessionState::Closing,
        }
    }

    /// Both sides confirmed closed. Idempotent once closed.
    ///
    /// # Errors
    /// Invalid unless the session was `Closing` (or already `Closed`).
    pub fn complete_close(&mut self) -> Result<(), StateError> {
        match self.state {
            SessionState::Closing | SessionState::Closed => {
                self.state = SessionState::Closed;
                Ok(())
            }
            _ => Err(self.invalid(SessionState::Closed)),
        }
    }

    /// The session failed. A no-op if termination was already underway,
    /// matching the first-signal-wins tie-break.
    pub fn fail(&mut self, reason: impl Into<String>) {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {}
            _ => {
                self.state = SessionState::Failed;
                self.failure = Some(reason.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.state(), SessionState::Connecting);
        sm.begin_authentication().unwrap();
        sm.begin_streaming().unwrap();
        assert_eq!(sm.state(), SessionState::Streaming);
        sm.begin_close();
        assert_eq!(sm.state(), SessionState::Closing);
        sm.complete_close().unwrap();
        assert_eq!(sm.state(), SessionState::Closed);
        assert!(sm.state().is_terminal());
    }

    #[test]
    fn fail_reachable_from_every_non_terminal_state() {
        for steps in 0..3 {
            let mut sm = SessionStateMachine::new();
            if steps >= 1 {
                sm.begin_authentication().unwrap();
            }
            if steps >= 2 {
                sm.begin_streaming().unwrap();
            }
            sm.fail("authentication failed");
            assert_eq!(sm.state(), SessionState::Failed);
            assert_eq!(sm.failure_reason(), Some("authentication failed"));
        }
    }

    #[test]
    fn close_is_idempotent() {
        let mut sm = SessionStateMachine::new();
        sm.begin_authentication().unwrap();
        sm.begin_close();
        sm.begin_close();
        assert_eq!(sm.state(), SessionState::Closing);
        sm.complete_close().unwrap();
        sm.complete_close().unwrap();
        assert_eq!(sm.state(), SessionState::Closed);
    }

    #[test]
    fn first_termination_signal_wins() {
        let mut sm = SessionStateMachine::new();
        sm.begin_authentication().unwrap();
        sm.begin_streaming().unwrap();
        sm.begin_close();
        // A concurrent failure after close started is a no-op.
        sm.fail("late failure");
        assert_eq!(sm.state(), SessionState::Closing);
        assert!(sm.failure_reason().is_none());
    }

    #[test]
    fn terminal_states_reject_forward_transitions() {
        let mut sm = SessionStateMachine::new();
        sm.fail("handshake error");
        assert!(sm.begin_authentication().is_err());
        assert!(sm.begin_streaming().is_err());
        assert!(sm.complete_close().is_err());
        // Close requests are still silently accepted.
        sm.begin_close();
        assert_eq!(sm.state(), SessionState::Failed);
    }

    #[test]
    fn streaming_requires_authenticating() {
        let mut sm = SessionStateMachine::new();
        let err = sm.begin_streaming().unwrap_err();
        assert_eq!(err.from, SessionState::Connecting);
        assert_eq!(err.to, SessionState::Streaming);
    }
}
