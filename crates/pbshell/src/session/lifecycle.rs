//! Background reader lifecycle.
//!
//! The reader moves through `Idle → Running → Stopping → Stopped`, and may
//! return to `Running` from `Stopped` when the session reconnects. Only the
//! session controller performs transitions; an invalid request is reported
//! instead of applied, which is what makes a second teardown a no-op.

use std::fmt;

use thiserror::Error;

/// State of a session's background reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    /// Never connected.
    Idle,
    /// Connected; the reader is polling the shell.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Torn down; a new connect is allowed.
    Stopped,
}

impl ReaderState {
    /// Returns true if a connect may start from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, ReaderState::Idle | ReaderState::Stopped)
    }

    /// Returns true if `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: ReaderState) -> bool {
        use ReaderState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Stopped, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReaderState::Idle => "idle",
            ReaderState::Running => "running",
            ReaderState::Stopping => "stopping",
            ReaderState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A rejected lifecycle transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid reader transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ReaderState,
    pub to: ReaderState,
}

/// Lifecycle tracker owned by the session controller.
#[derive(Debug)]
pub struct ReaderLifecycle {
    state: ReaderState,
}

impl ReaderLifecycle {
    /// Starts in [`ReaderState::Idle`].
    pub fn new() -> Self {
        Self {
            state: ReaderState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Moves to `next` if legal.
    pub fn transition(&mut self, next: ReaderState) -> Result<ReaderState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        tracing::trace!(from = %previous, to = %next, "Reader lifecycle transition");
        Ok(previous)
    }
}

impl Default for ReaderLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_and_reconnect() {
        let mut lc = ReaderLifecycle::new();
        assert_eq!(lc.state(), ReaderState::Idle);
        lc.transition(ReaderState::Running).unwrap();
        lc.transition(ReaderState::Stopping).unwrap();
        lc.transition(ReaderState::Stopped).unwrap();
        assert!(lc.state().can_connect());
        lc.transition(ReaderState::Running).unwrap();
        assert_eq!(lc.state(), ReaderState::Running);
    }

    #[test]
    fn test_double_stop_rejected() {
        let mut lc = ReaderLifecycle::new();
        lc.transition(ReaderState::Running).unwrap();
        lc.transition(ReaderState::Stopping).unwrap();
        assert_eq!(
            lc.transition(ReaderState::Stopping),
            Err(InvalidTransition {
                from: ReaderState::Stopping,
                to: ReaderState::Stopping,
            })
        );
    }

    #[test]
    fn test_cannot_run_twice() {
        let mut lc = ReaderLifecycle::new();
        lc.transition(ReaderState::Running).unwrap();
        assert!(lc.transition(ReaderState::Running).is_err());
        assert!(!lc.state().can_connect());
    }

    #[test]
    fn test_idle_cannot_stop() {
        let mut lc = ReaderLifecycle::new();
        assert!(lc.transition(ReaderState::Stopping).is_err());
        assert!(lc.transition(ReaderState::Stopped).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ReaderState::Stopping.to_string(), "stopping");
        let err = InvalidTransition {
            from: ReaderState::Idle,
            to: ReaderState::Stopped,
        };
        assert_eq!(err.to_string(), "invalid reader transition idle -> stopped");
    }
}
