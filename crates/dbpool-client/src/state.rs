//! Observed physical state of a connection.
//!
//! The session's I/O task writes the state through the
//! [`StateListener`] callback; any thread may read it. A single atomic
//! keeps reads and writes untorn without a lock.

use std::sync::atomic::{AtomicU8, Ordering};

use dbpool_session::{SessionState, StateChange, StateListener};

/// Last physical state reported by a session.
#[derive(Debug)]
pub struct ObservedState {
    connection_id: u64,
    state: AtomicU8,
}

impl ObservedState {
    /// Start observing in the `Closed` state.
    #[must_use]
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            state: AtomicU8::new(SessionState::Closed.as_u8()),
        }
    }

    /// The last reported state.
    #[must_use]
    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl StateListener for ObservedState {
    fn on_state_change(&self, change: StateChange) {
        tracing::trace!(
            connection_id = self.connection_id,
            previous = %change.previous,
            current = %change.current,
            "connection state changed"
        );
        self.state.store(change.current.as_u8(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        assert_eq!(ObservedState::new(1).load(), SessionState::Closed);
    }

    #[test]
    fn test_records_latest_transition() {
        let observed = ObservedState::new(1);
        observed.on_state_change(StateChange::new(
            SessionState::Closed,
            SessionState::Connecting,
        ));
        observed.on_state_change(StateChange::new(SessionState::Connecting, SessionState::Open));
        assert_eq!(observed.load(), SessionState::Open);

        // The reported previous state is informational only.
        observed.on_state_change(StateChange::new(SessionState::Fetching, SessionState::Broken));
        assert_eq!(observed.load(), SessionState::Broken);
    }
}
