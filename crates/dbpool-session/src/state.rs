//! Physical session states and the state-change callback.

use std::fmt;

/// Physical state of a driver session.
///
/// The usual progression is `Closed → Connecting → Open → {Executing,
/// Fetching} → Open → Closed`. Any state may move to `Broken` when the
/// transport fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    /// No session is open.
    #[default]
    Closed = 0,
    /// The session is open and idle.
    Open = 1,
    /// The session is being opened.
    Connecting = 2,
    /// A command is executing.
    Executing = 3,
    /// Rows are being fetched.
    Fetching = 4,
    /// The session failed and cannot be used again.
    Broken = 5,
}

impl SessionState {
    /// Decode a state from its `repr(u8)` value.
    ///
    /// Unknown values decode as `Broken`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            2 => Self::Connecting,
            3 => Self::Executing,
            4 => Self::Fetching,
            _ => Self::Broken,
        }
    }

    /// The `repr(u8)` value of this state.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether work can be issued on a session in this state.
    #[must_use]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Open | Self::Executing | Self::Fetching)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::Connecting => "connecting",
            Self::Executing => "executing",
            Self::Fetching => "fetching",
            Self::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// A transition reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub previous: SessionState,
    /// State after the transition.
    pub current: SessionState,
}

impl StateChange {
    /// Create a new transition record.
    #[must_use]
    pub fn new(previous: SessionState, current: SessionState) -> Self {
        Self { previous, current }
    }
}

/// Receiver of session state transitions.
///
/// Called from whatever thread or task the driver performs its I/O on, so
/// implementations must be cheap and must not block.
pub trait StateListener: Send + Sync {
    /// Invoked once per transition.
    fn on_state_change(&self, change: StateChange);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repr_roundtrip_for_every_state() {
        for state in [
            SessionState::Closed,
            SessionState::Open,
            SessionState::Connecting,
            SessionState::Executing,
            SessionState::Fetching,
            SessionState::Broken,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn test_unknown_value_is_broken() {
        assert_eq!(SessionState::from_u8(42), SessionState::Broken);
    }

    #[test]
    fn test_usable_states() {
        assert!(SessionState::Open.is_usable());
        assert!(SessionState::Fetching.is_usable());
        assert!(!SessionState::Closed.is_usable());
        assert!(!SessionState::Connecting.is_usable());
        assert!(!SessionState::Broken.is_usable());
    }
}
