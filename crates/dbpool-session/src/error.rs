//! Transport-level error types.

use thiserror::Error;

/// Errors reported by a driver session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// IO error on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server refused the session (authentication, unknown database, ...).
    #[error("session refused: {0}")]
    Refused(String),

    /// The session is not open.
    #[error("session closed")]
    Closed,

    /// The server sent something the driver could not interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A transaction operation was rejected by the server.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl TransportError {
    /// Whether the session must be considered unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Closed | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let io = TransportError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(io.is_fatal());
        assert!(TransportError::Closed.is_fatal());
        assert!(!TransportError::Refused("bad password".into()).is_fatal());
        assert!(!TransportError::Transaction("deadlock".into()).is_fatal());
    }
}
