//! Client error types.

use std::time::Duration;

use dbpool_session::TransportError;
use thiserror::Error;

/// Errors raised by connection handles and their adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The session could not be opened.
    #[error("failed to open connection {id}: {source}")]
    Connect {
        /// Connection id.
        id: u64,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// Opening the session did not finish in time.
    #[error("connection {id} did not open within {timeout:?}")]
    ConnectTimeout {
        /// Connection id.
        id: u64,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// `prepare` was called on a handle that already has an adapter.
    #[error("connection {id} is already checked out")]
    AlreadyCheckedOut {
        /// Connection id.
        id: u64,
    },

    /// Transport failure while executing work.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A transaction was begun while another one is open on the adapter.
    #[error("a transaction is already open")]
    TransactionInProgress,

    /// A transaction operation was requested with no transaction open.
    #[error("no transaction is open")]
    NoTransaction,

    /// Invalid savepoint or other identifier.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error means the connection should be retired.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } => true,
            Self::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_classification() {
        let err = Error::Connect {
            id: 3,
            source: TransportError::Refused("denied".into()),
        };
        assert!(err.is_connection_error());
        assert!(err.to_string().contains("connection 3"));

        assert!(Error::Transport(TransportError::Closed).is_connection_error());
        assert!(!Error::Transport(TransportError::Transaction("x".into())).is_connection_error());
        assert!(!Error::AlreadyCheckedOut { id: 1 }.is_connection_error());
    }
}
