//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// No connection became free within the checkout timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// A new connection could not be created or opened.
    #[error("connection error: {0}")]
    Connection(#[from] dbpool_client::Error),

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// The builder was not given a driver.
    #[error("no driver configured")]
    MissingDriver,
}

impl PoolError {
    /// Whether retrying the checkout later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connection(e) => e.is_connection_error(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use dbpool_session::TransportError;

    use super::*;

    #[test]
    fn test_retryable() {
        assert!(PoolError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            PoolError::Connection(dbpool_client::Error::Connect {
                id: 1,
                source: TransportError::Closed,
            })
            .is_retryable()
        );
        assert!(!PoolError::PoolClosed.is_retryable());
        assert!(!PoolError::MissingDriver.is_retryable());
    }
}
