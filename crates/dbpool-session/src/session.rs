//! Session and driver traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection_string::ConnectionString;
use crate::error::TransportError;
use crate::state::StateListener;

/// Identifier of a server-side transaction, allocated by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// A unit of SQL handed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// SQL text, passed through untouched.
    pub sql: String,
    /// Transaction the statement runs in, `None` for auto-commit.
    pub transaction: Option<TransactionId>,
}

impl Statement {
    /// Create an auto-commit statement.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            transaction: None,
        }
    }

    /// Bind the statement to a transaction.
    #[must_use]
    pub fn in_transaction(mut self, id: TransactionId) -> Self {
        self.transaction = Some(id);
        self
    }
}

/// One physical session with a database server.
///
/// A session is exclusively owned by one connection handle. Methods take
/// `&self` because the state listener may fire from the driver's own I/O
/// task while the handle is using the session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the session. Blocks for the duration of the handshake.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the session.
    async fn close(&self) -> Result<(), TransportError>;

    /// Register the listener that receives every state transition.
    ///
    /// Registering again replaces the previous listener.
    fn set_state_listener(&self, listener: Arc<dyn StateListener>);

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64, TransportError>;

    /// Begin a transaction.
    async fn begin_transaction(&self, setup_sql: Option<&str>)
    -> Result<TransactionId, TransportError>;

    /// Commit a transaction.
    async fn commit(&self, id: TransactionId) -> Result<(), TransportError>;

    /// Roll back a transaction.
    async fn rollback(&self, id: TransactionId) -> Result<(), TransportError>;
}

/// Factory of sessions for a connection string.
pub trait Driver: Send + Sync {
    /// Create a new, closed session.
    fn create_session(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Arc<dyn Session>, TransportError>;
}
