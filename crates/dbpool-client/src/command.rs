//! Commands bound to a connection's session.

use std::sync::Arc;

use dbpool_session::{Session, Statement, TransactionId};
use tracing::Instrument;

use crate::error::Result;
use crate::instrumentation::{extract_operation, sanitize_statement, span_names};

/// A SQL command bound to one session.
///
/// Created by [`ConnectionHandle::new_command`](crate::ConnectionHandle::new_command)
/// or [`Transaction::command`](crate::Transaction::command). Commands can be
/// executed any number of times.
pub struct Command {
    connection_id: u64,
    session: Arc<dyn Session>,
    statement: Statement,
}

impl Command {
    pub(crate) fn new(connection_id: u64, session: Arc<dyn Session>, sql: impl Into<String>) -> Self {
        Self {
            connection_id,
            session,
            statement: Statement::new(sql),
        }
    }

    pub(crate) fn in_transaction(mut self, id: TransactionId) -> Self {
        self.statement = self.statement.in_transaction(id);
        self
    }

    /// Get the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.statement.sql
    }

    /// Replace the SQL text, keeping the session and transaction binding.
    pub fn set_sql(&mut self, sql: impl Into<String>) {
        self.statement.sql = sql.into();
    }

    /// The transaction this command runs in, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.statement.transaction
    }

    /// Execute the command, returning the number of affected rows.
    pub async fn execute(&self) -> Result<u64> {
        let sql = self.sql();
        let span = tracing::debug_span!(
            "execute",
            otel.name = span_names::EXECUTE,
            connection_id = self.connection_id,
            operation = extract_operation(sql),
        );
        async {
            tracing::debug!(
                statement = %sanitize_statement(sql),
                transaction = ?self.statement.transaction,
                "executing command"
            );
            let affected = self.session.execute(&self.statement).await?;
            Ok(affected)
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("connection_id", &self.connection_id)
            .field("statement", &self.statement)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use dbpool_testing::{MockBehavior, MockSession};

    use super::*;

    #[tokio::test]
    async fn test_command_reuse() {
        let session = Arc::new(MockSession::new(0, MockBehavior::default()));
        session.open().await.unwrap();

        let mut command = Command::new(1, session.clone(), "UPDATE a SET x = 1");
        assert_eq!(command.execute().await.unwrap(), 1);

        command.set_sql("UPDATE b SET y = 2");
        command.execute().await.unwrap();

        assert_eq!(
            session.statements(),
            vec!["UPDATE a SET x = 1", "UPDATE b SET y = 2"]
        );
    }

    #[tokio::test]
    async fn test_command_on_closed_session_fails() {
        let session = Arc::new(MockSession::new(0, MockBehavior::default()));
        let command = Command::new(1, session, "SELECT 1").in_transaction(TransactionId(4));
        assert_eq!(command.transaction(), Some(TransactionId(4)));
        assert!(command.execute().await.is_err());
    }
}
