//! Transaction support.

use std::sync::Arc;

use dbpool_session::{Session, TransactionId};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::Instrument;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::instrumentation::span_names;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Read uncommitted (dirty reads allowed).
    ReadUncommitted,
    /// Read committed.
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable (highest isolation).
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL statement to set this isolation level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED",
            Self::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            Self::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            Self::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// A transaction on one connection's session.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// A transaction dropped while still open is rolled back in the background
/// when a Tokio runtime is available.
pub struct Transaction {
    id: TransactionId,
    connection_id: u64,
    session: Arc<dyn Session>,
    isolation: Option<IsolationLevel>,
    finished: bool,
}

impl Transaction {
    pub(crate) async fn begin(
        connection_id: u64,
        session: Arc<dyn Session>,
        isolation: Option<IsolationLevel>,
    ) -> Result<Self> {
        let span = tracing::debug_span!(
            "begin_transaction",
            otel.name = span_names::BEGIN_TRANSACTION,
            connection_id,
            isolation = ?isolation,
        );
        let id = session
            .begin_transaction(isolation.map(|level| level.as_sql()))
            .instrument(span)
            .await?;
        tracing::debug!(connection_id, transaction = %id, "began transaction");

        Ok(Self {
            id,
            connection_id,
            session,
            isolation,
            finished: false,
        })
    }

    /// Server-assigned transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The requested isolation level, `None` for the server default.
    #[must_use]
    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    /// A command that runs inside this transaction.
    #[must_use]
    pub fn command(&self, sql: impl Into<String>) -> Command {
        Command::new(self.connection_id, Arc::clone(&self.session), sql).in_transaction(self.id)
    }

    /// Execute `sql` inside this transaction.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.command(sql).execute().await
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        let span = tracing::debug_span!(
            "commit",
            otel.name = span_names::COMMIT,
            connection_id = self.connection_id,
            transaction = %self.id,
        );
        self.session.commit(self.id).instrument(span).await?;
        Ok(())
    }

    /// Roll back the transaction.
    pub async fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let span = tracing::debug_span!(
            "rollback",
            otel.name = span_names::ROLLBACK,
            connection_id = self.connection_id,
            transaction = %self.id,
        );
        self.session.rollback(self.id).instrument(span).await?;
        Ok(())
    }

    /// Create a savepoint.
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        tracing::debug!(name = name, "creating savepoint");
        self.execute(&format!("SAVEPOINT {name}")).await?;
        Ok(())
    }

    /// Roll back to a savepoint.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;
        tracing::debug!(name = name, "rolling back to savepoint");
        self.execute(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(
            connection_id = self.connection_id,
            transaction = %self.id,
            "transaction dropped without commit or rollback"
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let session = Arc::clone(&self.session);
            let id = self.id;
            runtime.spawn(async move {
                if let Err(e) = session.rollback(id).await {
                    tracing::debug!(transaction = %id, error = %e, "background rollback failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("isolation", &self.isolation)
            .finish()
    }
}

/// Validate an identifier (savepoint name, ...) to prevent SQL injection.
fn validate_identifier(name: &str) -> Result<()> {
    #[allow(clippy::expect_used)]
    static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_$]{0,63}$").expect("identifier pattern is valid")
    });

    if name.is_empty() {
        return Err(Error::InvalidIdentifier(
            "identifier cannot be empty".into(),
        ));
    }

    if !IDENTIFIER_RE.is_match(name) {
        return Err(Error::InvalidIdentifier(format!(
            "invalid identifier '{name}': must start with letter/underscore, \
             contain only alphanumerics/_/$, and be 1-64 characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dbpool_testing::{MockBehavior, MockSession};

    use super::*;

    async fn open_session() -> Arc<MockSession> {
        let session = Arc::new(MockSession::new(0, MockBehavior::default()));
        session.open().await.unwrap();
        session
    }

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("before_update").is_ok());
        assert!(validate_identifier("Sp1").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn test_validate_identifier_invalid() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("sp-name").is_err());
        assert!(validate_identifier("sp; DROP TABLE users").is_err());
    }

    #[tokio::test]
    async fn test_savepoints_run_inside_transaction() {
        let session = open_session().await;
        let tx = Transaction::begin(1, session.clone(), None).await.unwrap();

        tx.savepoint("before_bonus").await.unwrap();
        tx.rollback_to_savepoint("before_bonus").await.unwrap();
        assert!(tx.savepoint("bad name").await.is_err());
        tx.rollback().await.unwrap();

        assert_eq!(
            session.statements(),
            vec![
                "BEGIN tx#1",
                "tx#1 SAVEPOINT before_bonus",
                "tx#1 ROLLBACK TO SAVEPOINT before_bonus",
                "ROLLBACK tx#1",
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let session = open_session().await;
        let tx = Transaction::begin(1, session.clone(), Some(IsolationLevel::ReadCommitted))
            .await
            .unwrap();
        assert_eq!(tx.isolation_level(), Some(IsolationLevel::ReadCommitted));
        drop(tx);

        for _ in 0..10 {
            if session.statements().iter().any(|s| s == "ROLLBACK tx#1") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background rollback did not run: {:?}", session.statements());
    }
}
