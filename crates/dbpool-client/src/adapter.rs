//! Query adapters.
//!
//! A handle holds exactly one adapter while it is checked out. The adapter
//! decides how work reaches the session: [`AutoCommitAdapter`] commits every
//! statement on its own, [`TransactionAdapter`] leaves commit and rollback
//! boundaries to the caller.

use async_trait::async_trait;
use dbpool_session::TransactionId;
use tokio::sync::Mutex;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::handle::{ConnectionHandle, SessionFactory};
use crate::transaction::{IsolationLevel, Transaction};

/// Which adapter variant is assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Every statement commits on its own.
    AutoCommit,
    /// The caller commits or rolls back explicitly.
    Transactional,
}

/// Executes work against a connection's session.
#[async_trait]
pub trait QueryReactor: Send + Sync {
    /// The adapter variant.
    fn kind(&self) -> AdapterKind;

    /// Execute `sql`, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;
}

/// Adapter that runs each statement outside any transaction.
pub struct AutoCommitAdapter {
    factory: SessionFactory,
}

impl AutoCommitAdapter {
    /// Build an adapter over `handle`'s command factory.
    #[must_use]
    pub fn new(handle: &ConnectionHandle) -> Self {
        Self {
            factory: handle.factory(),
        }
    }

    /// A fresh command on the session.
    #[must_use]
    pub fn command(&self, sql: impl Into<String>) -> Command {
        self.factory.new_command(sql)
    }
}

#[async_trait]
impl QueryReactor for AutoCommitAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::AutoCommit
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.command(sql).execute().await
    }
}

/// Adapter with caller-controlled transaction boundaries.
///
/// The first `execute` without an open transaction begins one at the
/// server's default isolation level. Call [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) to end it.
pub struct TransactionAdapter {
    factory: SessionFactory,
    transaction: Mutex<Option<Transaction>>,
}

impl TransactionAdapter {
    /// Build an adapter over `handle`'s command and transaction factories.
    #[must_use]
    pub fn new(handle: &ConnectionHandle) -> Self {
        Self {
            factory: handle.factory(),
            transaction: Mutex::new(None),
        }
    }

    /// Begin a transaction explicitly.
    pub async fn begin(&self, isolation: Option<IsolationLevel>) -> Result<TransactionId> {
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Err(Error::TransactionInProgress);
        }
        let tx = self.factory.begin_transaction(isolation).await?;
        let id = tx.id();
        *slot = Some(tx);
        Ok(id)
    }

    /// Commit the open transaction.
    pub async fn commit(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take();
        tx.ok_or(Error::NoTransaction)?.commit().await
    }

    /// Roll back the open transaction.
    pub async fn rollback(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take();
        tx.ok_or(Error::NoTransaction)?.rollback().await
    }

    /// Create a savepoint in the open transaction.
    pub async fn savepoint(&self, name: &str) -> Result<()> {
        let slot = self.transaction.lock().await;
        slot.as_ref().ok_or(Error::NoTransaction)?.savepoint(name).await
    }

    /// Roll back to a savepoint in the open transaction.
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let slot = self.transaction.lock().await;
        slot.as_ref()
            .ok_or(Error::NoTransaction)?
            .rollback_to_savepoint(name)
            .await
    }

    /// Whether a transaction is open.
    pub async fn has_open_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }

    /// Whether a transaction may be open, without waiting. A transaction
    /// operation in flight counts as open.
    #[must_use]
    pub fn may_have_open_transaction(&self) -> bool {
        self.transaction
            .try_lock()
            .map_or(true, |slot| slot.is_some())
    }

    /// Roll back any open transaction. Returns whether one was open.
    pub async fn reset(&self) -> Result<bool> {
        let tx = self.transaction.lock().await.take();
        match tx {
            Some(tx) => {
                tracing::debug!(
                    connection_id = self.factory.connection_id(),
                    transaction = %tx.id(),
                    "rolling back transaction left open"
                );
                tx.rollback().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl QueryReactor for TransactionAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Transactional
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut slot = self.transaction.lock().await;
        if slot.is_none() {
            let tx = self.factory.begin_transaction(None).await?;
            *slot = Some(tx);
        }
        match slot.as_ref() {
            Some(tx) => tx.execute(sql).await,
            None => Err(Error::NoTransaction),
        }
    }
}

/// The adapter assigned to a checked-out handle.
pub enum QueryAdapter {
    /// See [`AutoCommitAdapter`].
    AutoCommit(AutoCommitAdapter),
    /// See [`TransactionAdapter`].
    Transactional(TransactionAdapter),
}

impl QueryAdapter {
    /// The auto-commit adapter, if that variant is assigned.
    #[must_use]
    pub fn as_auto_commit(&self) -> Option<&AutoCommitAdapter> {
        match self {
            Self::AutoCommit(a) => Some(a),
            Self::Transactional(_) => None,
        }
    }

    /// The transactional adapter, if that variant is assigned.
    #[must_use]
    pub fn as_transactional(&self) -> Option<&TransactionAdapter> {
        match self {
            Self::AutoCommit(_) => None,
            Self::Transactional(t) => Some(t),
        }
    }

    /// Whether a transaction is open.
    pub async fn has_open_transaction(&self) -> bool {
        match self {
            Self::AutoCommit(_) => false,
            Self::Transactional(t) => t.has_open_transaction().await,
        }
    }

    /// Non-waiting variant of [`has_open_transaction`](Self::has_open_transaction).
    #[must_use]
    pub fn may_have_open_transaction(&self) -> bool {
        match self {
            Self::AutoCommit(_) => false,
            Self::Transactional(t) => t.may_have_open_transaction(),
        }
    }

    /// Roll back anything the adapter left open. Returns whether a rollback
    /// was needed.
    pub async fn reset(&self) -> Result<bool> {
        match self {
            Self::AutoCommit(_) => Ok(false),
            Self::Transactional(t) => t.reset().await,
        }
    }
}

#[async_trait]
impl QueryReactor for QueryAdapter {
    fn kind(&self) -> AdapterKind {
        match self {
            Self::AutoCommit(a) => a.kind(),
            Self::Transactional(t) => t.kind(),
        }
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        match self {
            Self::AutoCommit(a) => a.execute(sql).await,
            Self::Transactional(t) => t.execute(sql).await,
        }
    }
}

impl std::fmt::Debug for QueryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("QueryAdapter").field(&self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use dbpool_testing::{MockBehavior, MockSession};
    use tokio::time::Instant;

    use super::*;
    use crate::handle::HandleOwner;

    struct NoOwner;

    impl HandleOwner for NoOwner {
        fn connection_string(&self) -> &dbpool_session::ConnectionString {
            unreachable!("not used by adapter tests")
        }

        fn report_done(&self, _handle: &ConnectionHandle) -> bool {
            true
        }
    }

    async fn connected_handle() -> (ConnectionHandle, Arc<MockSession>) {
        let session = Arc::new(MockSession::new(0, MockBehavior::default()));
        let owner: Weak<dyn HandleOwner> = Weak::<NoOwner>::new();
        let handle = ConnectionHandle::with_creation_time(3, owner, session.clone(), Instant::now());
        handle.connect().await.unwrap();
        (handle, session)
    }

    #[tokio::test]
    async fn test_auto_commit_runs_outside_transactions() {
        let (handle, session) = connected_handle().await;
        let adapter = AutoCommitAdapter::new(&handle);

        adapter.execute("INSERT INTO log VALUES (1)").await.unwrap();
        adapter.execute("INSERT INTO log VALUES (2)").await.unwrap();

        assert_eq!(
            session.statements(),
            vec!["INSERT INTO log VALUES (1)", "INSERT INTO log VALUES (2)"]
        );
    }

    #[tokio::test]
    async fn test_transactional_begins_lazily_and_commits() {
        let (handle, session) = connected_handle().await;
        let adapter = TransactionAdapter::new(&handle);
        assert!(!adapter.has_open_transaction().await);

        adapter.execute("UPDATE a SET x = 1").await.unwrap();
        adapter.execute("UPDATE b SET y = 2").await.unwrap();
        assert!(adapter.has_open_transaction().await);
        adapter.commit().await.unwrap();
        assert!(!adapter.has_open_transaction().await);

        assert_eq!(
            session.statements(),
            vec![
                "BEGIN tx#1",
                "tx#1 UPDATE a SET x = 1",
                "tx#1 UPDATE b SET y = 2",
                "COMMIT tx#1",
            ]
        );
    }

    #[tokio::test]
    async fn test_transactional_explicit_boundaries() {
        let (handle, _session) = connected_handle().await;
        let adapter = TransactionAdapter::new(&handle);

        assert!(matches!(adapter.commit().await, Err(Error::NoTransaction)));
        assert!(matches!(adapter.savepoint("s1").await, Err(Error::NoTransaction)));

        let id = adapter
            .begin(Some(IsolationLevel::RepeatableRead))
            .await
            .unwrap();
        assert_eq!(id, TransactionId(1));
        assert!(matches!(
            adapter.begin(None).await,
            Err(Error::TransactionInProgress)
        ));

        adapter.savepoint("s1").await.unwrap();
        adapter.rollback_to_savepoint("s1").await.unwrap();
        adapter.rollback().await.unwrap();
        assert!(matches!(adapter.rollback().await, Err(Error::NoTransaction)));
    }

    #[tokio::test]
    async fn test_reset_rolls_back_open_transaction() {
        let (handle, session) = connected_handle().await;
        let adapter = QueryAdapter::Transactional(TransactionAdapter::new(&handle));

        adapter.execute("DELETE FROM cart").await.unwrap();
        assert!(adapter.reset().await.unwrap());
        assert!(!adapter.reset().await.unwrap());
        assert_eq!(session.statements().last().map(String::as_str), Some("ROLLBACK tx#1"));

        adapter.execute("DELETE FROM cart").await.unwrap();
        assert!(adapter.has_open_transaction().await);
        assert!(adapter.may_have_open_transaction());
        adapter.reset().await.unwrap();
        assert!(!adapter.may_have_open_transaction());

        let auto = QueryAdapter::AutoCommit(AutoCommitAdapter::new(&handle));
        assert!(!auto.reset().await.unwrap());
        assert_eq!(auto.kind(), AdapterKind::AutoCommit);
        assert!(auto.as_auto_commit().is_some());
        assert!(auto.as_transactional().is_none());
    }
}
