//! In-memory driver and session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbpool_session::{
    ConnectionString, Driver, Session, SessionState, StateChange, StateListener, Statement,
    TransactionId, TransportError,
};
use parking_lot::Mutex;

/// How mock sessions behave. Captured when a session is created.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `open` fails with [`TransportError::Refused`].
    pub fail_open: bool,
    /// `close` fails with an IO error.
    pub fail_close: bool,
    /// `open` sleeps this long before completing.
    pub open_delay: Option<Duration>,
}

impl MockBehavior {
    /// Make `open` fail.
    #[must_use]
    pub fn fail_open(mut self, fail: bool) -> Self {
        self.fail_open = fail;
        self
    }

    /// Make `close` fail.
    #[must_use]
    pub fn fail_close(mut self, fail: bool) -> Self {
        self.fail_close = fail;
        self
    }

    /// Delay `open`.
    #[must_use]
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

struct SessionInner {
    state: SessionState,
    listener: Option<Arc<dyn StateListener>>,
    statements: Vec<String>,
    next_transaction: u64,
    opens: u32,
    closes: u32,
}

/// A session that lives entirely in memory.
pub struct MockSession {
    id: u64,
    behavior: MockBehavior,
    inner: Mutex<SessionInner>,
}

impl MockSession {
    /// Create a closed session.
    #[must_use]
    pub fn new(id: u64, behavior: MockBehavior) -> Self {
        Self {
            id,
            behavior,
            inner: Mutex::new(SessionInner {
                state: SessionState::Closed,
                listener: None,
                statements: Vec::new(),
                next_transaction: 1,
                opens: 0,
                closes: 0,
            }),
        }
    }

    /// Driver-assigned session number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current physical state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Statements and transaction commands received so far.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.inner.lock().statements.clone()
    }

    /// Number of successful opens.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.inner.lock().opens
    }

    /// Number of close attempts.
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.inner.lock().closes
    }

    /// Whether a listener has been registered.
    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.inner.lock().listener.is_some()
    }

    /// Simulate a transport failure.
    pub fn break_session(&self) {
        self.transition(SessionState::Broken);
    }

    /// Move to `state` and notify the listener outside the lock.
    pub fn transition(&self, state: SessionState) {
        let (change, listener) = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = state;
            (StateChange::new(previous, state), inner.listener.clone())
        };
        if let Some(listener) = listener {
            listener.on_state_change(change);
        }
    }

    fn ensure_usable(&self) -> Result<(), TransportError> {
        if self.state().is_usable() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn record(&self, entry: String) {
        self.inner.lock().statements.push(entry);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open(&self) -> Result<(), TransportError> {
        self.transition(SessionState::Connecting);
        if let Some(delay) = self.behavior.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_open {
            self.transition(SessionState::Broken);
            return Err(TransportError::Refused(format!(
                "mock session {} refused",
                self.id
            )));
        }
        self.inner.lock().opens += 1;
        self.transition(SessionState::Open);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let state = {
            let mut inner = self.inner.lock();
            inner.closes += 1;
            inner.state
        };
        if self.behavior.fail_close {
            self.transition(SessionState::Broken);
            return Err(TransportError::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset,
            )));
        }
        if state == SessionState::Closed {
            return Err(TransportError::Closed);
        }
        self.transition(SessionState::Closed);
        Ok(())
    }

    fn set_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.inner.lock().listener = Some(listener);
    }

    async fn execute(&self, statement: &Statement) -> Result<u64, TransportError> {
        self.ensure_usable()?;
        self.transition(SessionState::Executing);
        let entry = match statement.transaction {
            Some(tx) => format!("{tx} {}", statement.sql),
            None => statement.sql.clone(),
        };
        self.record(entry);
        self.transition(SessionState::Open);
        Ok(1)
    }

    async fn begin_transaction(
        &self,
        setup_sql: Option<&str>,
    ) -> Result<TransactionId, TransportError> {
        self.ensure_usable()?;
        let id = {
            let mut inner = self.inner.lock();
            let id = TransactionId(inner.next_transaction);
            inner.next_transaction += 1;
            if let Some(sql) = setup_sql {
                inner.statements.push(sql.to_string());
            }
            inner.statements.push(format!("BEGIN {id}"));
            id
        };
        Ok(id)
    }

    async fn commit(&self, id: TransactionId) -> Result<(), TransportError> {
        self.ensure_usable()?;
        self.record(format!("COMMIT {id}"));
        Ok(())
    }

    async fn rollback(&self, id: TransactionId) -> Result<(), TransportError> {
        self.ensure_usable()?;
        self.record(format!("ROLLBACK {id}"));
        Ok(())
    }
}

/// A driver handing out [`MockSession`]s.
#[derive(Default)]
pub struct MockDriver {
    behavior: Mutex<MockBehavior>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    connection_strings: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl MockDriver {
    /// Create a driver whose sessions behave normally.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior applied to sessions created from now on.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Every session created so far, in creation order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    /// Number of sessions created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Connection strings seen by `create_session`, raw.
    #[must_use]
    pub fn connection_strings(&self) -> Vec<String> {
        self.connection_strings.lock().clone()
    }
}

impl Driver for MockDriver {
    fn create_session(
        &self,
        connection_string: &ConnectionString,
    ) -> Result<Arc<dyn Session>, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(MockSession::new(id, self.behavior.lock().clone()));
        tracing::trace!(session = id, connection = %connection_string, "mock session created");
        self.connection_strings
            .lock()
            .push(connection_string.as_str().to_string());
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Listener that records every transition it receives.
#[derive(Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<StateChange>>,
}

impl RecordingListener {
    /// Transitions received so far.
    #[must_use]
    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }
}

impl StateListener for RecordingListener {
    fn on_state_change(&self, change: StateChange) {
        self.changes.lock().push(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_reports_transitions() {
        let session = MockSession::new(0, MockBehavior::default());
        let listener = Arc::new(RecordingListener::default());
        session.set_state_listener(listener.clone());

        session.open().await.unwrap();

        assert_eq!(
            listener.changes(),
            vec![
                StateChange::new(SessionState::Closed, SessionState::Connecting),
                StateChange::new(SessionState::Connecting, SessionState::Open),
            ]
        );
        assert_eq!(session.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_open_breaks_session() {
        let session = MockSession::new(0, MockBehavior::default().fail_open(true));
        assert!(session.open().await.is_err());
        assert_eq!(session.state(), SessionState::Broken);
    }

    #[tokio::test]
    async fn test_close_twice_errors() {
        let session = MockSession::new(0, MockBehavior::default());
        session.open().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(session.close().await, Err(TransportError::Closed)));
        assert_eq!(session.close_count(), 2);
    }

    #[tokio::test]
    async fn test_transaction_log() {
        let session = MockSession::new(0, MockBehavior::default());
        session.open().await.unwrap();

        let tx = session.begin_transaction(None).await.unwrap();
        session
            .execute(&Statement::new("DELETE FROM items").in_transaction(tx))
            .await
            .unwrap();
        session.commit(tx).await.unwrap();

        assert_eq!(
            session.statements(),
            vec!["BEGIN tx#1", "tx#1 DELETE FROM items", "COMMIT tx#1"]
        );
    }

    #[test]
    fn test_driver_records_sessions() {
        let driver = MockDriver::new();
        driver
            .create_session(&ConnectionString::new("Server=a"))
            .unwrap();
        driver
            .create_session(&ConnectionString::new("Server=b"))
            .unwrap();

        assert_eq!(driver.created(), 2);
        assert_eq!(driver.connection_strings(), vec!["Server=a", "Server=b"]);
        assert_eq!(driver.sessions()[1].id(), 1);
    }
}
