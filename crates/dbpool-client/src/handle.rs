//! Connection handle.
//!
//! A handle wraps one driver session for its whole life: it is created by
//! the pool, connected once, checked out and returned many times, and
//! finally discarded by the pool once it reads as `Broken`. It never
//! destroys itself.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dbpool_session::{ConnectionString, Driver, Session, SessionState};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::Instrument;

use crate::adapter::{AutoCommitAdapter, QueryAdapter, TransactionAdapter};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::instrumentation::span_names;
use crate::state::ObservedState;
use crate::transaction::{IsolationLevel, Transaction};

/// Age at which a handle reads as `Broken`, measured from its creation
/// timestamp.
pub const MAX_LIVE_CONNECTION_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Whole-minute offset range added to the creation timestamp of every
/// handle.
pub const CREATION_JITTER_MINUTES: Range<u64> = 1..60;

/// The owner a handle reports back to, normally the pool.
pub trait HandleOwner: Send + Sync {
    /// Connection string used to create the handle's session.
    fn connection_string(&self) -> &ConnectionString;

    /// Return `handle` to the free set.
    ///
    /// Returns `false` if the owner refuses the return, for example because
    /// it did not come through the owner's checkout. The handle then keeps
    /// its adapter.
    fn report_done(&self, handle: &ConnectionHandle) -> bool;
}

/// Command and transaction factory for one session, shared by a handle and
/// the adapters assigned to it.
#[derive(Clone)]
pub(crate) struct SessionFactory {
    connection_id: u64,
    session: Arc<dyn Session>,
}

impl SessionFactory {
    pub(crate) fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub(crate) fn new_command(&self, sql: impl Into<String>) -> Command {
        Command::new(self.connection_id, Arc::clone(&self.session), sql)
    }

    pub(crate) async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> Result<Transaction> {
        Transaction::begin(self.connection_id, Arc::clone(&self.session), isolation).await
    }
}

/// A reusable wrapper around one physical database session.
pub struct ConnectionHandle {
    id: u64,
    created_at: Instant,
    session: Arc<dyn Session>,
    factory: SessionFactory,
    state: Arc<ObservedState>,
    available: AtomicBool,
    adapter: Mutex<Option<Arc<QueryAdapter>>>,
    owner: Weak<dyn HandleOwner>,
}

impl ConnectionHandle {
    /// Create a handle whose session comes from `driver`, configured with
    /// the owner's connection string.
    ///
    /// The session is not opened; call [`connect`](Self::connect).
    pub fn new(id: u64, owner: &Arc<dyn HandleOwner>, driver: &dyn Driver) -> Result<Self> {
        let session = driver.create_session(owner.connection_string())?;
        Ok(Self::from_session(id, owner, session))
    }

    /// Create a handle around an existing, closed session.
    pub fn from_session(
        id: u64,
        owner: &Arc<dyn HandleOwner>,
        session: Arc<dyn Session>,
    ) -> Self {
        Self::with_creation_time(
            id,
            Arc::downgrade(owner),
            session,
            jittered_creation_time(Instant::now()),
        )
    }

    pub(crate) fn with_creation_time(
        id: u64,
        owner: Weak<dyn HandleOwner>,
        session: Arc<dyn Session>,
        created_at: Instant,
    ) -> Self {
        let state = Arc::new(ObservedState::new(id));
        session.set_state_listener(state.clone());

        Self {
            id,
            created_at,
            factory: SessionFactory {
                connection_id: id,
                session: Arc::clone(&session),
            },
            session,
            state,
            available: AtomicBool::new(true),
            adapter: Mutex::new(None),
            owner,
        }
    }

    /// Open the session.
    ///
    /// Transport failures are returned as [`Error::Connect`] and are not
    /// retried.
    pub async fn connect(&self) -> Result<()> {
        let span = tracing::debug_span!(
            "connect",
            otel.name = span_names::CONNECT,
            connection_id = self.id
        );
        async {
            tracing::debug!("opening connection");
            self.session.open().await.map_err(|source| Error::Connect {
                id: self.id,
                source,
            })?;
            tracing::debug!("connection open");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Open the session, giving up after `timeout`.
    pub async fn connect_timeout(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectTimeout {
                id: self.id,
                timeout,
            }),
        }
    }

    /// Close the session.
    ///
    /// Close failures are logged and swallowed.
    pub async fn disconnect(&self) {
        let span = tracing::debug_span!(
            "disconnect",
            otel.name = span_names::DISCONNECT,
            connection_id = self.id
        );
        async {
            tracing::debug!("closing connection");
            if let Err(e) = self.session.close().await {
                tracing::warn!(error = %e, "ignoring error while closing connection");
            }
        }
        .instrument(span)
        .await
    }

    /// Current state, with the age policy applied.
    ///
    /// Returns `Broken` once the handle is [`MAX_LIVE_CONNECTION_TIME`] past
    /// its creation timestamp, whatever the session reports.
    #[must_use]
    pub fn connection_state(&self) -> SessionState {
        self.connection_state_at(Instant::now())
    }

    /// [`connection_state`](Self::connection_state) evaluated at `now`.
    #[must_use]
    pub fn connection_state_at(&self, now: Instant) -> SessionState {
        if self.age_at(now) >= MAX_LIVE_CONNECTION_TIME {
            SessionState::Broken
        } else {
            self.state.load()
        }
    }

    /// The last state reported by the session, without the age policy.
    #[must_use]
    pub fn observed_state(&self) -> SessionState {
        self.state.load()
    }

    /// Time since the creation timestamp. Zero while the timestamp is still
    /// in the future.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.age_at(Instant::now())
    }

    fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether the age policy alone classifies this handle as `Broken`.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.age() >= MAX_LIVE_CONNECTION_TIME
    }

    /// Assign a query adapter and mark the handle unavailable.
    ///
    /// `auto_commit` selects [`AutoCommitAdapter`]; otherwise a
    /// [`TransactionAdapter`] is assigned. Fails with
    /// [`Error::AlreadyCheckedOut`] if an adapter is already assigned, in
    /// which case that adapter is left in place.
    pub fn prepare(&self, auto_commit: bool) -> Result<()> {
        let mut slot = self.adapter.lock();
        if slot.is_some() {
            return Err(Error::AlreadyCheckedOut { id: self.id });
        }

        let adapter = if auto_commit {
            QueryAdapter::AutoCommit(AutoCommitAdapter::new(self))
        } else {
            QueryAdapter::Transactional(TransactionAdapter::new(self))
        };
        *slot = Some(Arc::new(adapter));
        self.available.store(false, Ordering::Release);

        tracing::debug!(connection_id = self.id, auto_commit, "handing out connection");
        Ok(())
    }

    /// Drop the assigned adapter, making the handle available again.
    ///
    /// Calling this on an available handle does nothing.
    pub fn dispose(&self) {
        let previous = {
            let mut slot = self.adapter.lock();
            self.available.store(true, Ordering::Release);
            slot.take()
        };
        drop(previous);
    }

    /// Tell the owner this handle is free, then dispose it.
    ///
    /// This is the only path by which a handle re-enters the pool's free
    /// set. If the owner is gone the handle is only disposed; if the owner
    /// refuses the return nothing changes. Returns whether the handle was
    /// released.
    pub fn report_done(&self) -> bool {
        tracing::debug!(connection_id = self.id, "returning connection");
        let returned = self.query_reactor();
        match self.owner.upgrade() {
            Some(owner) => {
                if !owner.report_done(self) {
                    tracing::debug!(connection_id = self.id, "owner refused return");
                    return false;
                }
            }
            None => tracing::debug!(connection_id = self.id, "connection owner dropped"),
        }
        self.dispose_if_assigned(returned.as_ref());
        true
    }

    /// Dispose only if `expected` is still the assigned adapter. The owner
    /// may already have disposed the handle and handed it out again.
    fn dispose_if_assigned(&self, expected: Option<&Arc<QueryAdapter>>) {
        let previous = {
            let mut slot = self.adapter.lock();
            let unchanged = match (slot.as_ref(), expected) {
                (None, _) => true,
                (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
                (Some(_), None) => false,
            };
            if !unchanged {
                return;
            }
            self.available.store(true, Ordering::Release);
            slot.take()
        };
        drop(previous);
    }

    /// The assigned adapter, if any.
    #[must_use]
    pub fn query_reactor(&self) -> Option<Arc<QueryAdapter>> {
        self.adapter.lock().clone()
    }

    /// A new auto-commit command on this handle's session.
    #[must_use]
    pub fn new_command(&self, sql: impl Into<String>) -> Command {
        self.factory.new_command(sql)
    }

    /// Begin a transaction at the server's default isolation level.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        self.factory.begin_transaction(None).await
    }

    /// Begin a transaction at `isolation`.
    pub async fn begin_transaction_with(&self, isolation: IsolationLevel) -> Result<Transaction> {
        self.factory.begin_transaction(Some(isolation)).await
    }

    /// Stable connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The creation timestamp, jitter included.
    #[must_use]
    pub fn last_action(&self) -> Instant {
        self.created_at
    }

    /// Whether no adapter is assigned.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn factory(&self) -> SessionFactory {
        self.factory.clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .field("available", &self.is_available())
            .finish()
    }
}

/// `now` pushed forward by a uniformly drawn whole number of minutes from
/// [`CREATION_JITTER_MINUTES`].
pub(crate) fn jittered_creation_time(now: Instant) -> Instant {
    let minutes = rand::thread_rng().gen_range(CREATION_JITTER_MINUTES);
    now + Duration::from_secs(minutes * 60)
}
