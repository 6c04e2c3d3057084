//! Connection pool implementation.
//!
//! The pool owns every [`ConnectionHandle`] it creates and partitions them
//! into a free set and a checked-out set. Selection, preparation and return
//! all happen under one lock, so a handle can never be handed to two callers
//! at once. Opening and closing sessions always happens outside that lock.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dbpool_client::instrumentation::span_names;
use dbpool_client::{ConnectionHandle, HandleOwner, QueryAdapter};
use dbpool_session::{ConnectionString, Driver, SessionState};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{ConnectionMetadata, HealthCheckResult, classify};

/// A pool of database connections.
///
/// Cloning a `Pool` is cheap; all clones share the same connections.
///
/// # Example
///
/// ```rust,ignore
/// use dbpool_manager::{Pool, PoolConfig};
///
/// let pool = Pool::new(driver, "Server=db;Database=game", PoolConfig::new()).await?;
///
/// let conn = pool.get_transactional().await?;
/// conn.execute("UPDATE accounts SET credits = credits - 10 WHERE id = 1").await?;
/// conn.adapter().as_transactional().unwrap().commit().await?;
/// conn.release().await;
/// ```
#[derive(Clone)]
pub struct Pool {
    config: PoolConfig,
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Pool configuration.
    config: PoolConfig,

    /// Passed to the driver for every new session.
    connection_string: ConnectionString,

    driver: Arc<dyn Driver>,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// One permit per connection that may be checked out.
    permits: Arc<Semaphore>,

    /// Handles and the free set.
    state: Mutex<PoolState>,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,

    /// Back-reference for spawning background work from `&self`.
    this: Weak<PoolInner>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<u64, Slot>,
    /// Ids of free handles, oldest return first.
    idle: VecDeque<u64>,
}

struct Slot {
    handle: Arc<ConnectionHandle>,
    metadata: ConnectionMetadata,
    /// Set by the checkout guard right before it reports the handle done.
    /// Any other `report_done` is refused.
    returning: bool,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Total connections created.
    connections_created: u64,
    /// Total connections closed.
    connections_closed: u64,
    /// Connections retired because of their age.
    connections_expired: u64,
    /// Total successful checkouts.
    checkouts_successful: u64,
    /// Total failed checkouts (timeouts, errors).
    checkouts_failed: u64,
    /// Total health classifications performed.
    health_checks_performed: u64,
    /// Total classifications other than healthy.
    health_checks_failed: u64,
    /// Open transactions rolled back on return.
    resets_performed: u64,
    /// Rollbacks on return that failed.
    resets_failed: u64,
}

impl Pool {
    /// Create a new pool builder.
    ///
    /// Use the builder to configure the pool before creating it.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool and open `min_connections` connections.
    ///
    /// For more control over pool creation, use [`Pool::builder()`].
    pub async fn new(
        driver: Arc<dyn Driver>,
        connection_string: impl Into<ConnectionString>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let connection_string = connection_string.into();

        let inner = Arc::new_cyclic(|this| PoolInner {
            config: config.clone(),
            connection_string,
            driver,
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            permits: Arc::new(Semaphore::new(config.max_connections as usize)),
            state: Mutex::new(PoolState::default()),
            metrics: Mutex::new(PoolMetricsInner::default()),
            this: this.clone(),
        });

        let pool = Self { config, inner };
        for _ in 0..pool.config.min_connections {
            match pool.inner.open_connection().await {
                Ok(handle) => pool.inner.register_idle(handle).await,
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            }
        }

        tracing::info!(
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            connection = %pool.inner.connection_string,
            "connection pool created"
        );

        Ok(pool)
    }

    /// Get an auto-commit connection from the pool.
    ///
    /// This will either return an existing free connection or create a new
    /// one if the pool is not at capacity. If all connections are in use and
    /// the pool is at capacity, this will wait until a connection becomes
    /// available or the timeout is reached.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        self.acquire(true).await
    }

    /// Get a connection whose adapter leaves transaction boundaries to the
    /// caller.
    pub async fn get_transactional(&self) -> Result<PooledConnection, PoolError> {
        self.acquire(false).await
    }

    /// Get a connection prepared with the adapter selected by `auto_commit`.
    pub async fn acquire(&self, auto_commit: bool) -> Result<PooledConnection, PoolError> {
        self.get_with_timeout(auto_commit, self.config.connection_timeout)
            .await
    }

    /// Like [`acquire`](Self::acquire), waiting at most `timeout` for a free
    /// slot instead of the configured checkout timeout.
    pub async fn get_with_timeout(
        &self,
        auto_commit: bool,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let span = tracing::debug_span!("checkout", otel.name = span_names::CHECKOUT, auto_commit);
        async {
            tracing::trace!("acquiring connection from pool");

            let permit = match tokio::time::timeout(
                timeout,
                Arc::clone(&self.inner.permits).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    self.inner.metrics.lock().checkouts_failed += 1;
                    return Err(PoolError::PoolClosed);
                }
                Err(_) => {
                    self.inner.metrics.lock().checkouts_failed += 1;
                    tracing::debug!(?timeout, "timed out waiting for a connection");
                    return Err(PoolError::Timeout(timeout));
                }
            };

            self.checkout(permit, auto_commit).await
        }
        .instrument(span)
        .await
    }

    /// Try to get a connection without waiting for a free slot.
    ///
    /// Returns `None` if the pool is at capacity. May still open a new
    /// session if no free connection exists.
    pub async fn try_get(&self, auto_commit: bool) -> Result<Option<PooledConnection>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => self.checkout(permit, auto_commit).await.map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(PoolError::PoolClosed),
        }
    }

    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
        auto_commit: bool,
    ) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;

        let (reused, retired) = inner.take_idle(auto_commit);
        for (handle, health) in retired {
            inner.retire(handle, health);
        }

        let (handle, metadata) = match reused {
            Some(found) => found,
            None => {
                let created = match inner.open_connection().await {
                    Ok(handle) => inner.register_checked_out(handle, auto_commit).await,
                    Err(e) => Err(e),
                };
                match created {
                    Ok(found) => found,
                    Err(e) => {
                        inner.metrics.lock().checkouts_failed += 1;
                        return Err(e);
                    }
                }
            }
        };

        inner.metrics.lock().checkouts_successful += 1;
        tracing::debug!(connection_id = handle.id(), "connection checked out");
        PooledConnection::new(handle, metadata, Arc::clone(inner), permit)
    }

    /// Retire free connections that are no longer healthy.
    ///
    /// Returns the number of connections retired.
    pub fn prune(&self) -> usize {
        let retired = {
            let mut state = self.inner.state.lock();
            let mut retired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(id) = state.idle.pop_front() {
                let Some(health) = state.slots.get(&id).map(|slot| classify(&slot.handle)) else {
                    continue;
                };
                self.inner.record_health(health);
                if health.is_healthy() {
                    kept.push_back(id);
                } else if let Some(slot) = state.slots.remove(&id) {
                    retired.push((slot.handle, health));
                }
            }
            state.idle = kept;
            retired
        };

        let count = retired.len();
        for (handle, health) in retired {
            self.inner.retire(handle, health);
        }
        count
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let total = state.slots.len() as u32;
        let available = state.idle.len() as u32;
        PoolStatus {
            available,
            in_use: total.saturating_sub(available),
            total,
            max: self.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            connections_expired: inner.connections_expired,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close the pool.
    ///
    /// New checkouts fail with [`PoolError::PoolClosed`], waiting checkouts
    /// are woken with the same error, and free connections are disconnected.
    /// Connections still checked out are disconnected when returned.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();

        let idle: Vec<Arc<ConnectionHandle>> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state.idle.drain(..).collect();
            ids.into_iter()
                .filter_map(|id| state.slots.remove(&id))
                .map(|slot| slot.handle)
                .collect()
        };

        for handle in &idle {
            handle.disconnect().await;
        }
        self.inner.metrics.lock().connections_closed += idle.len() as u64;

        tracing::info!(closed = idle.len(), "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The connection string shared by every connection.
    #[must_use]
    pub fn connection_string(&self) -> &ConnectionString {
        &self.inner.connection_string
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("connection_string", &self.inner.connection_string)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolInner {
    fn owner(&self) -> Option<Arc<dyn HandleOwner>> {
        self.this.upgrade().map(|inner| inner as Arc<dyn HandleOwner>)
    }

    /// Pop free handles until a healthy one is found and prepare it.
    ///
    /// Runs entirely under the state lock. Unhealthy handles are removed
    /// and returned so the caller can disconnect them outside the lock.
    fn take_idle(
        &self,
        auto_commit: bool,
    ) -> (
        Option<(Arc<ConnectionHandle>, ConnectionMetadata)>,
        Vec<(Arc<ConnectionHandle>, HealthCheckResult)>,
    ) {
        let mut state = self.state.lock();
        let mut retired = Vec::new();

        while let Some(id) = state.idle.pop_front() {
            let Some(health) = state.slots.get(&id).map(|slot| classify(&slot.handle)) else {
                continue;
            };
            self.record_health(health);

            if !health.is_healthy() {
                if let Some(slot) = state.slots.remove(&id) {
                    retired.push((slot.handle, health));
                }
                continue;
            }

            let Some(slot) = state.slots.get_mut(&id) else {
                continue;
            };
            if let Err(e) = slot.handle.prepare(auto_commit) {
                tracing::error!(connection_id = id, error = %e, "free connection was checked out");
                continue;
            }
            slot.metadata.record_checkout(Instant::now());
            return (
                Some((Arc::clone(&slot.handle), slot.metadata.clone())),
                retired,
            );
        }

        (None, retired)
    }

    /// Create and open a new connection. Never called with the state lock
    /// held.
    async fn open_connection(&self) -> Result<Arc<ConnectionHandle>, PoolError> {
        let owner = self.owner().ok_or(PoolError::PoolClosed)?;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(id, &owner, self.driver.as_ref())?;

        if let Err(e) = handle.connect_timeout(self.config.connect_timeout).await {
            tracing::warn!(connection_id = id, error = %e, "failed to open connection");
            handle.disconnect().await;
            return Err(e.into());
        }

        self.metrics.lock().connections_created += 1;
        tracing::info!(connection_id = id, "opened new connection");
        Ok(Arc::new(handle))
    }

    /// Add a newly opened handle to the pool, checked out.
    async fn register_checked_out(
        &self,
        handle: Arc<ConnectionHandle>,
        auto_commit: bool,
    ) -> Result<(Arc<ConnectionHandle>, ConnectionMetadata), PoolError> {
        let registered = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire) {
                None
            } else {
                handle.prepare(auto_commit)?;
                let mut metadata = ConnectionMetadata::new(&handle);
                metadata.record_checkout(Instant::now());
                state.slots.insert(
                    handle.id(),
                    Slot {
                        handle: Arc::clone(&handle),
                        metadata: metadata.clone(),
                        returning: false,
                    },
                );
                Some(metadata)
            }
        };

        match registered {
            Some(metadata) => Ok((handle, metadata)),
            None => {
                handle.disconnect().await;
                self.metrics.lock().connections_closed += 1;
                Err(PoolError::PoolClosed)
            }
        }
    }

    /// Add a newly opened handle to the free set.
    async fn register_idle(&self, handle: Arc<ConnectionHandle>) {
        let accepted = {
            let mut state = self.state.lock();
            let full = state.slots.len() >= self.config.max_connections as usize;
            if self.closed.load(Ordering::Acquire) || full {
                false
            } else {
                let id = handle.id();
                state.slots.insert(
                    id,
                    Slot {
                        handle: Arc::clone(&handle),
                        metadata: ConnectionMetadata::new(&handle),
                        returning: false,
                    },
                );
                state.idle.push_back(id);
                true
            }
        };

        if !accepted {
            handle.disconnect().await;
            self.metrics.lock().connections_closed += 1;
        }
    }

    fn record_health(&self, health: HealthCheckResult) {
        let mut metrics = self.metrics.lock();
        metrics.health_checks_performed += 1;
        if !health.is_healthy() {
            metrics.health_checks_failed += 1;
        }
        if health == HealthCheckResult::Expired {
            metrics.connections_expired += 1;
        }
    }

    /// Disconnect a handle already removed from the pool, and open a
    /// replacement if the pool dropped below its minimum.
    fn retire(&self, handle: Arc<ConnectionHandle>, health: HealthCheckResult) {
        tracing::debug!(
            connection_id = handle.id(),
            ?health,
            age_secs = handle.age().as_secs(),
            "retiring connection"
        );
        self.metrics.lock().connections_closed += 1;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                connection_id = handle.id(),
                "no runtime available, dropping connection without closing"
            );
            return;
        };
        runtime.spawn(async move { handle.disconnect().await });

        let below_min = self.state.lock().slots.len() < self.config.min_connections as usize;
        if below_min && !self.closed.load(Ordering::Acquire) {
            if let Some(inner) = self.this.upgrade() {
                runtime.spawn(async move {
                    match inner.open_connection().await {
                        Ok(handle) => inner.register_idle(handle).await,
                        Err(e) => tracing::warn!(error = %e, "failed to replace retired connection"),
                    }
                });
            }
        }
    }

    /// Whether `checkout` is still the current checkout of connection `id`.
    fn is_current_checkout(&self, id: u64, checkout: u64) -> bool {
        self.state
            .lock()
            .slots
            .get(&id)
            .is_some_and(|slot| slot.metadata.checkout_count == checkout)
    }

    /// Forget a handle without closing it.
    fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        state.slots.remove(&id);
        state.idle.retain(|&idle| idle != id);
    }

    /// Report a checked-out handle done on behalf of its guard.
    fn give_back(&self, handle: &ConnectionHandle, checkout: u64) {
        let armed = {
            let mut state = self.state.lock();
            match state.slots.get_mut(&handle.id()) {
                Some(slot) if slot.metadata.checkout_count == checkout => {
                    slot.returning = true;
                    true
                }
                _ => false,
            }
        };
        if armed {
            handle.report_done();
        } else {
            tracing::debug!(connection_id = handle.id(), "stale checkout, not returning");
        }
    }

    /// Take a checked-out handle out of the pool and close it.
    fn discard(&self, handle: &Arc<ConnectionHandle>) {
        self.detach(handle.id());
        handle.dispose();
        self.retire(Arc::clone(handle), HealthCheckResult::Broken);
    }

    async fn reset(&self, adapter: &QueryAdapter, connection_id: u64) -> bool {
        match adapter.reset().await {
            Ok(rolled_back) => {
                if rolled_back {
                    self.metrics.lock().resets_performed += 1;
                }
                true
            }
            Err(e) => {
                self.metrics.lock().resets_failed += 1;
                tracing::warn!(connection_id, error = %e, "failed to reset returned connection");
                false
            }
        }
    }
}

impl HandleOwner for PoolInner {
    fn connection_string(&self) -> &ConnectionString {
        &self.connection_string
    }

    fn report_done(&self, handle: &ConnectionHandle) -> bool {
        let id = handle.id();
        let retired = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&id) else {
                tracing::debug!(connection_id = id, "ignoring return of unknown connection");
                return false;
            };
            if !std::mem::take(&mut slot.returning) {
                tracing::debug!(
                    connection_id = id,
                    "ignoring return that did not come from the checkout"
                );
                return false;
            }

            slot.metadata.record_checkin(Instant::now());
            // Availability and free-set membership change together.
            handle.dispose();

            let health = classify(handle);
            if self.closed.load(Ordering::Acquire) || !health.is_healthy() {
                state.slots.remove(&id).map(|slot| (slot.handle, health))
            } else {
                state.idle.push_back(id);
                None
            }
        };

        match retired {
            Some((handle, health)) => {
                if health != HealthCheckResult::Healthy {
                    self.record_health(health);
                }
                self.retire(handle, health);
            }
            None => tracing::trace!(connection_id = id, "connection returned to pool"),
        }
        true
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .driver(driver)
///     .connection_string("Server=db;Database=game")
///     .pool_config(pool_config)
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
    driver: Option<Arc<dyn Driver>>,
    connection_string: ConnectionString,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            driver: None,
            connection_string: ConnectionString::new(""),
        }
    }

    /// Set the driver that creates sessions.
    #[must_use]
    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the connection string passed to the driver.
    #[must_use]
    pub fn connection_string(mut self, connection_string: impl Into<ConnectionString>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the checkout timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = timeout;
        self
    }

    /// Set the session open timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connect_timeout = timeout;
        self
    }

    /// Enable or disable rollback of open transactions on return.
    #[must_use]
    pub fn reset_on_return(mut self, enabled: bool) -> Self {
        self.pool_config.reset_on_return = enabled;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<Pool, PoolError> {
        let driver = self.driver.ok_or(PoolError::MissingDriver)?;
        Pool::new(driver, self.connection_string, self.pool_config).await
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of free connections.
    pub available: u32,
    /// Number of connections currently checked out.
    pub in_use: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed checked-out connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.in_use >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Connections retired because they outlived their lifetime.
    pub connections_expired: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, open failures).
    pub checkouts_failed: u64,
    /// Health classifications performed.
    pub health_checks_performed: u64,
    /// Health classifications that were not healthy.
    pub health_checks_failed: u64,
    /// Open transactions rolled back on return.
    pub resets_performed: u64,
    /// Rollbacks on return that failed.
    pub resets_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate health check success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self.health_checks_performed - self.health_checks_failed;
        successful as f64 / self.health_checks_performed as f64
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the assigned [`QueryAdapter`]. Return it with
/// [`release()`](PooledConnection::release), which rolls back any
/// transaction left open before the connection goes back to the free set.
/// Dropping it returns it as well, doing the rollback in the background;
/// outside a Tokio runtime a connection with an open transaction is closed
/// instead.
/// Use [`detach()`](PooledConnection::detach) to take the connection out of
/// the pool for good.
pub struct PooledConnection {
    handle: Arc<ConnectionHandle>,
    adapter: Arc<QueryAdapter>,
    metadata: ConnectionMetadata,
    pool: Arc<PoolInner>,
    /// `None` once the connection has been returned or detached.
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    fn new(
        handle: Arc<ConnectionHandle>,
        metadata: ConnectionMetadata,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Result<Self, PoolError> {
        let Some(adapter) = handle.query_reactor() else {
            pool.metrics.lock().checkouts_failed += 1;
            pool.discard(&handle);
            return Err(PoolError::Configuration(format!(
                "connection {} was handed out without an adapter",
                handle.id()
            )));
        };
        Ok(Self {
            handle,
            adapter,
            metadata,
            pool,
            permit: Some(permit),
        })
    }

    /// Connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// The assigned adapter.
    #[must_use]
    pub fn adapter(&self) -> &QueryAdapter {
        &self.adapter
    }

    /// Current state of the connection, with the age policy applied.
    #[must_use]
    pub fn connection_state(&self) -> SessionState {
        self.handle.connection_state()
    }

    /// Whether the handle is free. Always `false` while checked out.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.handle.is_available()
    }

    /// Creation timestamp of the handle, jitter included.
    #[must_use]
    pub fn last_action(&self) -> Instant {
        self.handle.last_action()
    }

    /// Get the connection metadata as of checkout.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        return_connection(&self.pool, &self.handle, &self.adapter, self.metadata.checkout_count)
            .await;
        drop(permit);
    }

    /// Detach the connection from the pool.
    ///
    /// The pool forgets the handle and frees its slot. The handle keeps its
    /// adapter; closing it is up to the caller.
    pub fn detach(mut self) -> Arc<ConnectionHandle> {
        let permit = self.permit.take();
        self.pool.detach(self.handle.id());
        drop(permit);
        tracing::debug!(connection_id = self.handle.id(), "connection detached from pool");
        Arc::clone(&self.handle)
    }
}

impl Deref for PooledConnection {
    type Target = QueryAdapter;

    fn deref(&self) -> &QueryAdapter {
        &self.adapter
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("handle", &self.handle)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let checkout = self.metadata.checkout_count;

        if self.adapter.may_have_open_transaction() {
            if self.pool.config.reset_on_return {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let pool = Arc::clone(&self.pool);
                    let handle = Arc::clone(&self.handle);
                    let adapter = Arc::clone(&self.adapter);
                    runtime.spawn(async move {
                        return_connection(&pool, &handle, &adapter, checkout).await;
                        drop(permit);
                    });
                    return;
                }
            }

            // No way to roll back here: never hand the session out again.
            if self.pool.is_current_checkout(self.handle.id(), checkout) {
                tracing::warn!(
                    connection_id = self.handle.id(),
                    "connection dropped with an open transaction, closing it"
                );
                self.pool.discard(&self.handle);
            }
            drop(permit);
            return;
        }

        self.pool.give_back(&self.handle, checkout);
        drop(permit);
    }
}

/// Reset and report a connection done, unless this checkout is stale.
///
/// A connection whose transaction state cannot be cleaned up is closed
/// instead of being returned.
async fn return_connection(
    pool: &PoolInner,
    handle: &Arc<ConnectionHandle>,
    adapter: &QueryAdapter,
    checkout: u64,
) {
    if !pool.is_current_checkout(handle.id(), checkout) {
        tracing::debug!(connection_id = handle.id(), "stale checkout, not returning");
        return;
    }

    let clean = if pool.config.reset_on_return {
        pool.reset(adapter, handle.id()).await
    } else if adapter.has_open_transaction().await {
        tracing::warn!(
            connection_id = handle.id(),
            "connection returned with an open transaction, closing it"
        );
        false
    } else {
        true
    };

    if clean {
        pool.give_back(handle, checkout);
    } else {
        pool.discard(handle);
    }
}
