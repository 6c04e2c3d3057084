//! Per-connection bookkeeping and health classification.

use dbpool_client::ConnectionHandle;
use tokio::time::Instant;

/// Bookkeeping the pool keeps for each connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Connection id.
    pub id: u64,
    /// Creation timestamp of the handle, jitter included.
    pub created_at: Instant,
    /// Number of times the connection was checked out. Also identifies the
    /// current checkout.
    pub checkout_count: u64,
    /// When the connection was last checked out.
    pub last_checkout: Option<Instant>,
    /// When the connection was last returned.
    pub last_checkin: Option<Instant>,
}

impl ConnectionMetadata {
    /// Metadata for a freshly created handle.
    #[must_use]
    pub fn new(handle: &ConnectionHandle) -> Self {
        Self {
            id: handle.id(),
            created_at: handle.last_action(),
            checkout_count: 0,
            last_checkout: None,
            last_checkin: None,
        }
    }

    pub(crate) fn record_checkout(&mut self, now: Instant) {
        self.checkout_count += 1;
        self.last_checkout = Some(now);
    }

    pub(crate) fn record_checkin(&mut self, now: Instant) {
        self.last_checkin = Some(now);
    }
}

/// Outcome of classifying a connection before reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckResult {
    /// The connection can be handed out.
    Healthy,
    /// The connection outlived its maximum lifetime.
    Expired,
    /// The session is broken or no longer open.
    Broken,
}

impl HealthCheckResult {
    /// Whether the connection can be reused.
    #[must_use]
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

/// Classify a handle. Age takes precedence over the observed state.
#[must_use]
pub fn classify(handle: &ConnectionHandle) -> HealthCheckResult {
    if handle.is_expired() {
        HealthCheckResult::Expired
    } else if handle.observed_state().is_usable() {
        HealthCheckResult::Healthy
    } else {
        HealthCheckResult::Broken
    }
}
