//! # dbpool-client
//!
//! Reusable connection handles for a managed connection pool.
//!
//! A [`ConnectionHandle`] wraps one driver session. It carries two
//! independent pieces of state:
//!
//! - the **physical** state, reported by the session through a
//!   [`StateListener`](dbpool_session::StateListener) and stored in an
//!   atomic, and
//! - the **availability** state, which is `false` exactly while a
//!   [`QueryAdapter`] is assigned to the handle.
//!
//! On top of the physical state the handle applies an age policy: once a
//! handle is older than [`MAX_LIVE_CONNECTION_TIME`] it reads as
//! [`SessionState::Broken`](dbpool_session::SessionState::Broken) so the pool
//! retires it. Creation timestamps are pushed forward by a random
//! [`CREATION_JITTER_MINUTES`] offset, so handles opened together do not
//! expire together.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbpool_client::{ConnectionHandle, QueryReactor};
//!
//! let handle = ConnectionHandle::new(1, &owner, &driver)?;
//! handle.connect().await?;
//!
//! handle.prepare(true)?;
//! if let Some(adapter) = handle.query_reactor() {
//!     adapter.execute("UPDATE players SET online = 0").await?;
//! }
//! handle.report_done();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod adapter;
pub mod command;
pub mod error;
pub mod handle;
pub mod instrumentation;
pub mod state;
pub mod transaction;

// Re-export commonly used types
pub use adapter::{AdapterKind, AutoCommitAdapter, QueryAdapter, QueryReactor, TransactionAdapter};
pub use command::Command;
pub use dbpool_session::{ConnectionString, SessionState};
pub use error::{Error, Result};
pub use handle::{
    CREATION_JITTER_MINUTES, ConnectionHandle, HandleOwner, MAX_LIVE_CONNECTION_TIME,
};
pub use state::ObservedState;
pub use transaction::{IsolationLevel, Transaction};
