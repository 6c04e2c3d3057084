//! # dbpool-session
//!
//! Transport contract between pooled connection handles and the database
//! driver that owns the actual network session.
//!
//! Nothing in this crate performs I/O. A driver implements [`Driver`] and
//! [`Session`]; the connection handles in `dbpool-client` consume them.
//!
//! ## Contract
//!
//! - A session reports every physical state transition to the single
//!   [`StateListener`] registered on it. Transitions are driven by the
//!   session, never by the caller, except through `open` and `close`.
//! - Commands and transactions are expressed as [`Statement`]s and
//!   [`TransactionId`]s, so the session does not need to know about the
//!   adapters that issue them.
//! - The connection string is opaque; [`ConnectionString`] only offers
//!   key lookup and a redacted rendering for logs.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection_string;
pub mod error;
pub mod session;
pub mod state;

pub use connection_string::ConnectionString;
pub use error::TransportError;
pub use session::{Driver, Session, Statement, TransactionId};
pub use state::{SessionState, StateChange, StateListener};
