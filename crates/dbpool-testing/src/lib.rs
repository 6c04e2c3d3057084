//! # dbpool-testing
//!
//! Test infrastructure shared by the dbpool crates.
//!
//! [`MockDriver`] hands out [`MockSession`]s that keep their state in memory,
//! report every transition to the registered listener, and record the
//! statements they receive so tests can assert on them.
//!
//! ```rust,ignore
//! use dbpool_testing::{MockBehavior, MockDriver};
//!
//! let driver = MockDriver::new();
//! driver.set_behavior(MockBehavior::default().fail_close(true));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

pub use mock::{MockBehavior, MockDriver, MockSession, RecordingListener};
