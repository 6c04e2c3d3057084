//! # dbpool-manager
//!
//! Connection pool that owns a set of [`ConnectionHandle`]s and hands them
//! out one caller at a time.
//!
//! ## Features
//!
//! - Reuses free handles before creating new ones
//! - Retires handles that read as `Broken`, whether the session failed or
//!   the handle outlived its staggered lifetime
//! - Bounded capacity with a checkout timeout
//! - Bounded session open time
//! - Rolls back transactions left open when a connection is returned
//! - Metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dbpool_client::QueryReactor;
//! use dbpool_manager::Pool;
//!
//! let pool = Pool::builder()
//!     .driver(Arc::new(driver))
//!     .connection_string("Server=db;Database=game;Uid=app;Pwd=secret")
//!     .min_connections(2)
//!     .max_connections(20)
//!     .connection_timeout(Duration::from_secs(5))
//!     .build()
//!     .await?;
//!
//! let conn = pool.get().await?;
//! conn.execute("UPDATE players SET online = 0").await?;
//! conn.release().await;
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```
//!
//! [`ConnectionHandle`]: dbpool_client::ConnectionHandle

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};

// Lifecycle management
pub use lifecycle::{ConnectionMetadata, HealthCheckResult, classify};
