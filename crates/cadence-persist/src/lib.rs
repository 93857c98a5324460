//! # Cadence Persistence
//!
//! SQLite-backed implementation of the Cadence job store.
//!
//! - [`sqlite`]: connection pool setup, pragmas and migrations
//! - [`queue`]: [`SqliteQueueBackend`], the durable `QueueBackend`

pub mod queue;
pub mod sqlite;

pub use queue::SqliteQueueBackend;
pub use sqlite::{connect, SqliteConfig, StorageError};
