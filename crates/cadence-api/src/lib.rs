//! # Cadence API
//!
//! HTTP surface for the Cadence job queue.
//!
//! Features:
//! - Dead-letter queue listing, requeue, purge and stats
//! - Job submission and lookup
//! - Worker health reporting
//! - OpenAPI document
//! - Graceful shutdown that drains the worker orchestrator

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::{ApiError, ApiResponse, ApiResult};
pub use server::{CadenceServer, ServerConfig};
pub use state::AppState;
