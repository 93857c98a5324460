//! # Cadence Queue
//!
//! Lease-based background job queue.
//!
//! Features:
//! - Atomic lease acquisition with visibility timeouts
//! - Per-kind exponential backoff with jitter and a retry budget
//! - Workers with panic isolation and lease heartbeats
//! - Orchestrator with graceful shutdown and a lease reaper
//! - Dead-letter queue inspection, requeue and purge
//! - Pluggable backend (Memory, SQLite via `cadence-persist`)

pub mod backend;
pub mod config;
pub mod dlq;
pub mod job;
pub mod lease;
pub mod memory;
pub mod orchestrator;
pub mod retry;
pub mod worker;

pub use backend::{
    CreatedRange, DeadLetterFilter, DeadLetterSummary, QueueBackend, QueueError, RequeueOutcome,
};
pub use config::{ConfigError, KindConfig, QueueConfig};
pub use dlq::{
    derive_reason, DeadLetterEntry, DeadLetterPage, DeadLetterQuery, DlqConfig, DlqService, DlqStats,
    OrderBy, OrderDir, PurgeReport, PurgeRequest, RequeueReport, SkippedId,
};
pub use job::{Job, JobId, JobStatus, NewJob};
pub use lease::{FailOutcome, LeaseManager};
pub use memory::MemoryQueue;
pub use orchestrator::{OrchestratorConfig, WorkerOrchestrator, REAPER_NAME};
pub use retry::{Decision, PolicyRegistry, RetryPolicy, StoreRetry};
pub use worker::{task_fn, Task, TaskError, Worker, WorkerConfig, WorkerStatus};
