//! Queue Backend Trait
//!
//! The job store contract. Every mutation that touches a leased row is
//! keyed by `(job_id, owner)` and applied as a single conditional update,
//! so implementations never read-then-write outside the store's own
//! atomicity guarantees.

use crate::dlq::{OrderBy, OrderDir};
use crate::job::{Job, JobId, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Lease lost on job {job_id} (owner {owner})")]
    LeaseLost { job_id: JobId, owner: String },
    /// Connectivity-class failures worth retrying (busy, pool timeout, I/O)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Creation-time window applied to dead-letter reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreatedRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl CreatedRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map(|from| at >= from).unwrap_or(true)
            && self.to.map(|to| at < to).unwrap_or(true)
    }
}

/// Which dead-lettered rows a summary read covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterFilter {
    Created(CreatedRange),
    Ids(Vec<JobId>),
}

/// A dead-lettered row without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSummary {
    pub id: JobId,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of moving one dead-lettered row back to `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    /// Row is `pending` or `leased` already
    AlreadyQueued,
    /// Row finished successfully; nothing to recover
    NotDeadLetter,
    /// Another active job of the same kind now owns the idempotency key
    DuplicateActive,
    NotFound,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a job. With an idempotency key, an existing non-terminal job
    /// of the same kind and key is returned instead of creating a new row.
    async fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobId, QueueError>;

    /// Atomically claim up to `limit` visible jobs of `kind`, ordered by
    /// priority then age. Rows whose lease already expired are claimable too.
    async fn lease(
        &self,
        kind: &str,
        limit: usize,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError>;

    /// Push the lease expiry forward; returns the new expiry.
    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError>;

    /// Mark a leased job done. Repeating the call with the same owner is a no-op.
    async fn ack(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Release the lease and make the job visible again at `visible_at`.
    async fn reschedule(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Release the lease and move the job to `dead_letter`.
    async fn dead_letter(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Reset every expired lease to `pending`; returns how many rows moved.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Payload-free view of the matching dead-lettered rows, oldest first.
    async fn dead_letter_summaries(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterSummary>, QueueError>;

    /// One ordered page of dead-lettered rows created inside `range`, plus
    /// the total number of rows in the range.
    async fn dead_letter_page(
        &self,
        range: CreatedRange,
        order_by: OrderBy,
        order_dir: OrderDir,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, u64), QueueError>;

    /// Full rows for the listed ids that are still dead-lettered, in no
    /// particular order.
    async fn dead_letters_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, QueueError>;

    /// Move one dead-lettered row back to `pending`, visible at `now`.
    /// `attempts` is left untouched.
    async fn requeue_dead_letter(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, QueueError>;

    /// Delete the listed rows that are still dead-lettered; returns the count deleted.
    async fn delete_dead_letters(&self, ids: &[JobId]) -> Result<u64, QueueError>;

    /// Cheap liveness check for health reporting
    async fn is_healthy(&self) -> bool {
        true
    }
}
