//! Lease Manager
//!
//! The only entry point workers and producers use to touch job rows. Adds
//! validation, the retry/dead-letter decision and transient-error retries
//! on top of a [`QueueBackend`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::retry::{Decision, PolicyRegistry, StoreRetry};

/// Longest `last_error` kept on a row
pub const MAX_ERROR_LEN: usize = 2048;

/// What `fail` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Rescheduled { visible_at: DateTime<Utc> },
    DeadLettered,
}

pub struct LeaseManager {
    backend: Arc<dyn QueueBackend>,
    policies: PolicyRegistry,
    store_retry: StoreRetry,
}

impl LeaseManager {
    /// Kinds listed in `policies` are the only ones `enqueue` accepts.
    pub fn new(backend: Arc<dyn QueueBackend>, policies: PolicyRegistry) -> Self {
        Self {
            backend,
            policies,
            store_retry: StoreRetry::default(),
        }
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        self.backend.clone()
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        self.validate(&job)?;
        let now = Utc::now();
        let id = self
            .store_retry
            .execute("enqueue", || self.backend.enqueue(job.clone(), now))
            .await?;
        debug!(job_id = id, kind = %job.kind, priority = job.priority, "Enqueued job");
        Ok(id)
    }

    fn validate(&self, job: &NewJob) -> Result<(), QueueError> {
        if job.kind.trim().is_empty() {
            return Err(QueueError::Validation("kind must not be empty".into()));
        }
        if !self.policies.contains(&job.kind) {
            return Err(QueueError::Validation(format!("unknown job kind '{}'", job.kind)));
        }
        if !job.payload.is_object() {
            return Err(QueueError::Validation("payload must be a JSON object".into()));
        }
        if let Some(key) = &job.idempotency_key {
            if key.trim().is_empty() {
                return Err(QueueError::Validation(
                    "idempotency_key must not be blank".into(),
                ));
            }
        }
        Ok(())
    }

    /// Never blocks: an empty vector means nothing is eligible right now.
    pub async fn lease(
        &self,
        kind: &str,
        limit: usize,
        owner: &str,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let vt = to_chrono(visibility_timeout)?;
        let now = Utc::now();
        let jobs = self
            .store_retry
            .execute("lease", || self.backend.lease(kind, limit, owner, vt, now))
            .await?;
        if !jobs.is_empty() {
            debug!(kind, owner, count = jobs.len(), "Leased jobs");
        }
        Ok(jobs)
    }

    pub async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        visibility_timeout: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let vt = to_chrono(visibility_timeout)?;
        let now = Utc::now();
        self.store_retry
            .execute("extend_lease", || self.backend.extend_lease(id, owner, vt, now))
            .await
    }

    pub async fn ack(&self, id: JobId, owner: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        self.store_retry
            .execute("ack", || self.backend.ack(id, owner, now))
            .await?;
        debug!(job_id = id, owner, "Acked job");
        Ok(())
    }

    /// Record a failed attempt and either reschedule or dead-letter the job.
    pub async fn fail(&self, id: JobId, owner: &str, error: &str) -> Result<FailOutcome, QueueError> {
        let job = self
            .store_retry
            .execute("get_job", || self.backend.get_job(id))
            .await?
            .ok_or(QueueError::NotFound(id))?;

        if job.status != JobStatus::Leased || job.lease_owner.as_deref() != Some(owner) {
            return Err(QueueError::LeaseLost {
                job_id: id,
                owner: owner.to_string(),
            });
        }

        let error = truncate_error(error);
        let now = Utc::now();
        let policy = self.policies.get(&job.kind);

        match policy.next_attempt(job.attempts, now) {
            Decision::RetryAt(visible_at) => {
                self.store_retry
                    .execute("reschedule", || {
                        self.backend.reschedule(id, owner, error, visible_at, now)
                    })
                    .await?;
                warn!(
                    job_id = id,
                    kind = %job.kind,
                    attempts = job.attempts,
                    budget = policy.budget,
                    delay_ms = (visible_at - now).num_milliseconds(),
                    error,
                    "Job failed, rescheduled with backoff"
                );
                Ok(FailOutcome::Rescheduled { visible_at })
            }
            Decision::DeadLetter => {
                self.store_retry
                    .execute("dead_letter", || self.backend.dead_letter(id, owner, error, now))
                    .await?;
                error!(
                    job_id = id,
                    kind = %job.kind,
                    attempts = job.attempts,
                    budget = policy.budget,
                    error,
                    "Retry budget exhausted, job dead-lettered"
                );
                Ok(FailOutcome::DeadLettered)
            }
        }
    }

    /// Return expired leases to `pending`; crashed workers never call `fail`.
    pub async fn reap_expired(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let reaped = self
            .store_retry
            .execute("reap_expired", || self.backend.reap_expired(now))
            .await?;
        if reaped > 0 {
            info!(reaped, "Reclaimed expired leases");
        }
        Ok(reaped)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.store_retry
            .execute("get_job", || self.backend.get_job(id))
            .await
    }
}

fn to_chrono(d: Duration) -> Result<chrono::Duration, QueueError> {
    chrono::Duration::from_std(d)
        .map_err(|_| QueueError::Validation("visibility timeout out of range".into()))
}

fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQueue;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    fn manager(budget: u32) -> LeaseManager {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter_pct: 0.0,
            budget,
        };
        let policies = PolicyRegistry::new(policy).with_kind("watchlist", policy);
        LeaseManager::new(Arc::new(MemoryQueue::new()), policies)
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let lm = manager(3);

        let err = lm.enqueue(NewJob::new("unknown", json!({}))).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = lm.enqueue(NewJob::new("watchlist", json!(42))).await.unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        let err = lm
            .enqueue(NewJob::new("watchlist", json!({})).idempotency_key("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));

        assert!(lm.enqueue(NewJob::new("watchlist", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_reschedules_then_dead_letters() {
        let lm = manager(2);
        let id = lm.enqueue(NewJob::new("watchlist", json!({}))).await.unwrap();

        lm.lease("watchlist", 1, "w", Duration::from_secs(30)).await.unwrap();
        let outcome = lm.fail(id, "w", "network timeout").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Rescheduled { .. }));

        let job = lm.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("network timeout"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let leased = lm.lease("watchlist", 1, "w", Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 1);

        let outcome = lm.fail(id, "w", "network timeout again").await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);
        assert_eq!(
            lm.get_job(id).await.unwrap().unwrap().status,
            JobStatus::DeadLetter
        );
    }

    #[tokio::test]
    async fn test_fail_by_stranger_is_lease_lost() {
        let lm = manager(3);
        let id = lm.enqueue(NewJob::new("watchlist", json!({}))).await.unwrap();
        lm.lease("watchlist", 1, "w-1", Duration::from_secs(30)).await.unwrap();

        let err = lm.fail(id, "w-2", "boom").await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));

        let err = lm.extend_lease(id, "w-2", Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { .. }));
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN);
        let cut = truncate_error(&long);
        assert!(cut.len() <= MAX_ERROR_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_error("short"), "short");
    }
}
