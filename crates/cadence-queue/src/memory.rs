//! In-memory queue implementation
//!
//! A single mutex guards the whole table, which makes every operation
//! (including the select-and-claim step of `lease`) atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::backend::{
    CreatedRange, DeadLetterFilter, DeadLetterSummary, QueueBackend, QueueError, RequeueOutcome,
};
use crate::dlq::{OrderBy, OrderDir};
use crate::job::{Job, JobId, JobStatus, NewJob};

#[derive(Debug, Default)]
struct Table {
    next_id: JobId,
    jobs: HashMap<JobId, Job>,
}

impl Table {
    fn active_with_key(&self, kind: &str, key: &str, except: Option<JobId>) -> Option<JobId> {
        self.jobs
            .values()
            .find(|j| {
                Some(j.id) != except
                    && !j.status.is_terminal()
                    && j.kind == kind
                    && j.idempotency_key.as_deref() == Some(key)
            })
            .map(|j| j.id)
    }

    /// Ownership check shared by every lease-holder mutation.
    fn owned_mut(&mut self, id: JobId, owner: &str) -> Result<&mut Job, QueueError> {
        let job = self.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.status != JobStatus::Leased || job.lease_owner.as_deref() != Some(owner) {
            return Err(QueueError::LeaseLost {
                job_id: id,
                owner: owner.to_string(),
            });
        }
        Ok(job)
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    table: Mutex<Table>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored, in any status
    pub async fn len(&self) -> usize {
        self.table.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, new: NewJob, now: DateTime<Utc>) -> Result<JobId, QueueError> {
        let mut table = self.table.lock().await;

        if let Some(key) = new.idempotency_key.as_deref() {
            if let Some(existing) = table.active_with_key(&new.kind, key, None) {
                return Ok(existing);
            }
        }

        table.next_id += 1;
        let id = table.next_id;
        table.jobs.insert(
            id,
            Job {
                id,
                kind: new.kind,
                payload: new.payload,
                idempotency_key: new.idempotency_key,
                status: JobStatus::Pending,
                priority: new.priority,
                visible_at: new.visible_at.unwrap_or(now),
                lease_owner: None,
                lease_expires_at: None,
                attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(id)
    }

    async fn lease(
        &self,
        kind: &str,
        limit: usize,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, QueueError> {
        let mut table = self.table.lock().await;

        let mut eligible: Vec<&Job> = table
            .jobs
            .values()
            .filter(|j| j.kind == kind)
            .filter(|j| match j.status {
                JobStatus::Pending => j.visible_at <= now,
                JobStatus::Leased => j.lease_expires_at.map(|t| t < now).unwrap_or(true),
                _ => false,
            })
            .collect();
        eligible.sort_by_key(|j| (j.priority, j.created_at, j.id));
        let ids: Vec<JobId> = eligible.into_iter().take(limit).map(|j| j.id).collect();

        let expires = now + visibility_timeout;
        let mut leased = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = table.jobs.get_mut(&id) {
                job.status = JobStatus::Leased;
                job.lease_owner = Some(owner.to_string());
                job.lease_expires_at = Some(expires);
                job.attempts += 1;
                job.updated_at = now;
                leased.push(job.clone());
            }
        }

        Ok(leased)
    }

    async fn extend_lease(
        &self,
        id: JobId,
        owner: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError> {
        let mut table = self.table.lock().await;
        let job = table.owned_mut(id, owner)?;
        let expires = now + visibility_timeout;
        job.lease_expires_at = Some(expires);
        job.updated_at = now;
        Ok(expires)
    }

    async fn ack(&self, id: JobId, owner: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let mut table = self.table.lock().await;

        // Repeated ack by the same owner
        if let Some(job) = table.jobs.get(&id) {
            if job.status == JobStatus::Done && job.lease_owner.as_deref() == Some(owner) {
                return Ok(());
            }
        }

        let job = table.owned_mut(id, owner)?;
        job.status = JobStatus::Done;
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        visible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut table = self.table.lock().await;
        let job = table.owned_mut(id, owner)?;
        job.status = JobStatus::Pending;
        job.visible_at = visible_at;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn dead_letter(
        &self,
        id: JobId,
        owner: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut table = self.table.lock().await;
        let job = table.owned_mut(id, owner)?;
        job.status = JobStatus::DeadLetter;
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let mut table = self.table.lock().await;
        let mut reaped = 0;
        for job in table.jobs.values_mut() {
            let expired = job.status == JobStatus::Leased
                && job.lease_expires_at.map(|t| t < now).unwrap_or(true);
            if expired {
                job.status = JobStatus::Pending;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.table.lock().await.jobs.get(&id).cloned())
    }

    async fn dead_letter_summaries(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterSummary>, QueueError> {
        let table = self.table.lock().await;
        let mut rows: Vec<DeadLetterSummary> = table
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::DeadLetter)
            .filter(|j| match filter {
                DeadLetterFilter::Created(range) => range.contains(j.created_at),
                DeadLetterFilter::Ids(ids) => ids.contains(&j.id),
            })
            .map(|j| DeadLetterSummary {
                id: j.id,
                last_error: j.last_error.clone(),
                created_at: j.created_at,
                updated_at: j.updated_at,
            })
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        Ok(rows)
    }

    async fn dead_letter_page(
        &self,
        range: CreatedRange,
        order_by: OrderBy,
        order_dir: OrderDir,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Job>, u64), QueueError> {
        let table = self.table.lock().await;
        let mut rows: Vec<&Job> = table
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::DeadLetter && range.contains(j.created_at))
            .collect();
        let key = |j: &Job| order_by.key(j.created_at, j.updated_at, j.id);
        rows.sort_by(|a, b| order_dir.apply(key(a).cmp(&key(b))));

        let total = rows.len() as u64;
        let page = rows.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn dead_letters_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, QueueError> {
        let table = self.table.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .filter(|j| j.status == JobStatus::DeadLetter)
            .cloned()
            .collect())
    }

    async fn requeue_dead_letter(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<RequeueOutcome, QueueError> {
        let mut table = self.table.lock().await;

        let (kind, key) = match table.jobs.get(&id) {
            None => return Ok(RequeueOutcome::NotFound),
            Some(job) => match job.status {
                JobStatus::Pending | JobStatus::Leased => return Ok(RequeueOutcome::AlreadyQueued),
                JobStatus::Done => return Ok(RequeueOutcome::NotDeadLetter),
                JobStatus::DeadLetter => (job.kind.clone(), job.idempotency_key.clone()),
            },
        };

        if let Some(key) = key.as_deref() {
            if table.active_with_key(&kind, key, Some(id)).is_some() {
                return Ok(RequeueOutcome::DuplicateActive);
            }
        }

        if let Some(job) = table.jobs.get_mut(&id) {
            job.status = JobStatus::Pending;
            job.visible_at = now;
            job.updated_at = now;
        }
        Ok(RequeueOutcome::Requeued)
    }

    async fn delete_dead_letters(&self, ids: &[JobId]) -> Result<u64, QueueError> {
        let mut table = self.table.lock().await;
        let mut deleted = 0;
        for id in ids {
            let is_dead = table
                .jobs
                .get(id)
                .map(|j| j.status == JobStatus::DeadLetter)
                .unwrap_or(false);
            if is_dead && table.jobs.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}
