//! Worker loop
//!
//! A worker repeatedly leases a batch of jobs of one kind, runs its task on
//! each, and reports the outcome through the [`LeaseManager`]. Task errors
//! and panics are converted into `fail` calls; they never escape the loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::QueueError;
use crate::job::Job;
use crate::lease::{FailOutcome, LeaseManager};

/// Error returned by a task; its message is stored as the job's `last_error`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl TaskError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        Self::Failed(msg.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

/// Business logic run for each leased job. Must be idempotent: delivery is
/// at-least-once.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), TaskError>;
}

/// Adapts a `(payload) -> Future<Result>` closure into a [`Task`].
pub struct FnTask<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

pub fn task_fn<F, Fut>(f: F) -> FnTask<F, Fut>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    FnTask {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F, Fut>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn run(&self, job: &Job) -> Result<(), TaskError> {
        (self.f)(job.payload.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Job kind this worker leases
    pub kind: String,
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    /// Idle sleep when a lease comes back empty
    pub poll_interval: Duration,
    /// Extend the lease every `visibility_timeout / 2` while a task runs
    pub heartbeat: bool,
}

impl WorkerConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            batch_size: 10,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            heartbeat: true,
        }
    }
}

/// Health snapshot published by a running worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, utoipa::ToSchema)]
pub struct WorkerStatus {
    pub running: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub processed: u64,
    pub failed: u64,
}

pub type SharedStatus = Arc<RwLock<WorkerStatus>>;

enum Execution {
    Finished(Result<(), TaskError>),
    LeaseLost,
}

pub struct Worker {
    name: String,
    owner: String,
    config: WorkerConfig,
    task: Arc<dyn Task>,
    leases: Arc<LeaseManager>,
    status: SharedStatus,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        config: WorkerConfig,
        task: Arc<dyn Task>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        let name = name.into();
        let owner = format!("{}-{}", name, uuid::Uuid::new_v4().simple());
        Self {
            name,
            owner,
            config,
            task,
            leases,
            status: Arc::new(RwLock::new(WorkerStatus::default())),
        }
    }

    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = status;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lease owner identity stamped on claimed rows
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Run until `shutdown` fires. A task already in flight is allowed to
    /// finish; jobs leased but not yet started stay leased until expiry.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker = %self.name,
            kind = %self.config.kind,
            owner = %self.owner,
            batch_size = self.config.batch_size,
            "Worker started"
        );
        self.status.write().await.running = true;

        while !shutdown.is_cancelled() {
            let leased = self.tick(&shutdown).await;

            if leased == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        self.status.write().await.running = false;
        info!(worker = %self.name, "Worker stopped");
    }

    async fn tick(&self, shutdown: &CancellationToken) -> usize {
        self.status.write().await.last_tick_at = Some(Utc::now());

        let jobs = match self
            .leases
            .lease(
                &self.config.kind,
                self.config.batch_size,
                &self.owner,
                self.config.visibility_timeout,
            )
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Lease failed");
                self.status.write().await.last_error = Some(e.to_string());
                return 0;
            }
        };

        let count = jobs.len();
        for job in jobs {
            // Unstarted jobs keep their lease and are recovered after expiry
            if shutdown.is_cancelled() {
                debug!(worker = %self.name, job_id = job.id, "Shutdown requested, leaving job leased");
                break;
            }
            self.process(job).await;
        }
        count
    }

    /// Run one job leased under this worker's owner id and report the outcome.
    pub async fn process(&self, job: Job) {
        debug!(worker = %self.name, job_id = job.id, attempts = job.attempts, "Processing job");

        match self.execute(&job).await {
            Execution::Finished(Ok(())) => match self.leases.ack(job.id, &self.owner).await {
                Ok(()) => self.status.write().await.processed += 1,
                Err(e) => self.report_store_error(&job, "ack", e).await,
            },
            Execution::Finished(Err(task_err)) => {
                let message = task_err.to_string();
                {
                    let mut status = self.status.write().await;
                    status.failed += 1;
                    status.last_error = Some(message.clone());
                }
                match self.leases.fail(job.id, &self.owner, &message).await {
                    Ok(FailOutcome::Rescheduled { .. }) | Ok(FailOutcome::DeadLettered) => {}
                    Err(e) => self.report_store_error(&job, "fail", e).await,
                }
            }
            Execution::LeaseLost => {
                warn!(
                    worker = %self.name,
                    job_id = job.id,
                    "Lease lost while task was running, discarding result"
                );
            }
        }
    }

    async fn execute(&self, job: &Job) -> Execution {
        let run = AssertUnwindSafe(self.task.run(job)).catch_unwind();
        tokio::pin!(run);

        let period = (self.config.visibility_timeout / 2).max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut run => {
                    return Execution::Finished(result.unwrap_or_else(|panic| {
                        Err(TaskError::Failed(format!("panic: {}", panic_message(&*panic))))
                    }));
                }
                _ = heartbeat.tick(), if self.config.heartbeat => {
                    match self
                        .leases
                        .extend_lease(job.id, &self.owner, self.config.visibility_timeout)
                        .await
                    {
                        Ok(expires) => debug!(job_id = job.id, %expires, "Lease extended"),
                        Err(QueueError::LeaseLost { .. }) | Err(QueueError::NotFound(_)) => {
                            return Execution::LeaseLost;
                        }
                        Err(e) => warn!(job_id = job.id, error = %e, "Lease extension failed"),
                    }
                }
            }
        }
    }

    async fn report_store_error(&self, job: &Job, op: &str, e: QueueError) {
        match e {
            // Another worker reclaimed the job after our lease expired
            QueueError::LeaseLost { .. } | QueueError::NotFound(_) => {
                warn!(worker = %self.name, job_id = job.id, op, "Lease lost, skipping");
            }
            e => {
                error!(worker = %self.name, job_id = job.id, op, error = %e, "Store error");
                self.status.write().await.last_error = Some(e.to_string());
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".to_string()
    }
}
