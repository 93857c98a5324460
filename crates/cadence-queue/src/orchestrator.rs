//! Worker Orchestrator - owns the named workers and the lease reaper
//!
//! Constructed once at process start and shared by reference; nothing here
//! is global. Each worker runs as its own tokio task with a child
//! cancellation token, so workers can be stopped together on shutdown or
//! toggled individually.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::QueueError;
use crate::lease::LeaseManager;
use crate::worker::{SharedStatus, Task, Worker, WorkerConfig, WorkerStatus};

/// Status key used for the maintenance sweep
pub const REAPER_NAME: &str = "reaper";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global kill switch: `start` spawns nothing (maintenance mode, tests)
    pub workers_disabled: bool,
    /// How long `stop` waits for in-flight tasks before aborting them
    pub shutdown_grace: Duration,
    /// Period of the `reap_expired` sweep
    pub reap_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers_disabled: false,
            shutdown_grace: Duration::from_secs(30),
            reap_interval: Duration::from_secs(15),
        }
    }
}

struct TaskHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

struct Slot {
    config: WorkerConfig,
    task: Arc<dyn Task>,
    enabled: bool,
    status: SharedStatus,
    handle: Option<TaskHandle>,
}

struct Inner {
    slots: BTreeMap<String, Slot>,
    reaper: Option<TaskHandle>,
    root: Option<CancellationToken>,
}

pub struct WorkerOrchestrator {
    leases: Arc<LeaseManager>,
    config: OrchestratorConfig,
    reaper_status: SharedStatus,
    inner: Mutex<Inner>,
}

impl WorkerOrchestrator {
    pub fn new(leases: Arc<LeaseManager>, config: OrchestratorConfig) -> Self {
        Self {
            leases,
            config,
            reaper_status: Arc::new(RwLock::new(WorkerStatus::default())),
            inner: Mutex::new(Inner {
                slots: BTreeMap::new(),
                reaper: None,
                root: None,
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Add a named worker. If the orchestrator is already running the
    /// worker is started immediately.
    pub async fn register(
        &self,
        name: impl Into<String>,
        config: WorkerConfig,
        task: Arc<dyn Task>,
    ) -> Result<(), QueueError> {
        self.register_with(name, config, task, true).await
    }

    pub async fn register_with(
        &self,
        name: impl Into<String>,
        config: WorkerConfig,
        task: Arc<dyn Task>,
        enabled: bool,
    ) -> Result<(), QueueError> {
        let name = name.into();
        if name == REAPER_NAME {
            return Err(QueueError::Validation(format!("worker name '{}' is reserved", name)));
        }
        if !self.leases.policies().contains(&config.kind) {
            return Err(QueueError::Validation(format!(
                "worker '{}' targets unknown job kind '{}'",
                name, config.kind
            )));
        }
        if config.batch_size == 0 {
            return Err(QueueError::Validation(format!(
                "worker '{}' has a zero batch size",
                name
            )));
        }

        let mut inner = self.inner.lock().await;
        if inner.slots.contains_key(&name) {
            return Err(QueueError::Validation(format!("worker '{}' already registered", name)));
        }

        let mut slot = Slot {
            config,
            task,
            enabled,
            status: Arc::new(RwLock::new(WorkerStatus::default())),
            handle: None,
        };
        if enabled {
            if let Some(root) = inner.root.clone() {
                slot.handle = Some(self.spawn_worker(&name, &slot, &root));
            }
        }
        inner.slots.insert(name, slot);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.root.is_some()
    }

    /// Spawn every enabled worker plus the reaper. No-op when workers are
    /// globally disabled or already running.
    pub async fn start(&self) {
        if self.config.workers_disabled {
            info!("Workers disabled by configuration, orchestrator not starting");
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.root.is_some() {
            return;
        }

        let root = CancellationToken::new();
        let mut started = 0;
        for (name, slot) in inner.slots.iter_mut() {
            if slot.enabled {
                let handle = self.spawn_worker(name, slot, &root);
                slot.handle = Some(handle);
                started += 1;
            }
        }

        inner.reaper = Some(self.spawn_reaper(&root));
        inner.root = Some(root);

        info!(
            workers = started,
            reap_interval_ms = self.config.reap_interval.as_millis() as u64,
            "Orchestrator started"
        );
    }

    fn spawn_worker(&self, name: &str, slot: &Slot, root: &CancellationToken) -> TaskHandle {
        let token = root.child_token();
        let worker = Worker::new(name, slot.config.clone(), slot.task.clone(), self.leases.clone())
            .with_status(slot.status.clone());
        let join = tokio::spawn(worker.run(token.clone()));
        TaskHandle { token, join }
    }

    fn spawn_reaper(&self, root: &CancellationToken) -> TaskHandle {
        let token = root.child_token();
        let join = tokio::spawn(run_reaper(
            self.leases.clone(),
            self.config.reap_interval,
            self.reaper_status.clone(),
            token.clone(),
        ));
        TaskHandle { token, join }
    }

    /// Toggle one worker at runtime. Disabling waits for its in-flight task
    /// within the shutdown grace period.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), QueueError> {
        let stopping = {
            let mut inner = self.inner.lock().await;
            let root = inner.root.clone();
            let slot = inner
                .slots
                .get_mut(name)
                .ok_or_else(|| QueueError::Validation(format!("unknown worker '{}'", name)))?;

            if slot.enabled == enabled {
                return Ok(());
            }
            slot.enabled = enabled;
            info!(worker = name, enabled, "Worker toggled");

            if enabled {
                if let Some(root) = root {
                    let handle = self.spawn_worker(name, slot, &root);
                    slot.handle = Some(handle);
                }
                None
            } else {
                slot.handle.take().map(|h| (slot.status.clone(), h))
            }
        };

        if let Some((status, handle)) = stopping {
            handle.token.cancel();
            let deadline = Instant::now() + self.config.shutdown_grace;
            join_or_abort(name, handle.join, deadline, &status).await;
        }
        Ok(())
    }

    /// Cancel every worker and wait up to the grace period for in-flight
    /// tasks; stragglers are aborted. Jobs they held stay leased until the
    /// lease expires.
    pub async fn stop(&self) {
        let (root, handles) = {
            let mut inner = self.inner.lock().await;
            let Some(root) = inner.root.take() else {
                return;
            };
            let mut handles: Vec<(String, SharedStatus, TaskHandle)> = inner
                .slots
                .iter_mut()
                .filter_map(|(name, slot)| {
                    slot.handle
                        .take()
                        .map(|h| (name.clone(), slot.status.clone(), h))
                })
                .collect();
            if let Some(reaper) = inner.reaper.take() {
                handles.push((REAPER_NAME.to_string(), self.reaper_status.clone(), reaper));
            }
            (root, handles)
        };

        info!(tasks = handles.len(), "Stopping orchestrator");
        root.cancel();

        let deadline = Instant::now() + self.config.shutdown_grace;
        for (name, status, handle) in handles {
            join_or_abort(&name, handle.join, deadline, &status).await;
        }

        info!("Orchestrator stopped");
    }

    /// Health snapshot for every registered worker plus the reaper.
    pub async fn status(&self) -> BTreeMap<String, WorkerStatus> {
        let statuses: Vec<(String, SharedStatus)> = {
            let inner = self.inner.lock().await;
            inner
                .slots
                .iter()
                .map(|(name, slot)| (name.clone(), slot.status.clone()))
                .collect()
        };

        let mut out = BTreeMap::new();
        for (name, status) in statuses {
            out.insert(name, status.read().await.clone());
        }
        out.insert(REAPER_NAME.to_string(), self.reaper_status.read().await.clone());
        out
    }
}

async fn join_or_abort(name: &str, mut join: JoinHandle<()>, deadline: Instant, status: &SharedStatus) {
    match tokio::time::timeout_at(deadline, &mut join).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(worker = name, error = %e, "Worker task ended abnormally");
            let mut status = status.write().await;
            status.running = false;
            status.last_error = Some(e.to_string());
        }
        Err(_) => {
            warn!(worker = name, "Worker did not stop within grace period, aborting");
            join.abort();
            status.write().await.running = false;
        }
    }
}

async fn run_reaper(
    leases: Arc<LeaseManager>,
    interval: Duration,
    status: SharedStatus,
    shutdown: CancellationToken,
) {
    status.write().await.running = true;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let result = leases.reap_expired().await;
                let mut status = status.write().await;
                status.last_tick_at = Some(Utc::now());
                match result {
                    Ok(reaped) => status.processed += reaped,
                    Err(e) => {
                        error!(error = %e, "Lease reaper sweep failed");
                        status.failed += 1;
                        status.last_error = Some(e.to_string());
                    }
                }
            }
        }
    }

    status.write().await.running = false;
}
