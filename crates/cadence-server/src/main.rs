//! Cadence Server - standalone entry point for the job queue
//!
//! Wires the SQLite job store, the worker orchestrator and the HTTP API
//! together. Queue tuning comes from `CADENCE_*` variables (see
//! `cadence_queue::config`), the listener and database from
//! `CADENCE_PORT` and `DATABASE_URL`.

mod tasks;

use anyhow::{Context, Result};
use cadence_api::{AppState, CadenceServer, ServerConfig};
use cadence_persist::{connect, SqliteConfig, SqliteQueueBackend};
use cadence_queue::{
    DlqService, KindConfig, LeaseManager, QueueBackend, QueueConfig, WorkerOrchestrator,
};
use std::sync::Arc;
use std::time::Duration;

use crate::tasks::{WebhookTask, WEBHOOK_KIND};

#[tokio::main]
async fn main() -> Result<()> {
    cadence_api::server::init_tracing();

    tracing::info!("Starting Cadence job queue server");

    let server_config = ServerConfig::from_env();
    let mut queue_config = QueueConfig::from_env().context("invalid queue configuration")?;
    if !queue_config.kinds.contains_key(WEBHOOK_KIND) {
        queue_config = queue_config.with_kind(KindConfig::new(WEBHOOK_KIND));
    }

    let pool = connect(&SqliteConfig::new(server_config.database_url.clone()))
        .await
        .context("failed to open job store")?;
    let backend: Arc<dyn QueueBackend> = Arc::new(SqliteQueueBackend::new(pool));

    let leases = Arc::new(LeaseManager::new(backend.clone(), queue_config.policies()));
    let orchestrator = Arc::new(WorkerOrchestrator::new(
        leases.clone(),
        queue_config.orchestrator.clone(),
    ));
    let dlq = Arc::new(DlqService::new(backend, queue_config.dlq));

    for (kind, cfg) in &queue_config.kinds {
        if kind != WEBHOOK_KIND {
            tracing::warn!(kind = %kind, "No task registered for job kind, jobs will wait in the queue");
            continue;
        }
        let task = WebhookTask::new(Duration::from_secs(30)).context("failed to build HTTP client")?;
        orchestrator
            .register_with(kind.clone(), cfg.worker.clone(), Arc::new(task), cfg.enabled)
            .await?;
    }

    let server = CadenceServer::new(server_config, AppState::new(leases, dlq, orchestrator));
    server.run().await.map_err(|e| {
        tracing::error!("Server error during execution: {}", e);
        e
    })?;

    Ok(())
}
