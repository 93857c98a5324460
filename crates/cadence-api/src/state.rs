//! Application State
//!
//! The queue services shared across handlers. Built once at startup; the
//! orchestrator handle is the same one the server stops on shutdown.

use cadence_queue::{DlqService, LeaseManager, WorkerOrchestrator};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    leases: Arc<LeaseManager>,
    dlq: Arc<DlqService>,
    orchestrator: Arc<WorkerOrchestrator>,
}

impl AppState {
    pub fn new(
        leases: Arc<LeaseManager>,
        dlq: Arc<DlqService>,
        orchestrator: Arc<WorkerOrchestrator>,
    ) -> Self {
        Self {
            leases,
            dlq,
            orchestrator,
        }
    }

    pub fn leases(&self) -> Arc<LeaseManager> {
        self.leases.clone()
    }

    pub fn dlq(&self) -> Arc<DlqService> {
        self.dlq.clone()
    }

    pub fn orchestrator(&self) -> Arc<WorkerOrchestrator> {
        self.orchestrator.clone()
    }
}
