use sqlx::{MySql, Pool};
use std::sync::Arc;

use crate::flows::FlowEngine;
use crate::nbd::{DevicePool, PortAllocator, QemuNbdManager};
use crate::orchestrator::BackupOrchestrator;
use crate::repository::RepositoryRegistry;
use crate::restore::RestoreEngine;
use crate::scheduler::Scheduler;

/// Engine handles shared with every request handler.
pub struct EngineState {
    pub pool: Pool<MySql>,
    pub registry: Arc<RepositoryRegistry>,
    pub orchestrator: Arc<BackupOrchestrator>,
    pub restore: Arc<RestoreEngine>,
    pub flows: Arc<FlowEngine>,
    pub scheduler: Arc<Scheduler>,
    pub ports: Arc<PortAllocator>,
    pub nbd_servers: Arc<QemuNbdManager>,
    pub devices: Arc<DevicePool>,
}
