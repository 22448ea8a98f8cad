// flows/mod.rs
//
// Protection flow engine: CRUD over user-defined flows and the execution
// machinery that fans a triggered flow out into per-VM backup jobs. Job
// outcomes arrive through in-process subscriptions on the orchestrator, not
// by polling.

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use sqlx::{MySql, Pool};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::db::queries;
use crate::db::tables::{FlowExecution, ProtectionFlow};
use crate::orchestrator::BackupOrchestrator;
use crate::scheduler;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("protection flow not found: {0}")]
    NotFound(String),

    #[error("flow execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("a protection flow named '{0}' already exists")]
    NameTaken(String),

    #[error("{0}")]
    Validation(String),

    #[error("flow {0} already has an execution in flight")]
    AlreadyRunning(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Validated flow description used by create and update.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    pub name: String,
    pub flow_type: String,
    pub target_type: String,
    pub target_id: String,
    pub repository_id: Option<String>,
    pub policy_id: Option<String>,
    pub schedule_id: Option<String>,
    pub enabled: bool,
}

pub struct FlowEngine {
    pool: Pool<MySql>,
    orchestrator: Arc<BackupOrchestrator>,
    running: Mutex<HashSet<String>>,
    cancelled: Mutex<HashSet<String>>,
}

impl FlowEngine {
    pub fn new(pool: Pool<MySql>, orchestrator: Arc<BackupOrchestrator>) -> Self {
        Self {
            pool,
            orchestrator,
            running: Mutex::new(HashSet::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_running(&self, flow_id: &str) -> bool {
        self.running.lock().contains(flow_id)
    }

    async fn validate_spec(&self, spec: &FlowSpec, existing_id: Option<&str>) -> Result<(), FlowError> {
        match spec.flow_type.as_str() {
            "backup" => {
                if spec.repository_id.is_none() {
                    return Err(FlowError::Validation(
                        "backup flows require a repository_id".to_string(),
                    ));
                }
            }
            "replication" => {}
            other => {
                return Err(FlowError::Validation(format!(
                    "invalid flow_type: {}",
                    other
                )))
            }
        }

        match spec.target_type.as_str() {
            "vm" => {
                if queries::vm::get_vm_by_name(&self.pool, &spec.target_id)
                    .await?
                    .is_none()
                {
                    return Err(FlowError::Validation(format!(
                        "target VM not found: {}",
                        spec.target_id
                    )));
                }
            }
            "group" => {
                if queries::group::get_group(&self.pool, &spec.target_id)
                    .await?
                    .is_none()
                {
                    return Err(FlowError::Validation(format!(
                        "target group not found: {}",
                        spec.target_id
                    )));
                }
            }
            other => {
                return Err(FlowError::Validation(format!(
                    "invalid target_type: {}",
                    other
                )))
            }
        }

        if let Some(repo_id) = spec.repository_id.as_deref() {
            if queries::repository::get_repository(&self.pool, repo_id)
                .await?
                .is_none()
            {
                return Err(FlowError::Validation(format!(
                    "repository not found: {}",
                    repo_id
                )));
            }
        }

        if let Some(policy_id) = spec.policy_id.as_deref() {
            if queries::policy::get_policy(&self.pool, policy_id)
                .await?
                .is_none()
            {
                return Err(FlowError::Validation(format!(
                    "policy not found: {}",
                    policy_id
                )));
            }
        }

        if let Some(schedule_id) = spec.schedule_id.as_deref() {
            let schedule = queries::schedule::get_schedule(&self.pool, schedule_id)
                .await?
                .ok_or_else(|| {
                    FlowError::Validation(format!("schedule not found: {}", schedule_id))
                })?;
            scheduler::next_fire(&schedule.cron_expression)
                .map_err(|e| FlowError::Validation(format!("invalid cron expression: {}", e)))?;
        }

        if let Some(taken) = queries::flow::get_flow_by_name(&self.pool, &spec.name).await? {
            if existing_id != Some(taken.id.as_str()) {
                return Err(FlowError::NameTaken(spec.name.clone()));
            }
        }

        Ok(())
    }

    pub async fn create_flow(&self, spec: FlowSpec) -> Result<ProtectionFlow, FlowError> {
        self.validate_spec(&spec, None).await?;

        let next_execution_at = match spec.schedule_id.as_deref() {
            Some(schedule_id) => {
                let schedule = queries::schedule::get_schedule(&self.pool, schedule_id)
                    .await?
                    .ok_or_else(|| {
                        FlowError::Validation(format!("schedule not found: {}", schedule_id))
                    })?;
                scheduler::next_fire(&schedule.cron_expression).ok().flatten()
            }
            None => None,
        };

        let now = Utc::now();
        let flow = ProtectionFlow {
            id: format!("flow-{}", &Uuid::new_v4().simple().to_string()[..12]),
            name: spec.name,
            flow_type: spec.flow_type,
            target_type: spec.target_type,
            target_id: spec.target_id,
            repository_id: spec.repository_id,
            policy_id: spec.policy_id,
            schedule_id: spec.schedule_id,
            enabled: spec.enabled,
            last_execution_id: None,
            last_execution_status: None,
            last_execution_at: None,
            next_execution_at,
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            created_at: now,
            updated_at: now,
        };

        queries::flow::create_flow(&self.pool, &flow).await?;
        info!("created protection flow {} ({})", flow.name, flow.id);
        Ok(flow)
    }

    pub async fn update_flow(
        &self,
        flow_id: &str,
        spec: FlowSpec,
    ) -> Result<ProtectionFlow, FlowError> {
        let mut flow = queries::flow::get_flow(&self.pool, flow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;

        self.validate_spec(&spec, Some(flow_id)).await?;

        flow.name = spec.name;
        flow.flow_type = spec.flow_type;
        flow.target_type = spec.target_type;
        flow.target_id = spec.target_id;
        flow.repository_id = spec.repository_id;
        flow.policy_id = spec.policy_id;
        flow.schedule_id = spec.schedule_id;
        flow.enabled = spec.enabled;

        queries::flow::update_flow(&self.pool, &flow).await?;
        Ok(flow)
    }

    pub async fn delete_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        if queries::flow::get_flow(&self.pool, flow_id).await?.is_none() {
            return Err(FlowError::NotFound(flow_id.to_string()));
        }
        if self.is_running(flow_id) {
            return Err(FlowError::AlreadyRunning(flow_id.to_string()));
        }
        queries::flow::delete_flow(&self.pool, flow_id).await?;
        Ok(())
    }

    pub async fn set_enabled(&self, flow_id: &str, enabled: bool) -> Result<(), FlowError> {
        let affected = queries::flow::set_flow_enabled(&self.pool, flow_id, enabled).await?;
        if affected == 0 {
            return Err(FlowError::NotFound(flow_id.to_string()));
        }
        Ok(())
    }

    /// Record a skipped tick: the schedule fired while the previous
    /// execution of the same flow was still running.
    pub async fn record_skipped(&self, flow_id: &str) -> Result<(), FlowError> {
        let now = Utc::now();
        let execution = FlowExecution {
            id: format!("exec-{}", &Uuid::new_v4().simple().to_string()[..12]),
            flow_id: flow_id.to_string(),
            status: "skipped".to_string(),
            trigger_source: "scheduled".to_string(),
            jobs_created: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            jobs_skipped: 0,
            vms_processed: 0,
            bytes_transferred: 0,
            backup_job_ids: "[]".to_string(),
            error_message: Some("previous execution still running".to_string()),
            started_at: Some(now),
            completed_at: Some(now),
            execution_time_seconds: Some(0),
            created_at: now,
        };
        queries::flow::create_execution(&self.pool, &execution).await?;
        queries::flow::finish_execution(
            &self.pool,
            &execution.id,
            "skipped",
            0,
            execution.error_message.as_deref(),
        )
        .await?;
        warn!("flow {}: tick skipped, execution still in flight", flow_id);
        Ok(())
    }

    /// Soft cancel: stop dispatching further VMs; in-flight per-VM jobs run
    /// to completion.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        let execution = queries::flow::get_execution(&self.pool, execution_id)
            .await?
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status != "running" && execution.status != "pending" {
            return Ok(());
        }

        self.cancelled.lock().insert(execution_id.to_string());
        info!("flow execution {} marked for cancellation", execution_id);
        Ok(())
    }

    /// Trigger a flow. Creates the execution row, spawns the fan-out task
    /// and returns the running execution immediately.
    pub async fn execute_flow(
        self: &Arc<Self>,
        flow_id: &str,
        trigger: &str,
    ) -> Result<FlowExecution, FlowError> {
        let flow = queries::flow::get_flow(&self.pool, flow_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;

        {
            let mut running = self.running.lock();
            if !running.insert(flow.id.clone()) {
                return Err(FlowError::AlreadyRunning(flow.id));
            }
        }

        let now = Utc::now();
        let execution = FlowExecution {
            id: format!("exec-{}", &Uuid::new_v4().simple().to_string()[..12]),
            flow_id: flow.id.clone(),
            status: "running".to_string(),
            trigger_source: trigger.to_string(),
            jobs_created: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            jobs_skipped: 0,
            vms_processed: 0,
            bytes_transferred: 0,
            backup_job_ids: "[]".to_string(),
            error_message: None,
            started_at: Some(now),
            completed_at: None,
            execution_time_seconds: None,
            created_at: now,
        };

        if let Err(e) = queries::flow::create_execution(&self.pool, &execution).await {
            self.running.lock().remove(&flow.id);
            return Err(e.into());
        }

        let engine = Arc::clone(self);
        let spawned_flow = flow.clone();
        let spawned_execution = execution.clone();
        tokio::spawn(async move {
            let flow_id = spawned_flow.id.clone();
            if let Err(e) = engine.run_execution(spawned_flow, spawned_execution).await {
                error!("flow {}: execution task failed: {}", flow_id, e);
            }
            engine.running.lock().remove(&flow_id);
        });

        Ok(execution)
    }

    /// The fan-out body: resolve the VM set, dispatch per-VM backups with
    /// the group's concurrency bound, and settle the execution from the
    /// orchestrator's terminal notifications.
    async fn run_execution(
        &self,
        flow: ProtectionFlow,
        mut execution: FlowExecution,
    ) -> Result<(), FlowError> {
        let started = Utc::now();

        let (vm_names, max_concurrent) = match flow.target_type.as_str() {
            "group" => {
                let members =
                    queries::group::list_enabled_members(&self.pool, &flow.target_id).await?;
                let group = queries::group::get_group(&self.pool, &flow.target_id).await?;
                let bound = group
                    .map(|g| g.max_concurrent_vms.max(1) as usize)
                    .unwrap_or(1);
                (
                    members.into_iter().map(|m| m.vm_name).collect::<Vec<_>>(),
                    bound,
                )
            }
            _ => (vec![flow.target_id.clone()], 1),
        };

        let repository_id = flow.repository_id.clone().unwrap_or_default();
        let mut job_ids: Vec<String> = Vec::new();
        let mut outcome_rxs = Vec::new();

        for vm_name in &vm_names {
            if self.cancelled.lock().contains(&execution.id) {
                info!(
                    "flow {}: execution {} cancelled, stopping dispatch",
                    flow.id, execution.id
                );
                break;
            }

            // throttle to the group's concurrency bound
            while outcome_rxs.len() >= max_concurrent {
                let (outcome, _, rest): (
                    Result<crate::orchestrator::JobOutcome, tokio::sync::oneshot::error::RecvError>,
                    usize,
                    Vec<_>,
                ) = futures::future::select_all(outcome_rxs).await;
                outcome_rxs = rest;
                match outcome {
                    Ok(o) if o.status == "completed" => execution.jobs_completed += 1,
                    _ => execution.jobs_failed += 1,
                }
            }

            let backup_type = self.auto_backup_type(vm_name, &repository_id).await?;
            execution.vms_processed += 1;

            match self
                .orchestrator
                .start_backup(vm_name, &repository_id, &backup_type, flow.policy_id.as_deref())
                .await
            {
                Ok(job) => {
                    outcome_rxs.push(self.orchestrator.subscribe(&job.id).await);
                    job_ids.push(job.id);
                    execution.jobs_created += 1;
                }
                Err(e) => {
                    error!("flow {}: backup of {} failed to start: {}", flow.id, vm_name, e);
                    execution.jobs_failed += 1;
                }
            }

            execution.backup_job_ids =
                serde_json::to_string(&job_ids).unwrap_or_else(|_| "[]".to_string());
            queries::flow::update_execution_progress(&self.pool, &execution).await?;
        }

        // settle the remaining in-flight jobs
        for rx in outcome_rxs {
            match rx.await {
                Ok(outcome) => {
                    if outcome.status == "completed" {
                        execution.jobs_completed += 1;
                    } else {
                        execution.jobs_failed += 1;
                    }
                    execution.bytes_transferred += outcome.bytes_transferred;
                }
                Err(_) => execution.jobs_failed += 1,
            }
        }

        let was_cancelled = self.cancelled.lock().remove(&execution.id);
        let status = if was_cancelled {
            "cancelled"
        } else if execution.jobs_failed == 0 {
            "success"
        } else if execution.jobs_completed > 0 {
            "warning"
        } else {
            "error"
        };

        let elapsed = (Utc::now() - started).num_seconds();
        let error_message = if execution.jobs_failed > 0 {
            Some(format!("{} of {} jobs failed", execution.jobs_failed, execution.jobs_created.max(execution.jobs_failed)))
        } else {
            None
        };

        queries::flow::update_execution_progress(&self.pool, &execution).await?;
        queries::flow::finish_execution(
            &self.pool,
            &execution.id,
            status,
            elapsed,
            error_message.as_deref(),
        )
        .await?;

        let next_execution_at = match flow.schedule_id.as_deref() {
            Some(schedule_id) => match queries::schedule::get_schedule(&self.pool, schedule_id)
                .await?
            {
                Some(schedule) => scheduler::next_fire(&schedule.cron_expression).ok().flatten(),
                None => None,
            },
            None => None,
        };

        queries::flow::record_execution_result(
            &self.pool,
            &flow.id,
            &execution.id,
            status,
            next_execution_at,
            status == "success",
        )
        .await?;

        info!(
            "flow {}: execution {} finished {} ({} completed, {} failed, {}s)",
            flow.id, execution.id, status, execution.jobs_completed, execution.jobs_failed, elapsed
        );

        Ok(())
    }

    /// Incremental when the `(vm, repository)` context already holds a
    /// successful backup, full otherwise.
    async fn auto_backup_type(
        &self,
        vm_name: &str,
        repository_id: &str,
    ) -> Result<String, FlowError> {
        let context = queries::context::find_context(&self.pool, vm_name, repository_id).await?;
        Ok(match context {
            Some(ctx) if queries::backup::has_completed_backup(&self.pool, &ctx.id).await? => {
                "incremental".to_string()
            }
            _ => "full".to_string(),
        })
    }
}
