// orchestrator/mod.rs
//
// Backup orchestrator: per-VM workflow from resolve through per-disk
// resource setup, agent hand-off, telemetry and completion. All per-disk
// coordination keys on (job_id, disk_index); the database rows are the
// single source of truth for job state.

pub mod agent;
pub mod changeid;

pub use agent::{AgentClient, AgentError, BackupStartRequest};

use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::db::queries;
use crate::db::tables::{BackupCopy, BackupDisk, BackupJob};
use crate::nbd::{export, NbdError, PortAllocator, QemuNbdManager};
use crate::repository::{CreateBackupRequest, RepositoryError, RepositoryRegistry};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("VM not found in configuration store: {0}")]
    VmNotFound(String),

    #[error("VM {0} has no disks")]
    VmHasNoDisks(String),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("no prior backup for {vm_name} disk {disk_index}; run a full backup first")]
    NoParentForIncremental { vm_name: String, disk_index: i32 },

    #[error("backup job not found: {0}")]
    JobNotFound(String),

    #[error("no disk {disk_index} in job {job_id}")]
    DiskNotFound { job_id: String, disk_index: i32 },

    #[error("invalid backup type: {0}")]
    InvalidBackupType(String),

    #[error(transparent)]
    Nbd(#[from] NbdError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Terminal notification handed to flow executions watching a job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: String,
    pub bytes_transferred: i64,
}

/// Comma-separated NBD target string submitted to the capture agent:
/// `{vmware_disk_key}:nbd://127.0.0.1:{port}/{export}` per disk.
pub fn build_nbd_targets(targets: &[(i32, u16, String)]) -> String {
    targets
        .iter()
        .map(|(disk_key, port, export_name)| {
            format!("{}:nbd://127.0.0.1:{}/{}", disk_key, port, export_name)
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn port_owner_key(job_id: &str, disk_index: i32) -> String {
    format!("{}/{}", job_id, disk_index)
}

/// One disk's worth of allocated resources during setup, kept so a failure
/// can unwind everything already built for the job.
struct DiskSetup {
    disk_index: i32,
    vmware_disk_key: i32,
    port: u16,
    export_name: String,
    qcow2_path: PathBuf,
}

pub struct BackupOrchestrator {
    pool: Pool<MySql>,
    registry: Arc<RepositoryRegistry>,
    ports: Arc<PortAllocator>,
    nbd: Arc<QemuNbdManager>,
    agent: AgentClient,
    vcenter: crate::config::VCenterConfig,
    watchers: Mutex<HashMap<String, Vec<oneshot::Sender<JobOutcome>>>>,
}

impl BackupOrchestrator {
    pub fn new(
        pool: Pool<MySql>,
        registry: Arc<RepositoryRegistry>,
        ports: Arc<PortAllocator>,
        nbd: Arc<QemuNbdManager>,
        agent: AgentClient,
        config: &ServerConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            ports,
            nbd,
            agent,
            vcenter: config.vcenter.clone(),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Register interest in a job's terminal state. The receiver fires
    /// exactly once, when the parent reaches completed/failed/cancelled.
    /// The sender is registered before the terminal re-check, so a job that
    /// finishes while the caller subscribes still fires.
    pub async fn subscribe(&self, job_id: &str) -> oneshot::Receiver<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        self.watchers
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .push(tx);

        if let Ok(Some(job)) = queries::backup::get_job(&self.pool, job_id).await {
            if matches!(job.status.as_str(), "completed" | "failed" | "cancelled") {
                self.notify_watchers(&JobOutcome {
                    job_id: job.id,
                    status: job.status,
                    bytes_transferred: job.transferred_bytes,
                });
            }
        }

        rx
    }

    fn notify_watchers(&self, outcome: &JobOutcome) {
        let senders = self.watchers.lock().remove(&outcome.job_id);
        if let Some(senders) = senders {
            for sender in senders {
                let _ = sender.send(outcome.clone());
            }
        }
    }

    /// Start a backup of `vm_name` into `repository_id`.
    ///
    /// Resolves the VM and its disks, ensures the backup context, allocates
    /// a port + QCOW2 + qemu-nbd server per disk, then hands the job to the
    /// capture agent. Any per-disk setup failure unwinds every resource
    /// already allocated for this job and fails the parent.
    pub async fn start_backup(
        &self,
        vm_name: &str,
        repository_id: &str,
        backup_type: &str,
        policy_id: Option<&str>,
    ) -> Result<BackupJob, OrchestratorError> {
        if backup_type != "full" && backup_type != "incremental" {
            return Err(OrchestratorError::InvalidBackupType(backup_type.to_string()));
        }

        // Step 1: resolve the VM and its disk layout
        let vm = queries::vm::get_vm_by_name(&self.pool, vm_name)
            .await?
            .ok_or_else(|| OrchestratorError::VmNotFound(vm_name.to_string()))?;

        let disks = queries::vm::list_vm_disks(&self.pool, &vm.id).await?;
        if disks.is_empty() {
            return Err(OrchestratorError::VmHasNoDisks(vm_name.to_string()));
        }

        let repository = self
            .registry
            .get(repository_id)
            .ok_or_else(|| OrchestratorError::RepositoryNotFound(repository_id.to_string()))?;

        // Step 2: get-or-create the (vm, repository) context
        let context = queries::context::ensure_context(
            &self.pool,
            vm_name,
            repository_id,
            &vm.vmware_moref,
            &vm.vmware_path,
            &vm.vcenter_host,
            &vm.datacenter,
        )
        .await?;

        // Step 3: chain state per disk; incrementals fail fast when any
        // disk has no completed parent, before any resource is allocated
        let mut parents: HashMap<i32, BackupDisk> = HashMap::new();
        if backup_type == "incremental" {
            for disk in &disks {
                let parent = queries::backup::latest_completed_disk(
                    &self.pool,
                    &context.id,
                    disk.disk_index,
                )
                .await?
                .ok_or_else(|| OrchestratorError::NoParentForIncremental {
                    vm_name: vm_name.to_string(),
                    disk_index: disk.disk_index,
                })?;
                parents.insert(disk.disk_index, parent);
            }
        }

        let job_id = format!("bkp-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let now = Utc::now();
        let total_bytes: i64 = disks.iter().map(|d| d.size_bytes).sum();

        let job = BackupJob {
            id: job_id.clone(),
            context_id: context.id.clone(),
            vm_name: vm_name.to_string(),
            repository_id: repository_id.to_string(),
            backup_type: backup_type.to_string(),
            status: "pending".to_string(),
            policy_id: policy_id.map(str::to_string),
            total_bytes,
            transferred_bytes: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        queries::backup::create_job(&self.pool, &job).await?;

        // Step 4: per-disk resources, unwinding on first failure
        let mut setups: Vec<DiskSetup> = Vec::with_capacity(disks.len());
        for disk in &disks {
            let result = self
                .setup_disk(
                    &job_id,
                    &context.id,
                    vm_name,
                    repository.as_ref(),
                    backup_type,
                    disk.disk_index,
                    disk.vmware_disk_key,
                    disk.size_bytes,
                    parents.get(&disk.disk_index),
                )
                .await;

            match result {
                Ok(setup) => setups.push(setup),
                Err(e) => {
                    error!(
                        "job {}: disk {} setup failed ({}), unwinding {} prepared disks",
                        job_id,
                        disk.disk_index,
                        e,
                        setups.len()
                    );
                    self.unwind_setups(&job_id, &setups, true).await;
                    if queries::backup::finish_job(
                        &self.pool,
                        &job_id,
                        "failed",
                        0,
                        Some(&e.to_string()),
                    )
                    .await?
                    {
                        queries::context::record_job_outcome(
                            &self.pool,
                            &context.id,
                            &job_id,
                            false,
                        )
                        .await?;
                    }
                    return Err(e);
                }
            }
        }

        // Step 5: hand the job to the capture agent
        let targets: Vec<(i32, u16, String)> = setups
            .iter()
            .map(|s| (s.vmware_disk_key, s.port, s.export_name.clone()))
            .collect();
        let nbd_targets = build_nbd_targets(&targets);

        // multi-disk incrementals: the agent fetches per-disk change IDs
        // from the changeid endpoint; the inline field covers disk zero
        let previous_change_id = if backup_type == "incremental" {
            Some(
                changeid::get_previous_change_id(&self.pool, vm_name, 0)
                    .await
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        let request = BackupStartRequest {
            job_id: job_id.clone(),
            vm_name: vm_name.to_string(),
            vcenter_host: self.vcenter.host.clone(),
            vcenter_user: self.vcenter.username.clone(),
            vcenter_password: self.vcenter.password_ref.clone(),
            vm_path: vm.vmware_path.clone(),
            nbd_targets,
            backup_type: backup_type.to_string(),
            previous_change_id,
        };

        if let Err(e) = self.agent.start_backup(&request).await {
            error!("job {}: capture agent submission failed: {}", job_id, e);
            self.unwind_setups(&job_id, &setups, true).await;
            if queries::backup::finish_job(&self.pool, &job_id, "failed", 0, Some(&e.to_string()))
                .await?
            {
                queries::context::record_job_outcome(&self.pool, &context.id, &job_id, false)
                    .await?;
            }
            return Err(e.into());
        }

        queries::backup::set_job_running(&self.pool, &job_id).await?;
        for setup in &setups {
            queries::backup::set_disk_running(&self.pool, &job_id, setup.disk_index).await?;
        }

        info!(
            "job {}: {} backup of {} started ({} disks, {} bytes)",
            job_id,
            backup_type,
            vm_name,
            setups.len(),
            total_bytes
        );

        queries::backup::get_job(&self.pool, &job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn setup_disk(
        &self,
        job_id: &str,
        context_id: &str,
        vm_name: &str,
        repository: &dyn crate::repository::Repository,
        backup_type: &str,
        disk_index: i32,
        vmware_disk_key: i32,
        size_bytes: i64,
        parent: Option<&BackupDisk>,
    ) -> Result<DiskSetup, OrchestratorError> {
        let owner_key = port_owner_key(job_id, disk_index);
        let port = self.ports.allocate(&owner_key)?;

        let now = Utc::now();
        let created = match repository
            .create_backup(&CreateBackupRequest {
                context_id: context_id.to_string(),
                vm_name: vm_name.to_string(),
                disk_index,
                backup_type: backup_type.to_string(),
                size_bytes: size_bytes as u64,
                parent_backup_id: parent.map(|p| p.id.clone()),
                timestamp: now,
            })
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.ports.release(&owner_key);
                return Err(e.into());
            }
        };

        let export_name = export::export_name(context_id, disk_index, backup_type, now);
        if let Err(e) = self.nbd.start(&created.qcow2_path, port, &export_name) {
            self.ports.release(&owner_key);
            let _ = std::fs::remove_file(&created.qcow2_path);
            return Err(e.into());
        }

        let disk_row = BackupDisk {
            id: format!("{}-disk{}", job_id, disk_index),
            job_id: job_id.to_string(),
            context_id: context_id.to_string(),
            disk_index,
            vmware_disk_key,
            size_bytes,
            qcow2_path: created.qcow2_path.to_string_lossy().to_string(),
            parent_qcow2_path: created
                .parent_qcow2_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            nbd_port: Some(port as i32),
            export_name: Some(export_name.clone()),
            change_id: None,
            bytes_transferred: 0,
            progress_percent: 0.0,
            phase: None,
            status: "pending".to_string(),
            immutable_set: false,
            error_message: None,
            created_at: now,
            completed_at: None,
        };

        if let Err(e) = queries::backup::create_disk(&self.pool, &disk_row).await {
            self.nbd.stop(port).await;
            self.ports.release(&owner_key);
            let _ = std::fs::remove_file(&created.qcow2_path);
            return Err(e.into());
        }

        Ok(DiskSetup {
            disk_index,
            vmware_disk_key,
            port,
            export_name,
            qcow2_path: created.qcow2_path,
        })
    }

    /// Tear down everything a partially built job allocated: qemu-nbd
    /// servers, ports, and (when `delete_files`) the QCOW2 targets.
    async fn unwind_setups(&self, job_id: &str, setups: &[DiskSetup], delete_files: bool) {
        for setup in setups {
            self.nbd.stop(setup.port).await;
            self.ports.release(&port_owner_key(job_id, setup.disk_index));

            if delete_files {
                if let Err(e) = std::fs::remove_file(&setup.qcow2_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "job {}: removing {} failed: {}",
                            job_id,
                            setup.qcow2_path.display(),
                            e
                        );
                    }
                }
            }

            if let Err(e) =
                queries::backup::fail_disk(&self.pool, job_id, setup.disk_index, "setup unwound")
                    .await
            {
                error!("job {}: marking disk {} failed: {}", job_id, setup.disk_index, e);
            }
        }
    }

    /// Advisory telemetry from the agent, keyed by (job_id, disk_index).
    pub async fn record_progress(
        &self,
        job_id: &str,
        disk_index: i32,
        bytes_transferred: i64,
        percent: f64,
        phase: &str,
    ) -> Result<(), OrchestratorError> {
        let disk = queries::backup::get_disk(&self.pool, job_id, disk_index)
            .await?
            .ok_or_else(|| OrchestratorError::DiskNotFound {
                job_id: job_id.to_string(),
                disk_index,
            })?;

        // telemetry is advisory; never regress a terminal disk
        if disk.status == "completed" || disk.status == "failed" {
            return Ok(());
        }

        queries::backup::update_disk_progress(
            &self.pool,
            job_id,
            disk_index,
            bytes_transferred,
            percent,
            phase,
        )
        .await?;
        Ok(())
    }

    /// Per-disk completion callback. Records the change ID and transferred
    /// bytes, releases the disk's data-plane resources, and completes the
    /// parent when this was the last disk.
    pub async fn complete_disk(
        &self,
        job_id: &str,
        disk_index: i32,
        change_id: &str,
        bytes_transferred: i64,
    ) -> Result<(), OrchestratorError> {
        let disk = queries::backup::get_disk(&self.pool, job_id, disk_index)
            .await?
            .ok_or_else(|| OrchestratorError::DiskNotFound {
                job_id: job_id.to_string(),
                disk_index,
            })?;

        if disk.status == "completed" {
            // duplicate delivery of the completion callback
            return Ok(());
        }

        queries::backup::complete_disk(&self.pool, job_id, disk_index, change_id, bytes_transferred)
            .await?;

        if let Some(port) = disk.nbd_port {
            self.nbd.stop(port as u16).await;
        }
        self.ports.release(&port_owner_key(job_id, disk_index));

        info!(
            "job {}: disk {} completed, change_id={}, {} bytes",
            job_id, disk_index, change_id, bytes_transferred
        );

        self.try_finish_job(job_id).await
    }

    /// Agent-reported per-disk failure. The disk's QCOW2 stays on disk for
    /// diagnosis; the parent fails and every live server of the job stops.
    pub async fn report_disk_failure(
        &self,
        job_id: &str,
        disk_index: i32,
        error_message: &str,
    ) -> Result<(), OrchestratorError> {
        let job = queries::backup::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

        queries::backup::fail_disk(&self.pool, job_id, disk_index, error_message).await?;

        let disks = queries::backup::list_disks(&self.pool, job_id).await?;
        for disk in &disks {
            if let Some(port) = disk.nbd_port {
                self.nbd.stop(port as u16).await;
            }
            self.ports.release(&port_owner_key(job_id, disk.disk_index));
        }

        let aggregate = queries::backup::disk_aggregate(&self.pool, job_id).await?;
        let won = queries::backup::finish_job(
            &self.pool,
            job_id,
            "failed",
            aggregate.bytes_transferred,
            Some(error_message),
        )
        .await?;
        if !won {
            return Ok(());
        }

        queries::context::record_job_outcome(&self.pool, &job.context_id, job_id, false).await?;

        self.notify_watchers(&JobOutcome {
            job_id: job_id.to_string(),
            status: "failed".to_string(),
            bytes_transferred: aggregate.bytes_transferred,
        });

        Ok(())
    }

    /// Finish the parent once every disk is completed. The last two disks of
    /// a job can complete concurrently and both callers reach the aggregate
    /// check; the guarded terminal UPDATE decides a single winner, and only
    /// the winner rolls context counters, enqueues copies and notifies
    /// watchers.
    async fn try_finish_job(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = queries::backup::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

        if job.status != "running" && job.status != "pending" {
            return Ok(());
        }

        let aggregate = queries::backup::disk_aggregate(&self.pool, job_id).await?;
        if aggregate.completed < aggregate.total {
            return Ok(());
        }

        let won = queries::backup::finish_job(
            &self.pool,
            job_id,
            "completed",
            aggregate.bytes_transferred,
            None,
        )
        .await?;
        if !won {
            return Ok(());
        }

        queries::context::record_job_outcome(&self.pool, &job.context_id, job_id, true).await?;

        info!(
            "job {}: all {} disks completed ({} bytes transferred)",
            job_id, aggregate.total, aggregate.bytes_transferred
        );

        self.materialize_copy_rules(&job).await?;

        self.notify_watchers(&JobOutcome {
            job_id: job_id.to_string(),
            status: "completed".to_string(),
            bytes_transferred: aggregate.bytes_transferred,
        });

        Ok(())
    }

    /// One copy row per enabled immediate rule of the job's policy, ordered
    /// by rule priority. The copy engine picks them up from the queue.
    async fn materialize_copy_rules(&self, job: &BackupJob) -> Result<(), OrchestratorError> {
        let Some(policy_id) = job.policy_id.as_deref() else {
            return Ok(());
        };

        let rules = queries::policy::list_enabled_rules(&self.pool, policy_id).await?;
        for rule in rules.iter().filter(|r| r.mode == "immediate") {
            let copy = BackupCopy {
                id: format!("copy-{}", &Uuid::new_v4().simple().to_string()[..12]),
                source_backup_id: job.id.clone(),
                destination_repository_id: rule.destination_repository_id.clone(),
                rule_id: rule.id.clone(),
                status: "pending".to_string(),
                priority: rule.priority,
                verify_after_copy: rule.verify_after_copy,
                destination_path: None,
                verified: false,
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            };
            queries::copy::enqueue(&self.pool, &copy).await?;
            info!(
                "job {}: enqueued copy to repository {} (priority {})",
                job.id, rule.destination_repository_id, rule.priority
            );
        }

        Ok(())
    }

    /// Administrative cancel: mark the parent cancelled, stop the job's
    /// qemu-nbd servers, release its ports and tell the agent (best effort).
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = queries::backup::get_job(&self.pool, job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;

        if job.status != "running" && job.status != "pending" {
            return Ok(());
        }

        self.agent.cancel_backup(job_id).await;

        let disks = queries::backup::list_disks(&self.pool, job_id).await?;
        for disk in &disks {
            if let Some(port) = disk.nbd_port {
                self.nbd.stop(port as u16).await;
            }
            self.ports.release(&port_owner_key(job_id, disk.disk_index));
        }

        let aggregate = queries::backup::disk_aggregate(&self.pool, job_id).await?;
        let won = queries::backup::finish_job(
            &self.pool,
            job_id,
            "cancelled",
            aggregate.bytes_transferred,
            Some("cancelled by operator"),
        )
        .await?;
        if !won {
            return Ok(());
        }

        queries::context::record_job_outcome(&self.pool, &job.context_id, job_id, false).await?;

        self.notify_watchers(&JobOutcome {
            job_id: job_id.to_string(),
            status: "cancelled".to_string(),
            bytes_transferred: aggregate.bytes_transferred,
        });

        Ok(())
    }

    /// Startup reconciliation. Jobs still marked running belonged to a
    /// previous process, and their qemu-nbd servers and port reservations
    /// died with it. A job whose completion callbacks all landed before the
    /// crash is finished as completed; the rest cannot make progress on a
    /// dead data plane, so a reachable agent is told to abort the job before
    /// it is failed, and an unreachable agent leaves the job failed as
    /// indeterminate. Returns the number of jobs failed.
    pub async fn reconcile(&self) -> Result<usize, OrchestratorError> {
        let running = queries::backup::list_running_jobs(&self.pool).await?;
        if running.is_empty() {
            return Ok(0);
        }

        let agent_alive = self.agent.is_reachable().await;
        if !agent_alive {
            warn!("capture agent unreachable during reconciliation");
        }

        let reason = if agent_alive {
            "control plane restarted during backup; capture agent told to abort"
        } else {
            "control plane restarted during backup; capture agent unreachable, outcome indeterminate"
        };

        let mut failed = 0;
        for job in running {
            let aggregate = queries::backup::disk_aggregate(&self.pool, &job.id).await?;
            if aggregate.total > 0 && aggregate.completed == aggregate.total {
                // every per-disk callback landed before the crash; only the
                // parent finalization was lost
                info!("job {}: all disks completed before restart, finishing", job.id);
                self.try_finish_job(&job.id).await?;
                continue;
            }

            if agent_alive {
                self.agent.cancel_backup(&job.id).await;
            }

            let disks = queries::backup::list_disks(&self.pool, &job.id).await?;
            for disk in &disks {
                if disk.status == "pending" || disk.status == "running" {
                    queries::backup::fail_disk(&self.pool, &job.id, disk.disk_index, reason)
                        .await?;
                }
            }

            let aggregate = queries::backup::disk_aggregate(&self.pool, &job.id).await?;
            if queries::backup::finish_job(
                &self.pool,
                &job.id,
                "failed",
                aggregate.bytes_transferred,
                Some(reason),
            )
            .await?
            {
                queries::context::record_job_outcome(&self.pool, &job.context_id, &job.id, false)
                    .await?;
            }
            failed += 1;
        }

        warn!("reconciliation failed {} interrupted jobs", failed);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nbd_target_string_format() {
        let targets = vec![
            (2000, 10100, "backup-ctx-a-disk0-full-20250601T000000".to_string()),
            (2001, 10101, "backup-ctx-a-disk1-full-20250601T000000".to_string()),
        ];
        assert_eq!(
            build_nbd_targets(&targets),
            "2000:nbd://127.0.0.1:10100/backup-ctx-a-disk0-full-20250601T000000,\
             2001:nbd://127.0.0.1:10101/backup-ctx-a-disk1-full-20250601T000000"
        );
    }

    #[test]
    fn single_disk_target_has_no_separator() {
        let targets = vec![(2000, 10100, "e".to_string())];
        assert_eq!(build_nbd_targets(&targets), "2000:nbd://127.0.0.1:10100/e");
    }

    #[test]
    fn owner_keys_are_unique_per_disk() {
        assert_ne!(port_owner_key("bkp-1", 0), port_owner_key("bkp-1", 1));
        assert_ne!(port_owner_key("bkp-1", 0), port_owner_key("bkp-2", 0));
    }
}
