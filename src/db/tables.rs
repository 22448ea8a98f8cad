use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable per-(VM, repository) anchor owning the chain of backup jobs.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmContext {
    pub id: String,
    pub vm_name: String,
    pub vmware_moref: String,
    pub vmware_path: String,
    pub vcenter_host: String,
    pub datacenter: String,
    pub repository_id: String,
    pub total_backups: i64,
    pub successful_backups: i64,
    pub failed_backups: i64,
    pub last_backup_id: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Parent record for one orchestration of a multi-disk VM snapshot.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub context_id: String,
    pub vm_name: String,
    pub repository_id: String,
    pub backup_type: String, // enum: 'full', 'incremental'
    pub status: String, // enum: 'pending', 'running', 'completed', 'failed', 'cancelled'
    pub policy_id: Option<String>,
    pub total_bytes: i64,
    pub transferred_bytes: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One VMware disk within a backup job. `(job_id, disk_index)` is unique and
/// is the only key per-disk callbacks are matched on.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupDisk {
    pub id: String,
    pub job_id: String,
    pub context_id: String,
    pub disk_index: i32,
    pub vmware_disk_key: i32,
    pub size_bytes: i64,
    pub qcow2_path: String,
    pub parent_qcow2_path: Option<String>,
    pub nbd_port: Option<i32>,
    pub export_name: Option<String>,
    pub change_id: Option<String>,
    pub bytes_transferred: i64,
    pub progress_percent: f64,
    pub phase: Option<String>,
    pub status: String, // enum: 'pending', 'running', 'completed', 'failed'
    pub immutable_set: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Backup store descriptor. Network variants carry their mount coordinates;
/// immutability settings turn the store into a wrapped repository at
/// registration time.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: String,
    pub name: String,
    pub kind: String, // enum: 'local', 'nfs', 'cifs'
    pub base_path: String,
    pub server: Option<String>,
    pub export_path: Option<String>,
    pub mount_options: Option<String>,
    pub nfs_version: Option<String>,
    pub cifs_username: Option<String>,
    pub cifs_password_ref: Option<String>,
    pub immutability_enabled: bool,
    pub min_retention_days: i32,
    pub grace_period_hours: i32,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: String,
    pub name: String,
    pub retention_days: i32,
    pub primary_repository_id: String,
    pub created_at: DateTime<Utc>,
}

/// Ordered replication rule of a backup policy.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct CopyRule {
    pub id: String,
    pub policy_id: String,
    pub destination_repository_id: String,
    pub mode: String, // enum: 'immediate', 'scheduled', 'manual'
    pub priority: i32,
    pub verify_after_copy: bool,
    pub enabled: bool,
}

/// One rule application per source backup; `(source_backup_id,
/// destination_repository_id)` is unique.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupCopy {
    pub id: String,
    pub source_backup_id: String,
    pub destination_repository_id: String,
    pub rule_id: String,
    pub status: String, // enum: 'pending', 'copying', 'verifying', 'completed', 'failed'
    pub priority: i32,
    pub verify_after_copy: bool,
    pub destination_path: Option<String>,
    pub verified: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ProtectionFlow {
    pub id: String,
    pub name: String,
    pub flow_type: String, // enum: 'backup', 'replication'
    pub target_type: String, // enum: 'vm', 'group'
    pub target_id: String,
    pub repository_id: Option<String>,
    pub policy_id: Option<String>,
    pub schedule_id: Option<String>,
    pub enabled: bool,
    pub last_execution_id: Option<String>,
    pub last_execution_status: Option<String>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: String,
    pub flow_id: String,
    pub status: String, // enum: 'pending', 'running', 'success', 'warning', 'error', 'cancelled', 'skipped'
    pub trigger_source: String, // enum: 'scheduled', 'manual', 'api'
    pub jobs_created: i32,
    pub jobs_completed: i32,
    pub jobs_failed: i32,
    pub jobs_skipped: i32,
    pub vms_processed: i32,
    pub bytes_transferred: i64,
    pub backup_job_ids: String, // JSON array of spawned job IDs
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmGroup {
    pub id: String,
    pub name: String,
    pub max_concurrent_vms: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmGroupMember {
    pub group_id: String,
    pub vm_name: String,
    pub position: i32,
    pub enabled: bool,
}

/// Active file-level restore attachment of one completed backup disk.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RestoreMount {
    pub id: String,
    pub backup_disk_id: String,
    pub backup_job_id: String,
    pub disk_index: i32,
    pub qcow2_path: String,
    pub nbd_device: String,
    pub mount_base: String,
    pub partition_metadata: Option<String>, // JSON array of mounted partitions
    pub status: String, // enum: 'mounting', 'mounted', 'unmounting', 'unmounted', 'failed'
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// VM inventory row from the configuration store.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    pub vmware_moref: String,
    pub vmware_path: String,
    pub vcenter_host: String,
    pub datacenter: String,
}

/// Disk layout of an inventory VM; `disk_index` is dense from zero.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmDisk {
    pub vm_id: String,
    pub disk_index: i32,
    pub vmware_disk_key: i32,
    pub size_bytes: i64,
}
