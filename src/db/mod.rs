// db/mod.rs
//
// Database manager for the Palisade control plane: owns the MySQL pool and
// the idempotent schema bootstrap. Per-entity query modules live under
// `queries/`.

pub mod queries;
pub mod tables;

use log::{error, info};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, Pool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Schema initialization failed: {0}")]
    SchemaFailed(String),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

/// Central manager for the control-plane database.
pub struct DatabaseManager {
    pool: Pool<MySql>,
}

impl DatabaseManager {
    /// Connects to the database and ensures the schema is present.
    pub async fn new(connection_url: &str) -> Result<Self, DatabaseError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(16)
            .connect(connection_url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let manager = Self { pool };
        manager.initialize_schema().await?;

        Ok(manager)
    }

    /// Gets the connection pool.
    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Executes the embedded schema statements. Every statement is
    /// `CREATE TABLE IF NOT EXISTS`, so repeated startups are safe.
    pub async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        info!("Initializing control-plane schema ({} tables)", SCHEMA.len());

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    error!("Schema statement failed: {}", e);
                    DatabaseError::SchemaFailed(e.to_string())
                })?;
        }

        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS repositories (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        kind VARCHAR(16) NOT NULL,
        base_path VARCHAR(1024) NOT NULL,
        server VARCHAR(255) NULL,
        export_path VARCHAR(1024) NULL,
        mount_options VARCHAR(512) NULL,
        nfs_version VARCHAR(8) NULL,
        cifs_username VARCHAR(255) NULL,
        cifs_password_ref VARCHAR(255) NULL,
        immutability_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        min_retention_days INT NOT NULL DEFAULT 0,
        grace_period_hours INT NOT NULL DEFAULT 0,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        used_bytes BIGINT NOT NULL DEFAULT 0,
        available_bytes BIGINT NOT NULL DEFAULT 0,
        last_check_at TIMESTAMP NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vm_contexts (
        id VARCHAR(64) PRIMARY KEY,
        vm_name VARCHAR(255) NOT NULL,
        vmware_moref VARCHAR(255) NOT NULL,
        vmware_path VARCHAR(1024) NOT NULL,
        vcenter_host VARCHAR(255) NOT NULL,
        datacenter VARCHAR(255) NOT NULL,
        repository_id VARCHAR(64) NOT NULL,
        total_backups BIGINT NOT NULL DEFAULT 0,
        successful_backups BIGINT NOT NULL DEFAULT 0,
        failed_backups BIGINT NOT NULL DEFAULT 0,
        last_backup_id VARCHAR(64) NULL,
        last_backup_at TIMESTAMP NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE KEY uq_context_vm_repo (vm_name, repository_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_jobs (
        id VARCHAR(64) PRIMARY KEY,
        context_id VARCHAR(64) NOT NULL,
        vm_name VARCHAR(255) NOT NULL,
        repository_id VARCHAR(64) NOT NULL,
        backup_type VARCHAR(16) NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        policy_id VARCHAR(64) NULL,
        total_bytes BIGINT NOT NULL DEFAULT 0,
        transferred_bytes BIGINT NOT NULL DEFAULT 0,
        error_message TEXT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        started_at TIMESTAMP NULL,
        completed_at TIMESTAMP NULL,
        KEY idx_jobs_context (context_id),
        KEY idx_jobs_status (status)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_disks (
        id VARCHAR(96) PRIMARY KEY,
        job_id VARCHAR(64) NOT NULL,
        context_id VARCHAR(64) NOT NULL,
        disk_index INT NOT NULL,
        vmware_disk_key INT NOT NULL,
        size_bytes BIGINT NOT NULL,
        qcow2_path VARCHAR(1024) NOT NULL,
        parent_qcow2_path VARCHAR(1024) NULL,
        nbd_port INT NULL,
        export_name VARCHAR(64) NULL,
        change_id VARCHAR(255) NULL,
        bytes_transferred BIGINT NOT NULL DEFAULT 0,
        progress_percent DOUBLE NOT NULL DEFAULT 0,
        phase VARCHAR(32) NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        immutable_set BOOLEAN NOT NULL DEFAULT FALSE,
        error_message TEXT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        completed_at TIMESTAMP NULL,
        UNIQUE KEY uq_disk_job_index (job_id, disk_index),
        KEY idx_disks_context (context_id, disk_index)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_policies (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        retention_days INT NOT NULL DEFAULT 0,
        primary_repository_id VARCHAR(64) NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS copy_rules (
        id VARCHAR(64) PRIMARY KEY,
        policy_id VARCHAR(64) NOT NULL,
        destination_repository_id VARCHAR(64) NOT NULL,
        mode VARCHAR(16) NOT NULL DEFAULT 'immediate',
        priority INT NOT NULL DEFAULT 0,
        verify_after_copy BOOLEAN NOT NULL DEFAULT TRUE,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        KEY idx_rules_policy (policy_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS backup_copies (
        id VARCHAR(64) PRIMARY KEY,
        source_backup_id VARCHAR(64) NOT NULL,
        destination_repository_id VARCHAR(64) NOT NULL,
        rule_id VARCHAR(64) NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        priority INT NOT NULL DEFAULT 0,
        verify_after_copy BOOLEAN NOT NULL DEFAULT TRUE,
        destination_path VARCHAR(1024) NULL,
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        error_message TEXT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        started_at TIMESTAMP NULL,
        completed_at TIMESTAMP NULL,
        UNIQUE KEY uq_copy_source_dest (source_backup_id, destination_repository_id),
        KEY idx_copies_status (status)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS protection_flows (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        flow_type VARCHAR(16) NOT NULL,
        target_type VARCHAR(8) NOT NULL,
        target_id VARCHAR(255) NOT NULL,
        repository_id VARCHAR(64) NULL,
        policy_id VARCHAR(64) NULL,
        schedule_id VARCHAR(64) NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        last_execution_id VARCHAR(64) NULL,
        last_execution_status VARCHAR(16) NULL,
        last_execution_at TIMESTAMP NULL,
        next_execution_at TIMESTAMP NULL,
        total_executions BIGINT NOT NULL DEFAULT 0,
        successful_executions BIGINT NOT NULL DEFAULT 0,
        failed_executions BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS flow_executions (
        id VARCHAR(64) PRIMARY KEY,
        flow_id VARCHAR(64) NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        trigger_source VARCHAR(16) NOT NULL,
        jobs_created INT NOT NULL DEFAULT 0,
        jobs_completed INT NOT NULL DEFAULT 0,
        jobs_failed INT NOT NULL DEFAULT 0,
        jobs_skipped INT NOT NULL DEFAULT 0,
        vms_processed INT NOT NULL DEFAULT 0,
        bytes_transferred BIGINT NOT NULL DEFAULT 0,
        backup_job_ids TEXT NOT NULL,
        error_message TEXT NULL,
        started_at TIMESTAMP NULL,
        completed_at TIMESTAMP NULL,
        execution_time_seconds BIGINT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        KEY idx_executions_flow (flow_id, created_at)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS schedules (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        cron_expression VARCHAR(255) NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vm_groups (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        max_concurrent_vms INT NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vm_group_members (
        group_id VARCHAR(64) NOT NULL,
        vm_name VARCHAR(255) NOT NULL,
        position INT NOT NULL DEFAULT 0,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        PRIMARY KEY (group_id, vm_name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS restore_mounts (
        id VARCHAR(64) PRIMARY KEY,
        backup_disk_id VARCHAR(96) NOT NULL,
        backup_job_id VARCHAR(64) NOT NULL,
        disk_index INT NOT NULL,
        qcow2_path VARCHAR(1024) NOT NULL,
        nbd_device VARCHAR(32) NOT NULL,
        mount_base VARCHAR(1024) NOT NULL,
        partition_metadata TEXT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'mounting',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_accessed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        expires_at TIMESTAMP NOT NULL,
        KEY idx_mounts_status (status),
        KEY idx_mounts_disk (backup_disk_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vms (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        vmware_moref VARCHAR(255) NOT NULL,
        vmware_path VARCHAR(1024) NOT NULL,
        vcenter_host VARCHAR(255) NOT NULL,
        datacenter VARCHAR(255) NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vm_disks (
        vm_id VARCHAR(64) NOT NULL,
        disk_index INT NOT NULL,
        vmware_disk_key INT NOT NULL,
        size_bytes BIGINT NOT NULL,
        PRIMARY KEY (vm_id, disk_index)
    )"#,
];
