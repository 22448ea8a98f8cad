// repository/mod.rs
//
// Pluggable backup stores. A repository is a capability set over one
// storage target; Local, NFS and CIFS share the same backing-store
// implementation and differ only in how the target becomes reachable.
// Immutability is a wrapper repository, composed at registration time.

pub mod immutable;
pub mod mounts;
pub mod registry;
pub mod store;

pub use immutable::ImmutableRepository;
pub use mounts::MountManager;
pub use registry::RepositoryRegistry;
pub use store::BackingStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::tables::BackupDisk;
use crate::qcow2::Qcow2Error;
use crate::tools::ToolError;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("backup not found: {0}")]
    NotFound(String),

    #[error("incremental backup requires a parent backup id")]
    ParentBackupRequired,

    #[error("parent backup not found: {0}")]
    ParentNotFound(String),

    #[error("backup {0} still has dependent incrementals and cannot be deleted")]
    ChainBroken(String),

    #[error("backup is {age_days} days old; repository retention requires {required_days}")]
    RetentionNotMet { age_days: i64, required_days: i64 },

    #[error("failed to mount repository: {0}")]
    MountFailed(String),

    #[error("repository busy: {0}")]
    Busy(String),

    #[error(transparent)]
    Qcow2(#[from] Qcow2Error),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request to materialize one per-disk backup target file.
#[derive(Debug, Clone)]
pub struct CreateBackupRequest {
    pub context_id: String,
    pub vm_name: String,
    pub disk_index: i32,
    pub backup_type: String,
    pub size_bytes: u64,
    pub parent_backup_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Result of a create: where the QCOW2 landed and what backs it.
#[derive(Debug, Clone)]
pub struct CreatedBackup {
    pub qcow2_path: PathBuf,
    pub parent_qcow2_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

/// Uniform contract over a backup store.
#[async_trait]
pub trait Repository: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> &str;

    fn base_path(&self) -> PathBuf;

    /// Make the store reachable (lazy-mount network targets, create the
    /// local base directory). Idempotent.
    async fn ensure_ready(&self) -> Result<(), RepositoryError>;

    /// Materialize the QCOW2 for one disk of a backup job.
    async fn create_backup(
        &self,
        req: &CreateBackupRequest,
    ) -> Result<CreatedBackup, RepositoryError>;

    async fn get_backup(
        &self,
        backup_disk_id: &str,
    ) -> Result<Option<BackupDisk>, RepositoryError>;

    async fn list_backups(
        &self,
        context_id: Option<&str>,
    ) -> Result<Vec<BackupDisk>, RepositoryError>;

    /// Delete one backup file. Refuses while dependent incrementals exist.
    async fn delete_backup(&self, backup_disk_id: &str) -> Result<(), RepositoryError>;

    /// The ordered `(full, incremental*)` lineage of one disk slot.
    async fn get_backup_chain(
        &self,
        context_id: &str,
        disk_index: i32,
    ) -> Result<Vec<BackupDisk>, RepositoryError>;

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError>;
}

/// Canonical on-disk layout:
/// `{base}/{context_id}/disk-{i}/backup-{vm}-disk{i}-{yyyymmdd-hhmmss}.qcow2`.
pub fn backup_file_path(
    base: &Path,
    context_id: &str,
    vm_name: &str,
    disk_index: i32,
    at: DateTime<Utc>,
) -> PathBuf {
    base.join(context_id)
        .join(format!("disk-{}", disk_index))
        .join(format!(
            "backup-{}-disk{}-{}.qcow2",
            vm_name,
            disk_index,
            at.format("%Y%m%d-%H%M%S")
        ))
}

/// Filesystem capacity of the volume holding `path`.
#[cfg(unix)]
pub fn filesystem_info(path: &Path) -> Result<StorageInfo, RepositoryError> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| RepositoryError::MountFailed(format!("statvfs {}: {}", path.display(), e)))?;

    let frsize = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * frsize;
    let available = stat.blocks_available() as u64 * frsize;
    let free = stat.blocks_free() as u64 * frsize;

    Ok(StorageInfo {
        total_bytes: total,
        used_bytes: total - free,
        available_bytes: available,
    })
}

#[cfg(not(unix))]
pub fn filesystem_info(_path: &Path) -> Result<StorageInfo, RepositoryError> {
    Ok(StorageInfo {
        total_bytes: 0,
        used_bytes: 0,
        available_bytes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backup_path_layout() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let path = backup_file_path(Path::new("/repo"), "ctx-1a2b3c", "pgtest1", 1, at);
        assert_eq!(
            path,
            PathBuf::from("/repo/ctx-1a2b3c/disk-1/backup-pgtest1-disk1-20250314-092653.qcow2")
        );
    }

    #[test]
    fn sibling_disks_land_in_distinct_directories() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let d0 = backup_file_path(Path::new("/repo"), "ctx-x", "vm", 0, at);
        let d1 = backup_file_path(Path::new("/repo"), "ctx-x", "vm", 1, at);
        assert_ne!(d0.parent(), d1.parent());
        assert!(d0.to_string_lossy().contains("/disk-0/"));
        assert!(d1.to_string_lossy().contains("/disk-1/"));
    }
}
