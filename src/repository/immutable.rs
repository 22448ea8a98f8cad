// repository/immutable.rs
//
// Immutability wrapper. Composes any repository: creates delegate straight
// through, deletes are gated on the minimum retention age, and a background
// worker sets the filesystem immutable flag on backups whose grace period
// has elapsed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use sqlx::{MySql, Pool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{CreateBackupRequest, CreatedBackup, Repository, RepositoryError, StorageInfo};
use crate::db::queries;
use crate::db::tables::BackupDisk;
use crate::tools;

pub struct ImmutableRepository {
    inner: Arc<dyn Repository>,
    min_retention_days: i64,
    tool_timeout: Duration,
}

impl ImmutableRepository {
    pub fn new(inner: Arc<dyn Repository>, min_retention_days: i64, tool_timeout: Duration) -> Self {
        Self {
            inner,
            min_retention_days,
            tool_timeout,
        }
    }
}

/// Whether a backup born at `created` may be deleted at `now` under a
/// `min_retention_days` floor.
pub fn retention_met(created: DateTime<Utc>, now: DateTime<Utc>, min_retention_days: i64) -> bool {
    (now - created).num_days() >= min_retention_days
}

pub async fn set_immutable(path: &Path, timeout: Duration) -> Result<(), RepositoryError> {
    let path_str = path.to_string_lossy();
    tools::run("chattr", &["+i", &path_str], timeout).await?;
    Ok(())
}

pub async fn clear_immutable(path: &Path, timeout: Duration) -> Result<(), RepositoryError> {
    let path_str = path.to_string_lossy();
    tools::run("chattr", &["-i", &path_str], timeout).await?;
    Ok(())
}

#[async_trait]
impl Repository for ImmutableRepository {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn base_path(&self) -> PathBuf {
        self.inner.base_path()
    }

    async fn ensure_ready(&self) -> Result<(), RepositoryError> {
        self.inner.ensure_ready().await
    }

    async fn create_backup(
        &self,
        req: &CreateBackupRequest,
    ) -> Result<CreatedBackup, RepositoryError> {
        // the grace clock starts from the disk row's completion time; the
        // sweep below picks the file up once the period elapses
        self.inner.create_backup(req).await
    }

    async fn get_backup(
        &self,
        backup_disk_id: &str,
    ) -> Result<Option<BackupDisk>, RepositoryError> {
        self.inner.get_backup(backup_disk_id).await
    }

    async fn list_backups(
        &self,
        context_id: Option<&str>,
    ) -> Result<Vec<BackupDisk>, RepositoryError> {
        self.inner.list_backups(context_id).await
    }

    async fn delete_backup(&self, backup_disk_id: &str) -> Result<(), RepositoryError> {
        let disk = self
            .inner
            .get_backup(backup_disk_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(backup_disk_id.to_string()))?;

        let born = disk.completed_at.unwrap_or(disk.created_at);
        let now = Utc::now();
        if !retention_met(born, now, self.min_retention_days) {
            return Err(RepositoryError::RetentionNotMet {
                age_days: (now - born).num_days(),
                required_days: self.min_retention_days,
            });
        }

        if disk.immutable_set {
            let path = PathBuf::from(&disk.qcow2_path);
            if path.exists() {
                clear_immutable(&path, self.tool_timeout).await?;
            }
        }

        self.inner.delete_backup(backup_disk_id).await
    }

    async fn get_backup_chain(
        &self,
        context_id: &str,
        disk_index: i32,
    ) -> Result<Vec<BackupDisk>, RepositoryError> {
        self.inner.get_backup_chain(context_id, disk_index).await
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        self.inner.storage_info().await
    }
}

/// One sweep: flag every completed backup past its repository's grace
/// period. Returns how many files were flagged.
pub async fn sweep_once(pool: &Pool<MySql>, tool_timeout: Duration) -> anyhow::Result<usize> {
    let repositories = queries::repository::list_repositories(pool).await?;
    let mut flagged = 0;

    for repo in repositories
        .iter()
        .filter(|r| r.immutability_enabled)
    {
        let pending = queries::backup::list_disks_awaiting_immutability(
            pool,
            &repo.id,
            repo.grace_period_hours,
        )
        .await?;

        for disk in pending {
            let path = PathBuf::from(&disk.qcow2_path);
            if !path.exists() {
                warn!(
                    "immutability sweep: {} missing on disk, skipping",
                    disk.qcow2_path
                );
                continue;
            }

            match set_immutable(&path, tool_timeout).await {
                Ok(()) => {
                    queries::backup::mark_disk_immutable(pool, &disk.id).await?;
                    flagged += 1;
                    info!("set immutable flag on {}", disk.qcow2_path);
                }
                Err(e) => {
                    error!("chattr +i {}: {}", disk.qcow2_path, e);
                }
            }
        }
    }

    Ok(flagged)
}

/// Background worker flagging backups after their grace period.
pub fn spawn_immutability_worker(
    pool: Pool<MySql>,
    interval: Duration,
    tool_timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sweep_once(&pool, tool_timeout).await {
                Ok(0) => {}
                Ok(n) => info!("immutability sweep flagged {} backup files", n),
                Err(e) => error!("immutability sweep failed: {:#}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retention_boundaries() {
        let born = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        // 2 days old against a 7-day floor
        let now = Utc.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap();
        assert!(!retention_met(born, now, 7));

        // 8 days old against a 7-day floor
        let now = Utc.with_ymd_and_hms(2025, 1, 9, 0, 0, 0).unwrap();
        assert!(retention_met(born, now, 7));

        // exactly at the floor counts as met
        let now = Utc.with_ymd_and_hms(2025, 1, 8, 0, 0, 0).unwrap();
        assert!(retention_met(born, now, 7));
    }

    #[test]
    fn zero_retention_always_met() {
        let born = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert!(retention_met(born, born, 0));
    }
}
