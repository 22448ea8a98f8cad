// repository/store.rs
//
// The shared backing-store implementation behind the Local, NFS and CIFS
// repository variants. Network kinds are lazily mounted through the mount
// manager; everything else is identical across the three.

use async_trait::async_trait;
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::mounts::{MountGuard, MountManager, MountSpec};
use super::{
    backup_file_path, filesystem_info, CreateBackupRequest, CreatedBackup, Repository,
    RepositoryError, StorageInfo,
};
use crate::db::queries;
use crate::db::tables::{BackupDisk, RepositoryRecord};
use crate::qcow2::ImageManager;

pub struct BackingStore {
    record: RepositoryRecord,
    pool: Pool<MySql>,
    images: ImageManager,
    mounts: Arc<MountManager>,
}

impl BackingStore {
    pub fn new(
        record: RepositoryRecord,
        pool: Pool<MySql>,
        setup_timeout: Duration,
        mounts: Arc<MountManager>,
    ) -> Self {
        Self {
            record,
            pool,
            images: ImageManager::new(setup_timeout),
            mounts,
        }
    }

    pub fn record(&self) -> &RepositoryRecord {
        &self.record
    }

    fn mount_spec(&self) -> Option<MountSpec> {
        match self.record.kind.as_str() {
            "nfs" => Some(MountSpec::Nfs {
                server: self.record.server.clone().unwrap_or_default(),
                export_path: self.record.export_path.clone().unwrap_or_default(),
                version: self
                    .record
                    .nfs_version
                    .clone()
                    .unwrap_or_else(|| "4".to_string()),
                options: self.record.mount_options.clone().unwrap_or_default(),
            }),
            "cifs" => Some(MountSpec::Cifs {
                server: self.record.server.clone().unwrap_or_default(),
                share: self.record.export_path.clone().unwrap_or_default(),
                username: self.record.cifs_username.clone().unwrap_or_default(),
                password_ref: self.record.cifs_password_ref.clone().unwrap_or_default(),
                options: self.record.mount_options.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Reachability guard for one operation. Network stores return a live
    /// mount reference, local stores just ensure the base directory.
    async fn ready(&self) -> Result<Option<MountGuard>, RepositoryError> {
        match self.mount_spec() {
            Some(spec) => {
                let guard = self
                    .mounts
                    .acquire(&self.record.id, &self.base_path(), &spec)
                    .await?;
                Ok(Some(guard))
            }
            None => {
                std::fs::create_dir_all(self.base_path())?;
                Ok(None)
            }
        }
    }

    /// A disk row belongs to this store when its owning job points here.
    async fn owned_disk(&self, backup_disk_id: &str) -> Result<Option<BackupDisk>, RepositoryError> {
        let Some(disk) = queries::backup::get_disk_by_id(&self.pool, backup_disk_id).await? else {
            return Ok(None);
        };

        let Some(job) = queries::backup::get_job(&self.pool, &disk.job_id).await? else {
            return Ok(None);
        };

        if job.repository_id != self.record.id {
            return Ok(None);
        }

        Ok(Some(disk))
    }
}

#[async_trait]
impl Repository for BackingStore {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn kind(&self) -> &str {
        &self.record.kind
    }

    fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.record.base_path)
    }

    async fn ensure_ready(&self) -> Result<(), RepositoryError> {
        let _guard = self.ready().await?;
        Ok(())
    }

    async fn create_backup(
        &self,
        req: &CreateBackupRequest,
    ) -> Result<CreatedBackup, RepositoryError> {
        let _guard = self.ready().await?;

        let path = backup_file_path(
            &self.base_path(),
            &req.context_id,
            &req.vm_name,
            req.disk_index,
            req.timestamp,
        );

        match req.backup_type.as_str() {
            "incremental" => {
                let parent_id = req
                    .parent_backup_id
                    .as_deref()
                    .ok_or(RepositoryError::ParentBackupRequired)?;

                let parent = self
                    .owned_disk(parent_id)
                    .await?
                    .ok_or_else(|| RepositoryError::ParentNotFound(parent_id.to_string()))?;

                let parent_path = PathBuf::from(&parent.qcow2_path);
                self.images.create_incremental(&path, &parent_path).await?;

                Ok(CreatedBackup {
                    qcow2_path: path,
                    parent_qcow2_path: Some(parent_path),
                })
            }
            _ => {
                self.images.create_full(&path, req.size_bytes).await?;
                Ok(CreatedBackup {
                    qcow2_path: path,
                    parent_qcow2_path: None,
                })
            }
        }
    }

    async fn get_backup(
        &self,
        backup_disk_id: &str,
    ) -> Result<Option<BackupDisk>, RepositoryError> {
        self.owned_disk(backup_disk_id).await
    }

    async fn list_backups(
        &self,
        context_id: Option<&str>,
    ) -> Result<Vec<BackupDisk>, RepositoryError> {
        let disks = sqlx::query_as::<_, BackupDisk>(
            "SELECT d.* FROM backup_disks d
             JOIN backup_jobs j ON d.job_id = j.id
             WHERE j.repository_id = ?
             ORDER BY d.created_at DESC",
        )
        .bind(&self.record.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(match context_id {
            Some(ctx) => disks.into_iter().filter(|d| d.context_id == ctx).collect(),
            None => disks,
        })
    }

    async fn delete_backup(&self, backup_disk_id: &str) -> Result<(), RepositoryError> {
        let disk = self
            .owned_disk(backup_disk_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(backup_disk_id.to_string()))?;

        let descendants = queries::backup::count_descendants(&self.pool, &disk.qcow2_path).await?;
        if descendants > 0 {
            return Err(RepositoryError::ChainBroken(disk.qcow2_path));
        }

        let _guard = self.ready().await?;

        let path = PathBuf::from(&disk.qcow2_path);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!("deleted backup file {}", path.display());
        } else {
            warn!("backup file {} already absent", path.display());
        }

        sqlx::query("DELETE FROM backup_disks WHERE id = ?")
            .bind(backup_disk_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_backup_chain(
        &self,
        context_id: &str,
        disk_index: i32,
    ) -> Result<Vec<BackupDisk>, RepositoryError> {
        Ok(queries::backup::backup_chain(&self.pool, context_id, disk_index).await?)
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        let _guard = self.ready().await?;
        let info = filesystem_info(&self.base_path())?;

        queries::repository::update_storage_info(
            &self.pool,
            &self.record.id,
            info.total_bytes as i64,
            info.used_bytes as i64,
            info.available_bytes as i64,
        )
        .await?;

        Ok(info)
    }
}
