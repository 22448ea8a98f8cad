// restore/mod.rs
//
// File-level restore engine. A completed backup disk is attached read-only
// through an NBD client device, every mountable partition is mounted under
// the mount's base directory, and the browse/download API works against
// those mounts until the idle window expires.

pub mod archive;
pub mod browse;
pub mod partitions;

use chrono::{Duration as ChronoDuration, Utc};
use log::{error, info, warn};
use parking_lot::Mutex;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::db::queries;
use crate::db::tables::RestoreMount;
use crate::nbd::{client, DevicePool, NbdError};
use crate::tools::{self, ToolError};
use self::browse::FileEntry;
use self::partitions::PartitionMeta;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("no disk {disk_index} in backup {backup_id}")]
    DiskNotFound { backup_id: String, disk_index: i32 },

    #[error("backup disk is not completed (status: {0})")]
    NotCompleted(String),

    #[error("backup disk already has an active restore mount: {0}")]
    AlreadyMounted(String),

    #[error("all restore mount slots are in use")]
    SlotsExhausted,

    #[error("restore mount not found: {0}")]
    MountNotFound(String),

    #[error("restore mount {0} is not in mounted state")]
    NotMounted(String),

    #[error("no mountable partitions found on the disk image")]
    NoMountablePartitions,

    #[error("path escapes the restore mount: {0}")]
    PathTraversal(String),

    #[error("not found: {0}")]
    FileNotFound(PathBuf),

    #[error("not a file: {0}")]
    NotAFile(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("unsupported archive format: {0}")]
    BadArchiveFormat(String),

    #[error(transparent)]
    Nbd(#[from] NbdError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

pub struct RestoreEngine {
    pool: Pool<MySql>,
    devices: Arc<DevicePool>,
    slots: Arc<Semaphore>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    mount_base: PathBuf,
    idle_window: ChronoDuration,
    setup_timeout: Duration,
    teardown_timeout: Duration,
}

impl RestoreEngine {
    pub fn new(
        pool: Pool<MySql>,
        devices: Arc<DevicePool>,
        max_mounts: usize,
        mount_base: PathBuf,
        idle_timeout_secs: u64,
        setup_timeout: Duration,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            devices,
            slots: Arc::new(Semaphore::new(max_mounts)),
            permits: Mutex::new(HashMap::new()),
            mount_base,
            idle_window: ChronoDuration::seconds(idle_timeout_secs as i64),
            setup_timeout,
            teardown_timeout,
        }
    }

    /// Attach one completed backup disk for browsing.
    pub async fn mount(
        &self,
        backup_id: &str,
        disk_index: i32,
    ) -> Result<RestoreMount, RestoreError> {
        let disk = queries::backup::get_disk(&self.pool, backup_id, disk_index)
            .await?
            .ok_or_else(|| RestoreError::DiskNotFound {
                backup_id: backup_id.to_string(),
                disk_index,
            })?;

        if disk.status != "completed" {
            return Err(RestoreError::NotCompleted(disk.status));
        }

        if let Some(existing) =
            queries::mount::find_active_mount_for_disk(&self.pool, &disk.id).await?
        {
            return Err(RestoreError::AlreadyMounted(existing.id));
        }

        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| RestoreError::SlotsExhausted)?;

        let device = self.devices.allocate()?;
        let mount_id = Uuid::new_v4().to_string();
        let base = self.mount_base.join(&mount_id);

        let now = Utc::now();
        let row = RestoreMount {
            id: mount_id.clone(),
            backup_disk_id: disk.id.clone(),
            backup_job_id: backup_id.to_string(),
            disk_index,
            qcow2_path: disk.qcow2_path.clone(),
            nbd_device: device.clone(),
            mount_base: base.to_string_lossy().to_string(),
            partition_metadata: None,
            status: "mounting".to_string(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + self.idle_window,
        };
        queries::mount::create_mount(&self.pool, &row).await?;

        match self.attach_and_mount(&device, &disk.qcow2_path, &base).await {
            Ok(metadata) => {
                let metadata_json = serde_json::to_string(&metadata)?;
                let expires = Utc::now() + self.idle_window;
                queries::mount::set_mounted(&self.pool, &mount_id, &metadata_json, expires)
                    .await?;
                self.permits.lock().insert(mount_id.clone(), permit);

                info!(
                    "restore mount {} up: {} partitions of {} on {}",
                    mount_id,
                    metadata.len(),
                    disk.id,
                    device
                );

                queries::mount::get_mount(&self.pool, &mount_id)
                    .await?
                    .ok_or_else(|| RestoreError::MountNotFound(mount_id))
            }
            Err(e) => {
                error!("restore mount {} failed: {}", mount_id, e);
                self.teardown(&device, &base).await;
                self.devices.release(&device);
                drop(permit);
                queries::mount::set_mount_status(&self.pool, &mount_id, "failed").await?;
                Err(e)
            }
        }
    }

    /// Connect the NBD device, scan for partitions and mount each one
    /// read-only. Per-partition mount failures are tolerated; zero mounted
    /// partitions fails the operation.
    async fn attach_and_mount(
        &self,
        device: &str,
        qcow2_path: &str,
        base: &Path,
    ) -> Result<Vec<PartitionMeta>, RestoreError> {
        std::fs::create_dir_all(base)?;
        client::connect_readonly(device, Path::new(qcow2_path), self.setup_timeout).await?;

        // give the kernel a moment to surface partition nodes
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let output = tools::run(
            "lsblk",
            &["-J", "-b", "-o", "NAME,SIZE,FSTYPE,LABEL,TYPE", device],
            self.setup_timeout,
        )
        .await?;

        let scan = partitions::parse_lsblk(&String::from_utf8_lossy(&output.stdout))?;
        let candidates = partitions::candidate_partitions(&scan);

        let mut mounted = Vec::new();
        let mut index = 1;

        for candidate in &candidates {
            let target = base.join(format!("partition-{}", index));
            std::fs::create_dir_all(&target)?;

            let partition_device = format!("/dev/{}", candidate.device_name);
            let target_str = target.to_string_lossy().to_string();

            match tools::run(
                "mount",
                &["-o", "ro", &partition_device, &target_str],
                self.setup_timeout,
            )
            .await
            {
                Ok(_) => {
                    mounted.push(PartitionMeta {
                        partition_name: candidate.device_name.clone(),
                        size: candidate.size,
                        filesystem: candidate
                            .filesystem
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                        label: candidate.label.clone().unwrap_or_default(),
                        mount_path: target_str,
                    });
                    index += 1;
                }
                Err(e) => {
                    warn!(
                        "partition {} did not mount ({}), skipping",
                        partition_device, e
                    );
                    let _ = std::fs::remove_dir(&target);
                }
            }
        }

        if mounted.is_empty() {
            return Err(RestoreError::NoMountablePartitions);
        }

        Ok(mounted)
    }

    /// Best-effort teardown of whatever `attach_and_mount` built.
    async fn teardown(&self, device: &str, base: &Path) {
        if base.exists() {
            if let Ok(entries) = std::fs::read_dir(base) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !name.starts_with("partition-") {
                        continue;
                    }
                    let target = entry.path().to_string_lossy().to_string();
                    if let Err(e) = tools::run("umount", &[&target], self.teardown_timeout).await {
                        warn!("umount {}: {}", target, e);
                    }
                }
            }
        }

        if let Err(e) = client::disconnect(device, self.teardown_timeout).await {
            warn!("nbd disconnect {}: {}", device, e);
        }

        if base.exists() {
            if let Err(e) = std::fs::remove_dir_all(base) {
                warn!("removing mount base {}: {}", base.display(), e);
            }
        }
    }

    /// Release a restore mount. Idempotent: an already-unmounted row is a
    /// no-op.
    pub async fn unmount(&self, mount_id: &str) -> Result<(), RestoreError> {
        let mount = queries::mount::get_mount(&self.pool, mount_id)
            .await?
            .ok_or_else(|| RestoreError::MountNotFound(mount_id.to_string()))?;

        if mount.status == "unmounted" || mount.status == "failed" {
            return Ok(());
        }

        queries::mount::set_mount_status(&self.pool, mount_id, "unmounting").await?;

        let base = PathBuf::from(&mount.mount_base);
        self.teardown(&mount.nbd_device, &base).await;
        self.devices.release(&mount.nbd_device);
        self.permits.lock().remove(mount_id);

        queries::mount::set_mount_status(&self.pool, mount_id, "unmounted").await?;
        info!("restore mount {} released ({})", mount_id, mount.nbd_device);
        Ok(())
    }

    pub async fn list_mounts(&self) -> Result<Vec<RestoreMount>, RestoreError> {
        Ok(queries::mount::list_active_mounts(&self.pool).await?)
    }

    async fn active_mount(&self, mount_id: &str) -> Result<RestoreMount, RestoreError> {
        let mount = queries::mount::get_mount(&self.pool, mount_id)
            .await?
            .ok_or_else(|| RestoreError::MountNotFound(mount_id.to_string()))?;
        if mount.status != "mounted" {
            return Err(RestoreError::NotMounted(mount_id.to_string()));
        }
        Ok(mount)
    }

    fn partition_metadata(mount: &RestoreMount) -> Result<Vec<PartitionMeta>, RestoreError> {
        match mount.partition_metadata.as_deref() {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Any browse or download refreshes the idle window.
    async fn touch(&self, mount_id: &str) {
        let expires = Utc::now() + self.idle_window;
        if let Err(e) = queries::mount::touch_mount(&self.pool, mount_id, expires).await {
            warn!("touching mount {}: {}", mount_id, e);
        }
    }

    /// Resolve a request path against a mount, with containment checks.
    fn resolve(
        mount: &RestoreMount,
        metadata: &[PartitionMeta],
        raw_path: &str,
    ) -> Result<PathBuf, RestoreError> {
        let base = PathBuf::from(&mount.mount_base);
        let candidate = browse::resolve_request_path(&base, !metadata.is_empty(), raw_path)?;
        browse::verify_containment(&candidate, &base)
    }

    pub async fn list_files(
        &self,
        mount_id: &str,
        raw_path: &str,
    ) -> Result<Vec<FileEntry>, RestoreError> {
        let mount = self.active_mount(mount_id).await?;
        let metadata = Self::partition_metadata(&mount)?;

        let normalized = raw_path.trim();
        let is_root = normalized.is_empty() || normalized == "/";

        let entries = if !metadata.is_empty() && is_root {
            metadata
                .iter()
                .enumerate()
                .map(|(i, meta)| {
                    let index = i + 1;
                    FileEntry {
                        name: browse::friendly_partition_label(index, meta),
                        path: format!("/partition-{}", index),
                        file_type: "directory".to_string(),
                        size: meta.size,
                        modified: None,
                    }
                })
                .collect()
        } else {
            let resolved = Self::resolve(&mount, &metadata, raw_path)?;
            if !resolved.is_dir() {
                return Err(RestoreError::NotADirectory(resolved));
            }

            let base = PathBuf::from(&mount.mount_base).canonicalize()?;
            let virtual_prefix = format!(
                "/{}",
                resolved
                    .strip_prefix(&base)
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default()
            );
            browse::list_directory(&resolved, &virtual_prefix)?
        };

        self.touch(mount_id).await;
        Ok(entries)
    }

    pub async fn file_info(
        &self,
        mount_id: &str,
        raw_path: &str,
    ) -> Result<FileEntry, RestoreError> {
        let mount = self.active_mount(mount_id).await?;
        let metadata = Self::partition_metadata(&mount)?;
        let resolved = Self::resolve(&mount, &metadata, raw_path)?;

        let stat = std::fs::metadata(&resolved)?;
        let name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        self.touch(mount_id).await;
        Ok(FileEntry {
            name,
            path: raw_path.to_string(),
            file_type: if stat.is_dir() {
                "directory".to_string()
            } else {
                "file".to_string()
            },
            size: if stat.is_dir() { 0 } else { stat.len() },
            modified: stat.modified().ok().map(Into::into),
        })
    }

    /// Resolve a download target, requiring a regular file.
    pub async fn resolve_file(
        &self,
        mount_id: &str,
        raw_path: &str,
    ) -> Result<PathBuf, RestoreError> {
        let mount = self.active_mount(mount_id).await?;
        let metadata = Self::partition_metadata(&mount)?;
        let resolved = Self::resolve(&mount, &metadata, raw_path)?;

        if !resolved.is_file() {
            return Err(RestoreError::NotAFile(resolved));
        }

        self.touch(mount_id).await;
        Ok(resolved)
    }

    /// Resolve an archive target, requiring a directory.
    pub async fn resolve_directory(
        &self,
        mount_id: &str,
        raw_path: &str,
    ) -> Result<PathBuf, RestoreError> {
        let mount = self.active_mount(mount_id).await?;
        let metadata = Self::partition_metadata(&mount)?;
        let resolved = Self::resolve(&mount, &metadata, raw_path)?;

        if !resolved.is_dir() {
            return Err(RestoreError::NotADirectory(resolved));
        }

        self.touch(mount_id).await;
        Ok(resolved)
    }

    /// Expire idle mounts. Called by the cleanup worker and safe to re-run.
    pub async fn cleanup_expired(&self) -> usize {
        let expired = match queries::mount::list_expired_mounts(&self.pool).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("expired-mount scan failed: {}", e);
                return 0;
            }
        };

        let mut released = 0;
        for mount in expired {
            info!("restore mount {} idle-expired, unmounting", mount.id);
            match self.unmount(&mount.id).await {
                Ok(()) => released += 1,
                Err(e) => error!("auto-unmount of {} failed: {}", mount.id, e),
            }
        }
        released
    }

    pub fn spawn_cleanup_worker(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let released = engine.cleanup_expired().await;
                if released > 0 {
                    info!("restore cleanup released {} idle mounts", released);
                }
            }
        })
    }

    /// Startup pass: adopt mounts that survived a restart when their
    /// partitions are still in the kernel mount table, release the rest.
    pub async fn reconcile(&self) -> Result<(usize, usize), RestoreError> {
        let active = queries::mount::list_active_mounts(&self.pool).await?;
        let mount_table = std::fs::read_to_string("/proc/mounts").unwrap_or_default();

        let mut adopted = 0;
        let mut dropped = 0;

        for mount in active {
            let metadata = Self::partition_metadata(&mount).unwrap_or_default();
            let still_mounted = mount.status == "mounted"
                && metadata.iter().any(|m| {
                    crate::repository::mounts::mount_table_contains(
                        &mount_table,
                        Path::new(&m.mount_path),
                    )
                });

            if still_mounted {
                self.devices.claim(&mount.nbd_device);
                match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(permit) => {
                        self.permits.lock().insert(mount.id.clone(), permit);
                    }
                    Err(_) => warn!("adopted mount {} exceeds the slot pool", mount.id),
                }
                info!("adopted live restore mount {}", mount.id);
                adopted += 1;
            } else {
                warn!("restore mount {} did not survive restart, releasing", mount.id);
                self.unmount(&mount.id).await?;
                dropped += 1;
            }
        }

        Ok((adopted, dropped))
    }
}
