use crate::db::tables::RestoreMount;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

pub async fn create_mount(pool: &Pool<MySql>, mount: &RestoreMount) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO restore_mounts (
            id, backup_disk_id, backup_job_id, disk_index, qcow2_path,
            nbd_device, mount_base, partition_metadata, status,
            created_at, last_accessed_at, expires_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&mount.id)
    .bind(&mount.backup_disk_id)
    .bind(&mount.backup_job_id)
    .bind(mount.disk_index)
    .bind(&mount.qcow2_path)
    .bind(&mount.nbd_device)
    .bind(&mount.mount_base)
    .bind(&mount.partition_metadata)
    .bind(&mount.status)
    .bind(mount.created_at)
    .bind(mount.last_accessed_at)
    .bind(mount.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_mount(
    pool: &Pool<MySql>,
    mount_id: &str,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE id = ?")
        .bind(mount_id)
        .fetch_optional(pool)
        .await
}

/// Active mounts are anything not yet unmounted or failed.
pub async fn list_active_mounts(pool: &Pool<MySql>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>(
        "SELECT * FROM restore_mounts WHERE status IN ('mounting', 'mounted', 'unmounting')
         ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
}

/// The active mount of a backup disk, if any. At most one exists.
pub async fn find_active_mount_for_disk(
    pool: &Pool<MySql>,
    backup_disk_id: &str,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>(
        "SELECT * FROM restore_mounts
         WHERE backup_disk_id = ? AND status IN ('mounting', 'mounted', 'unmounting')
         LIMIT 1",
    )
    .bind(backup_disk_id)
    .fetch_optional(pool)
    .await
}

pub async fn set_mount_status(
    pool: &Pool<MySql>,
    mount_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE restore_mounts SET status = ? WHERE id = ?")
        .bind(status)
        .bind(mount_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_mounted(
    pool: &Pool<MySql>,
    mount_id: &str,
    partition_metadata: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE restore_mounts SET status = 'mounted', partition_metadata = ?, expires_at = ?
         WHERE id = ?",
    )
    .bind(partition_metadata)
    .bind(expires_at)
    .bind(mount_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Refresh the idle window after a browse or download touches the mount.
pub async fn touch_mount(
    pool: &Pool<MySql>,
    mount_id: &str,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE restore_mounts SET last_accessed_at = ?, expires_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(expires_at)
    .bind(mount_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mounted rows whose idle window has elapsed.
pub async fn list_expired_mounts(pool: &Pool<MySql>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>(
        "SELECT * FROM restore_mounts WHERE status = 'mounted' AND expires_at < ?",
    )
    .bind(Utc::now())
    .fetch_all(pool)
    .await
}
