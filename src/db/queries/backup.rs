use crate::db::tables::{BackupDisk, BackupJob};
use chrono::Utc;
use sqlx::{MySql, Pool, Row};
use std::collections::HashMap;

/// Insert a new parent backup job.
pub async fn create_job(pool: &Pool<MySql>, job: &BackupJob) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_jobs (
            id, context_id, vm_name, repository_id, backup_type, status,
            policy_id, total_bytes, transferred_bytes, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.id)
    .bind(&job.context_id)
    .bind(&job.vm_name)
    .bind(&job.repository_id)
    .bind(&job.backup_type)
    .bind(&job.status)
    .bind(&job.policy_id)
    .bind(job.total_bytes)
    .bind(job.transferred_bytes)
    .bind(job.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a parent job by ID.
pub async fn get_job(pool: &Pool<MySql>, job_id: &str) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// List parent jobs with optional filters. Per-disk rows live in
/// `backup_disks`, so this can never leak synthetic per-disk entries.
pub async fn list_jobs(
    pool: &Pool<MySql>,
    vm_name: Option<&str>,
    status: Option<&str>,
    repository_id: Option<&str>,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    let mut sql = String::from("SELECT * FROM backup_jobs WHERE 1=1");
    if vm_name.is_some() {
        sql.push_str(" AND vm_name = ?");
    }
    if status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if repository_id.is_some() {
        sql.push_str(" AND repository_id = ?");
    }
    sql.push_str(" ORDER BY created_at DESC");

    let mut query = sqlx::query_as::<_, BackupJob>(&sql);
    if let Some(vm) = vm_name {
        query = query.bind(vm);
    }
    if let Some(st) = status {
        query = query.bind(st);
    }
    if let Some(repo) = repository_id {
        query = query.bind(repo);
    }

    query.fetch_all(pool).await
}

/// All jobs currently marked running (reconciliation input).
pub async fn list_running_jobs(pool: &Pool<MySql>) -> Result<Vec<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE status = 'running'")
        .fetch_all(pool)
        .await
}

/// Mark a job running and stamp its start time.
pub async fn set_job_running(pool: &Pool<MySql>, job_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_jobs SET status = 'running', started_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transition a job to a terminal state. The update is guarded on the job
/// still being active, the same claim discipline the copy queue uses, so
/// when two callers race the transition exactly one wins. Returns whether
/// this call was the winner; only the winner may roll context counters or
/// enqueue follow-up work.
pub async fn finish_job(
    pool: &Pool<MySql>,
    job_id: &str,
    status: &str,
    transferred_bytes: i64,
    error_message: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs SET status = ?, transferred_bytes = ?,
            error_message = ?, completed_at = ?
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(status)
    .bind(transferred_bytes)
    .bind(error_message)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Insert a per-disk row (`status = pending`, no change ID yet).
pub async fn create_disk(pool: &Pool<MySql>, disk: &BackupDisk) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_disks (
            id, job_id, context_id, disk_index, vmware_disk_key, size_bytes,
            qcow2_path, parent_qcow2_path, nbd_port, export_name, status,
            bytes_transferred, progress_percent, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&disk.id)
    .bind(&disk.job_id)
    .bind(&disk.context_id)
    .bind(disk.disk_index)
    .bind(disk.vmware_disk_key)
    .bind(disk.size_bytes)
    .bind(&disk.qcow2_path)
    .bind(&disk.parent_qcow2_path)
    .bind(disk.nbd_port)
    .bind(&disk.export_name)
    .bind(&disk.status)
    .bind(disk.bytes_transferred)
    .bind(disk.progress_percent)
    .bind(disk.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Direct lookup by the `(job_id, disk_index)` composite key.
pub async fn get_disk(
    pool: &Pool<MySql>,
    job_id: &str,
    disk_index: i32,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? AND disk_index = ?",
    )
    .bind(job_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Lookup a disk row by its primary key.
pub async fn get_disk_by_id(
    pool: &Pool<MySql>,
    disk_id: &str,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>("SELECT * FROM backup_disks WHERE id = ?")
        .bind(disk_id)
        .fetch_optional(pool)
        .await
}

/// All disks of a job, ordered by disk index.
pub async fn list_disks(pool: &Pool<MySql>, job_id: &str) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? ORDER BY disk_index",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Disk counts for a set of jobs, one round trip.
pub async fn disk_counts(
    pool: &Pool<MySql>,
    job_ids: &[String],
) -> Result<HashMap<String, i64>, sqlx::Error> {
    if job_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders = vec!["?"; job_ids.len()].join(", ");
    let sql = format!(
        "SELECT job_id, COUNT(*) AS n FROM backup_disks WHERE job_id IN ({}) GROUP BY job_id",
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for id in job_ids {
        query = query.bind(id);
    }

    let rows = query.fetch_all(pool).await?;
    let mut counts = HashMap::new();
    for row in rows {
        let job_id: String = row.try_get("job_id")?;
        let n: i64 = row.try_get("n")?;
        counts.insert(job_id, n);
    }

    Ok(counts)
}

/// Mark a disk running.
pub async fn set_disk_running(
    pool: &Pool<MySql>,
    job_id: &str,
    disk_index: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_disks SET status = 'running' WHERE job_id = ? AND disk_index = ?",
    )
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(())
}

/// Advisory progress update from agent telemetry.
pub async fn update_disk_progress(
    pool: &Pool<MySql>,
    job_id: &str,
    disk_index: i32,
    bytes_transferred: i64,
    progress_percent: f64,
    phase: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_disks SET bytes_transferred = ?, progress_percent = ?, phase = ?
         WHERE job_id = ? AND disk_index = ?",
    )
    .bind(bytes_transferred)
    .bind(progress_percent)
    .bind(phase)
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a successful per-disk completion: terminal status, the CBT change
/// ID and the transferred byte count in one write.
pub async fn complete_disk(
    pool: &Pool<MySql>,
    job_id: &str,
    disk_index: i32,
    change_id: &str,
    bytes_transferred: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_disks SET status = 'completed', change_id = ?,
            bytes_transferred = ?, progress_percent = 100, completed_at = ?
         WHERE job_id = ? AND disk_index = ?",
    )
    .bind(change_id)
    .bind(bytes_transferred)
    .bind(Utc::now())
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a disk failed, keeping its QCOW2 on disk for diagnosis.
pub async fn fail_disk(
    pool: &Pool<MySql>,
    job_id: &str,
    disk_index: i32,
    error_message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_disks SET status = 'failed', error_message = ?, completed_at = ?
         WHERE job_id = ? AND disk_index = ?",
    )
    .bind(error_message)
    .bind(Utc::now())
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(())
}

/// Per-job completion aggregate, read with the parent row as the
/// serialization point.
#[derive(Debug, Clone, Copy)]
pub struct DiskAggregate {
    pub total: i64,
    pub completed: i64,
    pub bytes_transferred: i64,
}

pub async fn disk_aggregate(
    pool: &Pool<MySql>,
    job_id: &str,
) -> Result<DiskAggregate, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(IF(status = 'completed', 1, NULL)) AS completed,
                CAST(COALESCE(SUM(bytes_transferred), 0) AS SIGNED) AS bytes
         FROM backup_disks WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;

    Ok(DiskAggregate {
        total: row.try_get::<i64, _>("total")?,
        completed: row.try_get::<i64, _>("completed")?,
        bytes_transferred: row.try_get::<i64, _>("bytes")?,
    })
}

/// The most recent completed disk for `(context, disk_index)`, which is the
/// backing parent candidate for an incremental.
pub async fn latest_completed_disk(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_index: i32,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks
         WHERE context_id = ? AND disk_index = ? AND status = 'completed'
         ORDER BY completed_at DESC LIMIT 1",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Most recent recorded change ID for `(vm_name, disk_index)` across all
/// completed backups, newest first. `None` means no prior backup exists and
/// the caller must submit a full.
pub async fn previous_change_id(
    pool: &Pool<MySql>,
    vm_name: &str,
    disk_index: i32,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT d.change_id FROM backup_disks d
         JOIN backup_jobs j ON d.job_id = j.id
         WHERE j.vm_name = ? AND d.disk_index = ?
           AND d.status = 'completed' AND d.change_id IS NOT NULL
         ORDER BY d.completed_at DESC LIMIT 1",
    )
    .bind(vm_name)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// The ordered backing lineage for one `(context, disk_index)`: head is the
/// full, tail is the latest member.
pub async fn backup_chain(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_index: i32,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks
         WHERE context_id = ? AND disk_index = ? AND status = 'completed'
         ORDER BY created_at ASC",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_all(pool)
    .await
}

/// Completed disks that name `qcow2_path` as their backing file. Non-zero
/// means the file is a non-tail chain member and must not be deleted.
pub async fn count_descendants(
    pool: &Pool<MySql>,
    qcow2_path: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_disks WHERE parent_qcow2_path = ? AND status != 'failed'",
    )
    .bind(qcow2_path)
    .fetch_one(pool)
    .await
}

/// Whether the context already holds at least one successful backup.
pub async fn has_completed_backup(
    pool: &Pool<MySql>,
    context_id: &str,
) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_jobs WHERE context_id = ? AND status = 'completed'",
    )
    .bind(context_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

/// Count jobs stored in a repository (repository delete guard).
pub async fn count_jobs_for_repository(
    pool: &Pool<MySql>,
    repository_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM backup_jobs WHERE repository_id = ?")
        .bind(repository_id)
        .fetch_one(pool)
        .await
}

/// Completed disks in a repository that are past their immutability grace
/// period and not yet flagged.
pub async fn list_disks_awaiting_immutability(
    pool: &Pool<MySql>,
    repository_id: &str,
    grace_period_hours: i32,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT d.* FROM backup_disks d
         JOIN backup_jobs j ON d.job_id = j.id
         WHERE j.repository_id = ? AND d.status = 'completed'
           AND d.immutable_set = FALSE
           AND d.completed_at IS NOT NULL
           AND d.completed_at < DATE_SUB(NOW(), INTERVAL ? HOUR)",
    )
    .bind(repository_id)
    .bind(grace_period_hours)
    .fetch_all(pool)
    .await
}

/// Record that the filesystem immutable flag is set on a disk's QCOW2.
pub async fn mark_disk_immutable(pool: &Pool<MySql>, disk_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_disks SET immutable_set = TRUE WHERE id = ?")
        .bind(disk_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete a job and its disk rows. Chain-membership checks happen before
/// this is called.
pub async fn delete_job(pool: &Pool<MySql>, job_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM backup_disks WHERE job_id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}
