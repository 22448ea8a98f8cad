use crate::db::tables::BackupCopy;
use chrono::Utc;
use sqlx::{MySql, Pool};

/// Enqueue a copy item. The `(source_backup_id, destination_repository_id)`
/// unique key makes re-enqueueing after a crash a no-op.
pub async fn enqueue(pool: &Pool<MySql>, copy: &BackupCopy) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT IGNORE INTO backup_copies (
            id, source_backup_id, destination_repository_id, rule_id, status,
            priority, verify_after_copy, created_at
        ) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(&copy.id)
    .bind(&copy.source_backup_id)
    .bind(&copy.destination_repository_id)
    .bind(&copy.rule_id)
    .bind(copy.priority)
    .bind(copy.verify_after_copy)
    .bind(copy.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Claim the next pending item in `(priority, created_at)` order. The
/// guarded UPDATE makes the claim exclusive across workers.
pub async fn claim_next_pending(pool: &Pool<MySql>) -> Result<Option<BackupCopy>, sqlx::Error> {
    loop {
        let candidate = sqlx::query_as::<_, BackupCopy>(
            "SELECT * FROM backup_copies WHERE status = 'pending'
             ORDER BY priority, created_at LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;

        let Some(copy) = candidate else {
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE backup_copies SET status = 'copying', started_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(&copy.id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return get_copy(pool, &copy.id).await;
        }
        // another worker won the claim; try the next item
    }
}

pub async fn get_copy(pool: &Pool<MySql>, copy_id: &str) -> Result<Option<BackupCopy>, sqlx::Error> {
    sqlx::query_as::<_, BackupCopy>("SELECT * FROM backup_copies WHERE id = ?")
        .bind(copy_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_for_backup(
    pool: &Pool<MySql>,
    source_backup_id: &str,
) -> Result<Vec<BackupCopy>, sqlx::Error> {
    sqlx::query_as::<_, BackupCopy>(
        "SELECT * FROM backup_copies WHERE source_backup_id = ? ORDER BY priority",
    )
    .bind(source_backup_id)
    .fetch_all(pool)
    .await
}

pub async fn set_verifying(
    pool: &Pool<MySql>,
    copy_id: &str,
    destination_path: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_copies SET status = 'verifying', destination_path = ? WHERE id = ?",
    )
    .bind(destination_path)
    .bind(copy_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_completed(pool: &Pool<MySql>, copy_id: &str, verified: bool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_copies SET status = 'completed', verified = ?, completed_at = ? WHERE id = ?",
    )
    .bind(verified)
    .bind(Utc::now())
    .bind(copy_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_failed(
    pool: &Pool<MySql>,
    copy_id: &str,
    error_message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_copies SET status = 'failed', error_message = ?, completed_at = ? WHERE id = ?",
    )
    .bind(error_message)
    .bind(Utc::now())
    .bind(copy_id)
    .execute(pool)
    .await?;
    Ok(())
}
