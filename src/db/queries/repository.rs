use crate::db::tables::RepositoryRecord;
use chrono::Utc;
use sqlx::{MySql, Pool};

pub async fn create_repository(
    pool: &Pool<MySql>,
    record: &RepositoryRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO repositories (
            id, name, kind, base_path, server, export_path, mount_options,
            nfs_version, cifs_username, cifs_password_ref,
            immutability_enabled, min_retention_days, grace_period_hours,
            created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.name)
    .bind(&record.kind)
    .bind(&record.base_path)
    .bind(&record.server)
    .bind(&record.export_path)
    .bind(&record.mount_options)
    .bind(&record.nfs_version)
    .bind(&record.cifs_username)
    .bind(&record.cifs_password_ref)
    .bind(record.immutability_enabled)
    .bind(record.min_retention_days)
    .bind(record.grace_period_hours)
    .bind(record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_repository(
    pool: &Pool<MySql>,
    repository_id: &str,
) -> Result<Option<RepositoryRecord>, sqlx::Error> {
    sqlx::query_as::<_, RepositoryRecord>("SELECT * FROM repositories WHERE id = ?")
        .bind(repository_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_repository_by_name(
    pool: &Pool<MySql>,
    name: &str,
) -> Result<Option<RepositoryRecord>, sqlx::Error> {
    sqlx::query_as::<_, RepositoryRecord>("SELECT * FROM repositories WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn list_repositories(pool: &Pool<MySql>) -> Result<Vec<RepositoryRecord>, sqlx::Error> {
    sqlx::query_as::<_, RepositoryRecord>("SELECT * FROM repositories ORDER BY name")
        .fetch_all(pool)
        .await
}

/// Persist the latest capacity probe.
pub async fn update_storage_info(
    pool: &Pool<MySql>,
    repository_id: &str,
    total_bytes: i64,
    used_bytes: i64,
    available_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE repositories SET total_bytes = ?, used_bytes = ?,
            available_bytes = ?, last_check_at = ? WHERE id = ?",
    )
    .bind(total_bytes)
    .bind(used_bytes)
    .bind(available_bytes)
    .bind(Utc::now())
    .bind(repository_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Update the mutable settings of a repository descriptor.
pub async fn update_repository(
    pool: &Pool<MySql>,
    record: &RepositoryRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE repositories SET name = ?, mount_options = ?,
            immutability_enabled = ?, min_retention_days = ?, grace_period_hours = ?
         WHERE id = ?",
    )
    .bind(&record.name)
    .bind(&record.mount_options)
    .bind(record.immutability_enabled)
    .bind(record.min_retention_days)
    .bind(record.grace_period_hours)
    .bind(&record.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_repository(pool: &Pool<MySql>, repository_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM repositories WHERE id = ?")
        .bind(repository_id)
        .execute(pool)
        .await?;
    Ok(())
}
