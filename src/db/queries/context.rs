use crate::db::tables::VmContext;
use chrono::Utc;
use sqlx::{MySql, Pool};
use uuid::Uuid;

/// Get the context anchoring `(vm_name, repository_id)`, if one exists.
pub async fn find_context(
    pool: &Pool<MySql>,
    vm_name: &str,
    repository_id: &str,
) -> Result<Option<VmContext>, sqlx::Error> {
    sqlx::query_as::<_, VmContext>(
        "SELECT * FROM vm_contexts WHERE vm_name = ? AND repository_id = ?",
    )
    .bind(vm_name)
    .bind(repository_id)
    .fetch_optional(pool)
    .await
}

/// Get-or-create the context for `(vm_name, repository_id)`. A context is
/// created on the first backup of a VM into a repository and lives until the
/// repository is destroyed.
pub async fn ensure_context(
    pool: &Pool<MySql>,
    vm_name: &str,
    repository_id: &str,
    vmware_moref: &str,
    vmware_path: &str,
    vcenter_host: &str,
    datacenter: &str,
) -> Result<VmContext, sqlx::Error> {
    if let Some(existing) = find_context(pool, vm_name, repository_id).await? {
        return Ok(existing);
    }

    let id = format!("ctx-{}", &Uuid::new_v4().simple().to_string()[..12]);

    sqlx::query(
        "INSERT INTO vm_contexts (
            id, vm_name, vmware_moref, vmware_path, vcenter_host, datacenter,
            repository_id, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(vm_name)
    .bind(vmware_moref)
    .bind(vmware_path)
    .bind(vcenter_host)
    .bind(datacenter)
    .bind(repository_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, VmContext>("SELECT * FROM vm_contexts WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await
}

/// List all contexts stored in a repository.
pub async fn list_contexts_for_repository(
    pool: &Pool<MySql>,
    repository_id: &str,
) -> Result<Vec<VmContext>, sqlx::Error> {
    sqlx::query_as::<_, VmContext>(
        "SELECT * FROM vm_contexts WHERE repository_id = ? ORDER BY vm_name",
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await
}

/// All contexts anchoring a VM, across repositories.
pub async fn list_contexts_for_vm(
    pool: &Pool<MySql>,
    vm_name: &str,
) -> Result<Vec<VmContext>, sqlx::Error> {
    sqlx::query_as::<_, VmContext>(
        "SELECT * FROM vm_contexts WHERE vm_name = ? ORDER BY created_at",
    )
    .bind(vm_name)
    .fetch_all(pool)
    .await
}

/// Count contexts referencing a repository (delete guard).
pub async fn count_contexts_for_repository(
    pool: &Pool<MySql>,
    repository_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM vm_contexts WHERE repository_id = ?")
        .bind(repository_id)
        .fetch_one(pool)
        .await
}

/// Roll the context counters after a job reaches a terminal state.
pub async fn record_job_outcome(
    pool: &Pool<MySql>,
    context_id: &str,
    job_id: &str,
    succeeded: bool,
) -> Result<(), sqlx::Error> {
    if succeeded {
        sqlx::query(
            "UPDATE vm_contexts SET
                total_backups = total_backups + 1,
                successful_backups = successful_backups + 1,
                last_backup_id = ?,
                last_backup_at = ?
             WHERE id = ?",
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(context_id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE vm_contexts SET
                total_backups = total_backups + 1,
                failed_backups = failed_backups + 1
             WHERE id = ?",
        )
        .bind(context_id)
        .execute(pool)
        .await?;
    }

    Ok(())
}
