use crate::db::tables::{BackupPolicy, CopyRule};
use sqlx::{MySql, Pool};

pub async fn get_policy(
    pool: &Pool<MySql>,
    policy_id: &str,
) -> Result<Option<BackupPolicy>, sqlx::Error> {
    sqlx::query_as::<_, BackupPolicy>("SELECT * FROM backup_policies WHERE id = ?")
        .bind(policy_id)
        .fetch_optional(pool)
        .await
}

pub async fn create_policy(pool: &Pool<MySql>, policy: &BackupPolicy) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_policies (id, name, retention_days, primary_repository_id, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&policy.id)
    .bind(&policy.name)
    .bind(policy.retention_days)
    .bind(&policy.primary_repository_id)
    .bind(policy.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn create_rule(pool: &Pool<MySql>, rule: &CopyRule) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO copy_rules (
            id, policy_id, destination_repository_id, mode, priority,
            verify_after_copy, enabled
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&rule.id)
    .bind(&rule.policy_id)
    .bind(&rule.destination_repository_id)
    .bind(&rule.mode)
    .bind(rule.priority)
    .bind(rule.verify_after_copy)
    .bind(rule.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

/// Enabled rules of a policy, highest priority first.
pub async fn list_enabled_rules(
    pool: &Pool<MySql>,
    policy_id: &str,
) -> Result<Vec<CopyRule>, sqlx::Error> {
    sqlx::query_as::<_, CopyRule>(
        "SELECT * FROM copy_rules WHERE policy_id = ? AND enabled = TRUE ORDER BY priority",
    )
    .bind(policy_id)
    .fetch_all(pool)
    .await
}
