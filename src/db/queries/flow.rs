use crate::db::tables::{FlowExecution, ProtectionFlow};
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool, Row};

pub async fn create_flow(pool: &Pool<MySql>, flow: &ProtectionFlow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO protection_flows (
            id, name, flow_type, target_type, target_id, repository_id,
            policy_id, schedule_id, enabled, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&flow.id)
    .bind(&flow.name)
    .bind(&flow.flow_type)
    .bind(&flow.target_type)
    .bind(&flow.target_id)
    .bind(&flow.repository_id)
    .bind(&flow.policy_id)
    .bind(&flow.schedule_id)
    .bind(flow.enabled)
    .bind(flow.created_at)
    .bind(flow.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_flow(
    pool: &Pool<MySql>,
    flow_id: &str,
) -> Result<Option<ProtectionFlow>, sqlx::Error> {
    sqlx::query_as::<_, ProtectionFlow>("SELECT * FROM protection_flows WHERE id = ?")
        .bind(flow_id)
        .fetch_optional(pool)
        .await
}

pub async fn get_flow_by_name(
    pool: &Pool<MySql>,
    name: &str,
) -> Result<Option<ProtectionFlow>, sqlx::Error> {
    sqlx::query_as::<_, ProtectionFlow>("SELECT * FROM protection_flows WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

pub async fn list_flows(
    pool: &Pool<MySql>,
    flow_type: Option<&str>,
    target_type: Option<&str>,
    enabled: Option<bool>,
) -> Result<Vec<ProtectionFlow>, sqlx::Error> {
    let mut sql = String::from("SELECT * FROM protection_flows WHERE 1=1");
    if flow_type.is_some() {
        sql.push_str(" AND flow_type = ?");
    }
    if target_type.is_some() {
        sql.push_str(" AND target_type = ?");
    }
    if enabled.is_some() {
        sql.push_str(" AND enabled = ?");
    }
    sql.push_str(" ORDER BY name");

    let mut query = sqlx::query_as::<_, ProtectionFlow>(&sql);
    if let Some(ft) = flow_type {
        query = query.bind(ft);
    }
    if let Some(tt) = target_type {
        query = query.bind(tt);
    }
    if let Some(en) = enabled {
        query = query.bind(en);
    }

    query.fetch_all(pool).await
}

pub async fn update_flow(pool: &Pool<MySql>, flow: &ProtectionFlow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE protection_flows SET name = ?, flow_type = ?, target_type = ?,
            target_id = ?, repository_id = ?, policy_id = ?, schedule_id = ?,
            enabled = ? WHERE id = ?",
    )
    .bind(&flow.name)
    .bind(&flow.flow_type)
    .bind(&flow.target_type)
    .bind(&flow.target_id)
    .bind(&flow.repository_id)
    .bind(&flow.policy_id)
    .bind(&flow.schedule_id)
    .bind(flow.enabled)
    .bind(&flow.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_flow_enabled(
    pool: &Pool<MySql>,
    flow_id: &str,
    enabled: bool,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE protection_flows SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(flow_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn delete_flow(pool: &Pool<MySql>, flow_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM flow_executions WHERE flow_id = ?")
        .bind(flow_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM protection_flows WHERE id = ?")
        .bind(flow_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Refresh the denormalized execution pointers after a run finishes.
pub async fn record_execution_result(
    pool: &Pool<MySql>,
    flow_id: &str,
    execution_id: &str,
    status: &str,
    next_execution_at: Option<DateTime<Utc>>,
    succeeded: bool,
) -> Result<(), sqlx::Error> {
    let success_inc: i64 = if succeeded { 1 } else { 0 };
    sqlx::query(
        "UPDATE protection_flows SET
            last_execution_id = ?, last_execution_status = ?, last_execution_at = ?,
            next_execution_at = ?,
            total_executions = total_executions + 1,
            successful_executions = successful_executions + ?,
            failed_executions = failed_executions + (1 - ?)
         WHERE id = ?",
    )
    .bind(execution_id)
    .bind(status)
    .bind(Utc::now())
    .bind(next_execution_at)
    .bind(success_inc)
    .bind(success_inc)
    .bind(flow_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_next_execution(
    pool: &Pool<MySql>,
    flow_id: &str,
    next_execution_at: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE protection_flows SET next_execution_at = ? WHERE id = ?")
        .bind(next_execution_at)
        .bind(flow_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Aggregate counters for the summary endpoint.
#[derive(Debug, Default, serde::Serialize)]
pub struct FlowSummary {
    pub total_flows: i64,
    pub enabled_flows: i64,
    pub disabled_flows: i64,
    pub total_executions: i64,
    pub successful_executions: i64,
    pub failed_executions: i64,
}

pub async fn flow_summary(pool: &Pool<MySql>) -> Result<FlowSummary, sqlx::Error> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                COUNT(IF(enabled = TRUE, 1, NULL)) AS enabled,
                CAST(COALESCE(SUM(total_executions), 0) AS SIGNED) AS executions,
                CAST(COALESCE(SUM(successful_executions), 0) AS SIGNED) AS successes,
                CAST(COALESCE(SUM(failed_executions), 0) AS SIGNED) AS failures
         FROM protection_flows",
    )
    .fetch_one(pool)
    .await?;

    let total: i64 = row.try_get("total")?;
    let enabled: i64 = row.try_get("enabled")?;

    Ok(FlowSummary {
        total_flows: total,
        enabled_flows: enabled,
        disabled_flows: total - enabled,
        total_executions: row.try_get("executions")?,
        successful_executions: row.try_get("successes")?,
        failed_executions: row.try_get("failures")?,
    })
}

// --- executions ---

pub async fn create_execution(
    pool: &Pool<MySql>,
    execution: &FlowExecution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO flow_executions (
            id, flow_id, status, trigger_source, backup_job_ids, started_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&execution.id)
    .bind(&execution.flow_id)
    .bind(&execution.status)
    .bind(&execution.trigger_source)
    .bind(&execution.backup_job_ids)
    .bind(execution.started_at)
    .bind(execution.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_execution(
    pool: &Pool<MySql>,
    execution_id: &str,
) -> Result<Option<FlowExecution>, sqlx::Error> {
    sqlx::query_as::<_, FlowExecution>("SELECT * FROM flow_executions WHERE id = ?")
        .bind(execution_id)
        .fetch_optional(pool)
        .await
}

pub async fn list_executions(
    pool: &Pool<MySql>,
    flow_id: &str,
    limit: i64,
) -> Result<Vec<FlowExecution>, sqlx::Error> {
    sqlx::query_as::<_, FlowExecution>(
        "SELECT * FROM flow_executions WHERE flow_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(flow_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Persist rolling counters while an execution dispatches jobs.
pub async fn update_execution_progress(
    pool: &Pool<MySql>,
    execution: &FlowExecution,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE flow_executions SET
            jobs_created = ?, jobs_completed = ?, jobs_failed = ?, jobs_skipped = ?,
            vms_processed = ?, bytes_transferred = ?, backup_job_ids = ?
         WHERE id = ?",
    )
    .bind(execution.jobs_created)
    .bind(execution.jobs_completed)
    .bind(execution.jobs_failed)
    .bind(execution.jobs_skipped)
    .bind(execution.vms_processed)
    .bind(execution.bytes_transferred)
    .bind(&execution.backup_job_ids)
    .bind(&execution.id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn finish_execution(
    pool: &Pool<MySql>,
    execution_id: &str,
    status: &str,
    execution_time_seconds: i64,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE flow_executions SET status = ?, completed_at = ?,
            execution_time_seconds = ?, error_message = ? WHERE id = ?",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(execution_time_seconds)
    .bind(error_message)
    .bind(execution_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Crash recovery: executions still marked running when the hub restarts.
pub async fn fail_running_executions(pool: &Pool<MySql>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE flow_executions SET status = 'error',
            error_message = 'control plane restarted during execution',
            completed_at = ?
         WHERE status IN ('pending', 'running')",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
