use crate::db::tables::ScheduleRecord;
use sqlx::{MySql, Pool};

pub async fn get_schedule(
    pool: &Pool<MySql>,
    schedule_id: &str,
) -> Result<Option<ScheduleRecord>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules WHERE id = ?")
        .bind(schedule_id)
        .fetch_optional(pool)
        .await
}

pub async fn create_schedule(
    pool: &Pool<MySql>,
    schedule: &ScheduleRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO schedules (id, name, cron_expression, enabled, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&schedule.id)
    .bind(&schedule.name)
    .bind(&schedule.cron_expression)
    .bind(schedule.enabled)
    .bind(schedule.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_schedules(pool: &Pool<MySql>) -> Result<Vec<ScheduleRecord>, sqlx::Error> {
    sqlx::query_as::<_, ScheduleRecord>("SELECT * FROM schedules ORDER BY name")
        .fetch_all(pool)
        .await
}
