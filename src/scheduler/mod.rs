// scheduler/mod.rs
//
// Cron engine for protection flows. Each registered flow gets a long-lived
// task that sleeps until the next cron instant and triggers the flow
// engine; ticks landing while the previous execution is still running are
// skipped and recorded. The same parser feeds the denormalized
// next_execution_time, so the two can never disagree.

use chrono::{DateTime, Utc};
use cron::Schedule;
use log::{error, info, warn};
use parking_lot::Mutex;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::db::queries;
use crate::flows::FlowEngine;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The cron parser wants a seconds field; operators write standard 5-field
/// expressions. Normalize by pinning seconds to zero.
pub fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    }
}

fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(&normalize_cron(expression)).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next instant the expression fires after now.
pub fn next_fire(expression: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    Ok(parse_schedule(expression)?.upcoming(Utc).next())
}

struct SchedulerEntry {
    schedule_id: String,
    handle: tokio::task::JoinHandle<()>,
}

pub struct Scheduler {
    pool: Pool<MySql>,
    engine: Arc<FlowEngine>,
    entries: Mutex<HashMap<String, SchedulerEntry>>,
}

impl Scheduler {
    pub fn new(pool: Pool<MySql>, engine: Arc<FlowEngine>) -> Self {
        Self {
            pool,
            engine,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) the cron entry driving a flow.
    pub async fn register_flow_schedule(
        self: &Arc<Self>,
        flow_id: &str,
        schedule_id: &str,
    ) -> Result<(), SchedulerError> {
        let schedule_row = queries::schedule::get_schedule(&self.pool, schedule_id)
            .await?
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))?;

        let schedule = parse_schedule(&schedule_row.cron_expression)?;

        self.unregister_flow_schedule(flow_id);

        queries::flow::set_next_execution(
            &self.pool,
            flow_id,
            schedule.upcoming(Utc).next(),
        )
        .await?;

        let scheduler = Arc::clone(self);
        let task_flow_id = flow_id.to_string();
        let handle = tokio::spawn(async move {
            scheduler.run_entry(task_flow_id, schedule).await;
        });

        self.entries.lock().insert(
            flow_id.to_string(),
            SchedulerEntry {
                schedule_id: schedule_id.to_string(),
                handle,
            },
        );

        info!(
            "scheduler: flow {} armed with '{}' ({})",
            flow_id, schedule_row.cron_expression, schedule_id
        );
        Ok(())
    }

    pub fn unregister_flow_schedule(&self, flow_id: &str) {
        if let Some(entry) = self.entries.lock().remove(flow_id) {
            entry.handle.abort();
            info!("scheduler: flow {} disarmed ({})", flow_id, entry.schedule_id);
        }
    }

    async fn run_entry(self: Arc<Self>, flow_id: String, schedule: Schedule) {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("scheduler: flow {} has no future fire times", flow_id);
                return;
            };

            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // re-read the flow each tick: disable wins over the armed entry
            let flow = match queries::flow::get_flow(&self.pool, &flow_id).await {
                Ok(Some(flow)) => flow,
                Ok(None) => {
                    warn!("scheduler: flow {} vanished, disarming", flow_id);
                    return;
                }
                Err(e) => {
                    error!("scheduler: reading flow {}: {}", flow_id, e);
                    continue;
                }
            };

            if !flow.enabled {
                continue;
            }

            if self.engine.is_running(&flow_id) {
                if let Err(e) = self.engine.record_skipped(&flow_id).await {
                    error!("scheduler: recording skipped tick for {}: {}", flow_id, e);
                }
                continue;
            }

            match self.engine.execute_flow(&flow_id, "scheduled").await {
                Ok(execution) => {
                    info!(
                        "scheduler: flow {} fired, execution {}",
                        flow_id, execution.id
                    );
                }
                Err(e) => {
                    error!("scheduler: executing flow {}: {}", flow_id, e);
                }
            }
        }
    }

    /// Re-arm every enabled flow with a schedule (startup pass).
    pub async fn rearm_all(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let flows = queries::flow::list_flows(&self.pool, None, None, Some(true)).await?;
        let mut armed = 0;

        for flow in flows {
            let Some(schedule_id) = flow.schedule_id.as_deref() else {
                continue;
            };
            match self.register_flow_schedule(&flow.id, schedule_id).await {
                Ok(()) => armed += 1,
                Err(e) => error!("scheduler: re-arming flow {}: {}", flow.id, e),
            }
        }

        Ok(armed)
    }

    pub fn armed_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    #[test]
    fn five_field_expressions_are_normalized() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 2 * * 0"), "0 0 2 * * 0");
        // already has seconds: untouched
        assert_eq!(normalize_cron("30 */5 * * * *"), "30 */5 * * * *");
    }

    #[test]
    fn next_fire_lands_on_a_five_minute_mark() {
        let next = next_fire("*/5 * * * *").unwrap().unwrap();
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
        assert!(next > Utc::now());
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!(matches!(
            next_fire("not a cron"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            next_fire("99 * * * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[test]
    fn nightly_schedule_fires_daily() {
        let schedule = parse_schedule("0 2 * * *").unwrap();
        let fires: Vec<_> = schedule
            .after(&Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap())
            .take(3)
            .collect();

        assert_eq!(fires.len(), 3);
        for (i, fire) in fires.iter().enumerate() {
            assert_eq!(fire.hour(), 2);
            assert_eq!(fire.minute(), 0);
            assert_eq!(fire.day(), 1 + i as u32);
        }
    }
}
