//! Schedule API. Cron expressions are validated with the same parser the
//! scheduler fires with.

use chrono::Utc;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::ApiError;
use crate::db::queries;
use crate::db::tables::ScheduleRecord;
use crate::scheduler;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleBody {
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[post("/schedules", format = "json", data = "<body>")]
pub async fn create_schedule(
    state: &State<EngineState>,
    body: Json<CreateScheduleBody>,
) -> Result<Json<Value>, ApiError> {
    let next = scheduler::next_fire(&body.cron_expression)?;

    let schedule = ScheduleRecord {
        id: format!("sched-{}", &Uuid::new_v4().simple().to_string()[..12]),
        name: body.name.clone(),
        cron_expression: body.cron_expression.clone(),
        enabled: body.enabled,
        created_at: Utc::now(),
    };
    queries::schedule::create_schedule(&state.pool, &schedule).await?;

    Ok(Json(json!({
        "schedule": schedule,
        "next_fire_time": next,
    })))
}

#[get("/schedules")]
pub async fn list_schedules(state: &State<EngineState>) -> Result<Json<Value>, ApiError> {
    let schedules = queries::schedule::list_schedules(&state.pool).await?;
    Ok(Json(json!({ "schedules": schedules, "total": schedules.len() })))
}
