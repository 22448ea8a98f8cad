//! Protection flow API: CRUD, enable/disable, manual execution and the
//! execution history.

use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, patch, post, put, State};
use serde::Deserialize;

use crate::api::ApiError;
use crate::db::queries;
use crate::flows::FlowSpec;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct FlowBody {
    pub name: String,
    pub flow_type: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl FlowBody {
    fn into_spec(self) -> FlowSpec {
        FlowSpec {
            name: self.name,
            flow_type: self.flow_type,
            target_type: self.target_type,
            target_id: self.target_id,
            repository_id: self.repository_id,
            policy_id: self.policy_id,
            schedule_id: self.schedule_id,
            enabled: self.enabled,
        }
    }
}

#[post("/protection-flows", format = "json", data = "<body>")]
pub async fn create_flow(
    state: &State<EngineState>,
    body: Json<FlowBody>,
) -> Result<Json<Value>, ApiError> {
    let flow = state.flows.create_flow(body.into_inner().into_spec()).await?;

    if let (true, Some(schedule_id)) = (flow.enabled, flow.schedule_id.as_deref()) {
        state
            .scheduler
            .register_flow_schedule(&flow.id, schedule_id)
            .await?;
    }

    Ok(Json(json!(flow)))
}

#[get("/protection-flows?<flow_type>&<target_type>&<enabled>")]
pub async fn list_flows(
    state: &State<EngineState>,
    flow_type: Option<String>,
    target_type: Option<String>,
    enabled: Option<bool>,
) -> Result<Json<Value>, ApiError> {
    let flows = queries::flow::list_flows(
        &state.pool,
        flow_type.as_deref(),
        target_type.as_deref(),
        enabled,
    )
    .await?;

    Ok(Json(json!({ "flows": flows, "total": flows.len() })))
}

#[get("/protection-flows/summary")]
pub async fn flow_summary(state: &State<EngineState>) -> Result<Json<Value>, ApiError> {
    let summary = queries::flow::flow_summary(&state.pool).await?;
    Ok(Json(json!(summary)))
}

#[get("/protection-flows/<flow_id>")]
pub async fn get_flow(
    state: &State<EngineState>,
    flow_id: &str,
) -> Result<Json<Value>, ApiError> {
    let flow = queries::flow::get_flow(&state.pool, flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("protection flow not found: {}", flow_id)))?;
    Ok(Json(json!(flow)))
}

#[put("/protection-flows/<flow_id>", format = "json", data = "<body>")]
pub async fn update_flow(
    state: &State<EngineState>,
    flow_id: &str,
    body: Json<FlowBody>,
) -> Result<Json<Value>, ApiError> {
    let flow = state
        .flows
        .update_flow(flow_id, body.into_inner().into_spec())
        .await?;

    match (flow.enabled, flow.schedule_id.as_deref()) {
        (true, Some(schedule_id)) => {
            state
                .scheduler
                .register_flow_schedule(&flow.id, schedule_id)
                .await?;
        }
        _ => state.scheduler.unregister_flow_schedule(&flow.id),
    }

    Ok(Json(json!(flow)))
}

#[delete("/protection-flows/<flow_id>")]
pub async fn delete_flow(
    state: &State<EngineState>,
    flow_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.unregister_flow_schedule(flow_id);
    state.flows.delete_flow(flow_id).await?;
    Ok(Json(json!({ "message": "protection flow deleted", "flow_id": flow_id })))
}

#[patch("/protection-flows/<flow_id>/enable")]
pub async fn enable_flow(
    state: &State<EngineState>,
    flow_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.flows.set_enabled(flow_id, true).await?;

    let flow = queries::flow::get_flow(&state.pool, flow_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("protection flow not found: {}", flow_id)))?;
    if let Some(schedule_id) = flow.schedule_id.as_deref() {
        state
            .scheduler
            .register_flow_schedule(flow_id, schedule_id)
            .await?;
    }

    Ok(Json(json!({ "message": "protection flow enabled", "flow_id": flow_id })))
}

#[patch("/protection-flows/<flow_id>/disable")]
pub async fn disable_flow(
    state: &State<EngineState>,
    flow_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.flows.set_enabled(flow_id, false).await?;
    Ok(Json(json!({ "message": "protection flow disabled", "flow_id": flow_id })))
}

#[derive(Debug, Deserialize)]
pub struct BulkBody {
    pub flow_ids: Vec<String>,
}

#[patch("/protection-flows/bulk-enable", format = "json", data = "<body>")]
pub async fn bulk_enable(
    state: &State<EngineState>,
    body: Json<BulkBody>,
) -> Result<Json<Value>, ApiError> {
    let mut updated = 0;
    for flow_id in &body.flow_ids {
        if state.flows.set_enabled(flow_id, true).await.is_ok() {
            updated += 1;
        }
    }
    Ok(Json(json!({ "updated": updated })))
}

#[patch("/protection-flows/bulk-disable", format = "json", data = "<body>")]
pub async fn bulk_disable(
    state: &State<EngineState>,
    body: Json<BulkBody>,
) -> Result<Json<Value>, ApiError> {
    let mut updated = 0;
    for flow_id in &body.flow_ids {
        if state.flows.set_enabled(flow_id, false).await.is_ok() {
            updated += 1;
        }
    }
    Ok(Json(json!({ "updated": updated })))
}

#[post("/protection-flows/<flow_id>/execute")]
pub async fn execute_flow(
    state: &State<EngineState>,
    flow_id: &str,
) -> Result<Json<Value>, ApiError> {
    let execution = state.flows.execute_flow(flow_id, "manual").await?;
    Ok(Json(json!(execution)))
}

#[get("/protection-flows/<flow_id>/executions?<limit>")]
pub async fn list_executions(
    state: &State<EngineState>,
    flow_id: &str,
    limit: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    if queries::flow::get_flow(&state.pool, flow_id).await?.is_none() {
        return Err(ApiError::not_found(format!("protection flow not found: {}", flow_id)));
    }

    let executions =
        queries::flow::list_executions(&state.pool, flow_id, limit.unwrap_or(50)).await?;
    Ok(Json(json!({ "executions": executions, "total": executions.len() })))
}

#[post("/protection-flows/<_flow_id>/executions/<execution_id>/cancel")]
pub async fn cancel_execution(
    state: &State<EngineState>,
    _flow_id: &str,
    execution_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.flows.cancel_execution(execution_id).await?;
    Ok(Json(json!({ "message": "execution cancelled", "execution_id": execution_id })))
}
