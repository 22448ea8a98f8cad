//! VM group API. Groups are ordered member lists a protection flow can
//! target; `max_concurrent_vms` bounds the flow's fan-out.

use chrono::Utc;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::ApiError;
use crate::db::queries;
use crate::db::tables::{VmGroup, VmGroupMember};
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct CreateGroupBody {
    pub name: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_vms: i32,
    #[serde(default)]
    pub vm_names: Vec<String>,
}

fn default_concurrency() -> i32 {
    1
}

#[post("/groups", format = "json", data = "<body>")]
pub async fn create_group(
    state: &State<EngineState>,
    body: Json<CreateGroupBody>,
) -> Result<Json<Value>, ApiError> {
    for vm_name in &body.vm_names {
        if queries::vm::get_vm_by_name(&state.pool, vm_name).await?.is_none() {
            return Err(ApiError::bad_request(format!("VM not found: {}", vm_name)));
        }
    }

    let group = VmGroup {
        id: format!("group-{}", &Uuid::new_v4().simple().to_string()[..12]),
        name: body.name.clone(),
        max_concurrent_vms: body.max_concurrent_vms.max(1),
        created_at: Utc::now(),
    };
    queries::group::create_group(&state.pool, &group).await?;

    for (position, vm_name) in body.vm_names.iter().enumerate() {
        let member = VmGroupMember {
            group_id: group.id.clone(),
            vm_name: vm_name.clone(),
            position: position as i32,
            enabled: true,
        };
        queries::group::add_member(&state.pool, &member).await?;
    }

    Ok(Json(json!({ "group": group, "members": body.vm_names })))
}

#[get("/groups/<group_id>")]
pub async fn get_group(
    state: &State<EngineState>,
    group_id: &str,
) -> Result<Json<Value>, ApiError> {
    let group = queries::group::get_group(&state.pool, group_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("group not found: {}", group_id)))?;

    let members = queries::group::list_enabled_members(&state.pool, group_id).await?;
    Ok(Json(json!({ "group": group, "members": members })))
}
