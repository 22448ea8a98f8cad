//! Operational status of the hub's resource pools.

use rocket::serde::json::{json, Json, Value};
use rocket::{get, State};

use crate::api::ApiError;
use crate::state::EngineState;

#[get("/system/status")]
pub async fn system_status(state: &State<EngineState>) -> Result<Json<Value>, ApiError> {
    let active_mounts = state.restore.list_mounts().await?;

    Ok(Json(json!({
        "nbd_ports_in_use": state.ports.in_use(),
        "qemu_nbd_servers_live": state.nbd_servers.live_count(),
        "restore_devices_available": state.devices.available(),
        "restore_mounts_active": active_mounts.len(),
        "schedules_armed": state.scheduler.armed_count(),
        "repositories_registered": state.registry.list().len(),
    })))
}
