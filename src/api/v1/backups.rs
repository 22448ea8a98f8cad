//! Backup API: start jobs, inspect parents and disks, walk chains, take
//! the capture agent's completion and telemetry callbacks, and delete
//! backups subject to retention.

use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use serde::Deserialize;

use crate::api::ApiError;
use crate::db::queries;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct CreateBackupBody {
    pub vm_name: String,
    pub repository_id: String,
    pub backup_type: String, // 'full' | 'incremental'
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Start a backup job. Returns the parent plus the per-disk NBD targets
/// handed to the capture agent.
#[post("/backups", format = "json", data = "<body>")]
pub async fn create_backup(
    state: &State<EngineState>,
    body: Json<CreateBackupBody>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .orchestrator
        .start_backup(
            &body.vm_name,
            &body.repository_id,
            &body.backup_type,
            body.policy_id.as_deref(),
        )
        .await?;

    let disks = queries::backup::list_disks(&state.pool, &job.id).await?;
    let nbd_targets: Vec<Value> = disks
        .iter()
        .map(|d| {
            json!({
                "disk_index": d.disk_index,
                "vmware_disk_key": d.vmware_disk_key,
                "nbd_port": d.nbd_port,
                "export_name": d.export_name,
            })
        })
        .collect();

    Ok(Json(json!({
        "backup": job,
        "disks": disks,
        "nbd_targets": nbd_targets,
        "tags": body.tags.clone().unwrap_or_default(),
    })))
}

/// List parent jobs. Per-disk rows live in their own table, so only parent
/// records can ever appear here; each element carries its disks_count.
#[get("/backups?<vm_name>&<status>&<repository_id>")]
pub async fn list_backups(
    state: &State<EngineState>,
    vm_name: Option<String>,
    status: Option<String>,
    repository_id: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let jobs = queries::backup::list_jobs(
        &state.pool,
        vm_name.as_deref(),
        status.as_deref(),
        repository_id.as_deref(),
    )
    .await?;

    let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
    let counts = queries::backup::disk_counts(&state.pool, &ids).await?;

    let backups: Vec<Value> = jobs
        .iter()
        .map(|job| {
            let mut value = json!(job);
            value["disks_count"] = json!(counts.get(&job.id).copied().unwrap_or(0));
            value
        })
        .collect();

    Ok(Json(json!({ "backups": backups, "total": backups.len() })))
}

/// The chain endpoint precedes `<backup_id>` so the static segment wins.
#[get("/backups/chain?<vm_name>&<disk_index>&<repository_id>")]
pub async fn get_backup_chain(
    state: &State<EngineState>,
    vm_name: String,
    disk_index: i32,
    repository_id: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let contexts = queries::context::list_contexts_for_vm(&state.pool, &vm_name).await?;
    let context = match repository_id.as_deref() {
        Some(repo) => contexts.into_iter().find(|c| c.repository_id == repo),
        None => contexts.into_iter().next(),
    }
    .ok_or_else(|| ApiError::not_found(format!("no backup context for VM {}", vm_name)))?;

    let chain = queries::backup::backup_chain(&state.pool, &context.id, disk_index).await?;
    let total_bytes: i64 = chain.iter().map(|d| d.bytes_transferred).sum();

    Ok(Json(json!({
        "context_id": context.id,
        "vm_name": vm_name,
        "disk_index": disk_index,
        "chain": chain,
        "members": chain.len(),
        "total_bytes_transferred": total_bytes,
    })))
}

/// CBT change-ID lookup used by the capture agent before each incremental
/// disk. An empty string means no prior backup exists.
#[get("/backups/changeid?<vm_name>&<disk_id>")]
pub async fn get_change_id(
    state: &State<EngineState>,
    vm_name: String,
    disk_id: i32,
) -> Result<Json<Value>, ApiError> {
    let change_id =
        crate::orchestrator::changeid::get_previous_change_id(&state.pool, &vm_name, disk_id)
            .await?;
    Ok(Json(json!({ "change_id": change_id })))
}

#[get("/backups/<backup_id>")]
pub async fn get_backup(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    let job = queries::backup::get_job(&state.pool, backup_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backup not found: {}", backup_id)))?;

    let disks = queries::backup::list_disks(&state.pool, backup_id).await?;
    Ok(Json(json!({ "backup": job, "disks": disks })))
}

#[get("/backups/<backup_id>/disks")]
pub async fn get_backup_disks(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    if queries::backup::get_job(&state.pool, backup_id).await?.is_none() {
        return Err(ApiError::not_found(format!("backup not found: {}", backup_id)));
    }

    let disks = queries::backup::list_disks(&state.pool, backup_id).await?;
    let summaries: Vec<Value> = disks
        .iter()
        .map(|d| {
            json!({
                "disk_index": d.disk_index,
                "vmware_disk_key": d.vmware_disk_key,
                "size_gb": d.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                "qcow2_path": d.qcow2_path,
                "status": d.status,
            })
        })
        .collect();

    Ok(Json(json!(summaries)))
}

/// Agent completion callback. Disk IDs are integers; a string here is a
/// contract violation and fails deserialization up front.
#[derive(Debug, Deserialize)]
pub struct CompleteDiskBody {
    pub disk_id: i32,
    #[serde(default)]
    pub change_id: String,
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[post("/backups/<backup_id>/complete", format = "json", data = "<body>")]
pub async fn complete_disk(
    state: &State<EngineState>,
    backup_id: &str,
    body: Json<CompleteDiskBody>,
) -> Result<Json<Value>, ApiError> {
    if body.status.as_deref() == Some("failed") {
        let message = body
            .error_message
            .clone()
            .unwrap_or_else(|| "capture agent reported failure".to_string());
        state
            .orchestrator
            .report_disk_failure(backup_id, body.disk_id, &message)
            .await?;
        return Ok(Json(json!({
            "message": "disk failure recorded",
            "backup_id": backup_id,
            "disk_id": body.disk_id,
        })));
    }

    if body.change_id.is_empty() {
        return Err(ApiError::bad_request("change_id must not be empty"));
    }

    state
        .orchestrator
        .complete_disk(backup_id, body.disk_id, &body.change_id, body.bytes_transferred)
        .await?;

    Ok(Json(json!({
        "message": "disk completion recorded",
        "backup_id": backup_id,
        "disk_id": body.disk_id,
    })))
}

/// Advisory telemetry from the agent.
#[derive(Debug, Deserialize)]
pub struct ProgressBody {
    pub disk_id: i32,
    #[serde(default)]
    pub bytes_transferred: i64,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub phase: String,
}

#[post("/backups/<backup_id>/progress", format = "json", data = "<body>")]
pub async fn report_progress(
    state: &State<EngineState>,
    backup_id: &str,
    body: Json<ProgressBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .orchestrator
        .record_progress(
            backup_id,
            body.disk_id,
            body.bytes_transferred,
            body.percent,
            &body.phase,
        )
        .await?;

    Ok(Json(json!({ "message": "progress recorded" })))
}

#[post("/backups/<backup_id>/cancel")]
pub async fn cancel_backup(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.orchestrator.cancel_job(backup_id).await?;
    Ok(Json(json!({ "message": "backup cancelled", "backup_id": backup_id })))
}

/// Copy (3-2-1 replication) status of a backup.
#[get("/backups/<backup_id>/copies")]
pub async fn list_backup_copies(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    if queries::backup::get_job(&state.pool, backup_id).await?.is_none() {
        return Err(ApiError::not_found(format!("backup not found: {}", backup_id)));
    }

    let copies = queries::copy::list_for_backup(&state.pool, backup_id).await?;
    Ok(Json(json!({ "copies": copies, "total": copies.len() })))
}

/// Structural check of every completed QCOW2 of a backup, with the chain's
/// total on-disk footprint.
#[post("/backups/<backup_id>/verify")]
pub async fn verify_backup(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    use crate::qcow2::ImageManager;
    use std::path::Path;

    if queries::backup::get_job(&state.pool, backup_id).await?.is_none() {
        return Err(ApiError::not_found(format!("backup not found: {}", backup_id)));
    }

    let disks = queries::backup::list_disks(&state.pool, backup_id).await?;
    let images = ImageManager::new(std::time::Duration::from_secs(
        crate::config::SERVER_CONFIG.tool_setup_timeout_secs,
    ));

    let mut results = Vec::new();
    for disk in disks.iter().filter(|d| d.status == "completed") {
        let path = Path::new(&disk.qcow2_path);
        let (valid, error) = match images.verify(path).await {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let chain_bytes = images.chain_size(path).await.ok();
        results.push(json!({
            "disk_index": disk.disk_index,
            "qcow2_path": disk.qcow2_path,
            "valid": valid,
            "error": error,
            "chain_size_bytes": chain_bytes,
        }));
    }

    let all_valid = results
        .iter()
        .all(|r| r["valid"].as_bool().unwrap_or(false));
    Ok(Json(json!({
        "backup_id": backup_id,
        "valid": all_valid,
        "disks": results,
    })))
}

/// Delete a backup job and its files, newest chain member first. Retention
/// and chain-membership rules are enforced by the repository.
#[delete("/backups/<backup_id>")]
pub async fn delete_backup(
    state: &State<EngineState>,
    backup_id: &str,
) -> Result<Json<Value>, ApiError> {
    let job = queries::backup::get_job(&state.pool, backup_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backup not found: {}", backup_id)))?;

    let repository = state
        .registry
        .get(&job.repository_id)
        .ok_or_else(|| ApiError::not_found(format!("repository not found: {}", job.repository_id)))?;

    let mut disks = queries::backup::list_disks(&state.pool, backup_id).await?;
    disks.sort_by(|a, b| b.disk_index.cmp(&a.disk_index));

    for disk in &disks {
        if disk.status == "completed" {
            repository.delete_backup(&disk.id).await?;
        }
    }

    queries::backup::delete_job(&state.pool, backup_id).await?;
    Ok(Json(json!({ "message": "backup deleted", "backup_id": backup_id })))
}
