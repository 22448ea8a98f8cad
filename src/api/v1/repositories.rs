//! Repository API: registration, capacity probes and guarded deletion.

use chrono::Utc;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, put, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::ApiError;
use crate::db::queries;
use crate::db::tables::RepositoryRecord;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryBody {
    pub name: String,
    pub kind: String, // 'local' | 'nfs' | 'cifs'
    pub base_path: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub export_path: Option<String>,
    #[serde(default)]
    pub mount_options: Option<String>,
    #[serde(default)]
    pub nfs_version: Option<String>,
    #[serde(default)]
    pub cifs_username: Option<String>,
    #[serde(default)]
    pub cifs_password_ref: Option<String>,
    #[serde(default)]
    pub immutability_enabled: bool,
    #[serde(default)]
    pub min_retention_days: i32,
    #[serde(default)]
    pub grace_period_hours: i32,
}

#[post("/repositories", format = "json", data = "<body>")]
pub async fn create_repository(
    state: &State<EngineState>,
    body: Json<CreateRepositoryBody>,
) -> Result<Json<Value>, ApiError> {
    match body.kind.as_str() {
        "local" => {}
        "nfs" | "cifs" => {
            if body.server.is_none() || body.export_path.is_none() {
                return Err(ApiError::bad_request(
                    "network repositories require server and export_path",
                ));
            }
        }
        other => return Err(ApiError::bad_request(format!("invalid repository kind: {}", other))),
    }

    if queries::repository::get_repository_by_name(&state.pool, &body.name)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "a repository named '{}' already exists",
            body.name
        )));
    }

    let record = RepositoryRecord {
        id: format!("repo-{}", &Uuid::new_v4().simple().to_string()[..12]),
        name: body.name.clone(),
        kind: body.kind.clone(),
        base_path: body.base_path.clone(),
        server: body.server.clone(),
        export_path: body.export_path.clone(),
        mount_options: body.mount_options.clone(),
        nfs_version: body.nfs_version.clone(),
        cifs_username: body.cifs_username.clone(),
        cifs_password_ref: body.cifs_password_ref.clone(),
        immutability_enabled: body.immutability_enabled,
        min_retention_days: body.min_retention_days,
        grace_period_hours: body.grace_period_hours,
        total_bytes: 0,
        used_bytes: 0,
        available_bytes: 0,
        last_check_at: None,
        created_at: Utc::now(),
    };

    queries::repository::create_repository(&state.pool, &record).await?;
    state.registry.register(record.clone());

    Ok(Json(json!(record)))
}

#[get("/repositories")]
pub async fn list_repositories(state: &State<EngineState>) -> Result<Json<Value>, ApiError> {
    let repositories = queries::repository::list_repositories(&state.pool).await?;
    Ok(Json(json!({ "repositories": repositories, "total": repositories.len() })))
}

#[get("/repositories/<repository_id>")]
pub async fn get_repository(
    state: &State<EngineState>,
    repository_id: &str,
) -> Result<Json<Value>, ApiError> {
    let record = queries::repository::get_repository(&state.pool, repository_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository not found: {}", repository_id)))?;
    Ok(Json(json!(record)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRepositoryBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mount_options: Option<String>,
    #[serde(default)]
    pub immutability_enabled: Option<bool>,
    #[serde(default)]
    pub min_retention_days: Option<i32>,
    #[serde(default)]
    pub grace_period_hours: Option<i32>,
}

/// Update mutable repository settings and rebuild the live variant (the
/// immutability wrapper is composed at registration time).
#[put("/repositories/<repository_id>", format = "json", data = "<body>")]
pub async fn update_repository(
    state: &State<EngineState>,
    repository_id: &str,
    body: Json<UpdateRepositoryBody>,
) -> Result<Json<Value>, ApiError> {
    let mut record = queries::repository::get_repository(&state.pool, repository_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository not found: {}", repository_id)))?;

    if let Some(name) = &body.name {
        if let Some(taken) = queries::repository::get_repository_by_name(&state.pool, name).await? {
            if taken.id != record.id {
                return Err(ApiError::conflict(format!(
                    "a repository named '{}' already exists",
                    name
                )));
            }
        }
        record.name = name.clone();
    }
    if let Some(options) = &body.mount_options {
        record.mount_options = Some(options.clone());
    }
    if let Some(enabled) = body.immutability_enabled {
        record.immutability_enabled = enabled;
    }
    if let Some(days) = body.min_retention_days {
        record.min_retention_days = days;
    }
    if let Some(hours) = body.grace_period_hours {
        record.grace_period_hours = hours;
    }

    queries::repository::update_repository(&state.pool, &record).await?;
    state.registry.register(record.clone());

    Ok(Json(json!(record)))
}

#[get("/repositories/<repository_id>/storage-info")]
pub async fn storage_info(
    state: &State<EngineState>,
    repository_id: &str,
) -> Result<Json<Value>, ApiError> {
    let repository = state
        .registry
        .get(repository_id)
        .ok_or_else(|| ApiError::not_found(format!("repository not found: {}", repository_id)))?;

    let info = repository.storage_info().await?;
    Ok(Json(json!(info)))
}

/// Reachability probe: mount if needed, write and delete a probe file,
/// report capacity.
#[post("/repositories/<repository_id>/test")]
pub async fn test_repository(
    state: &State<EngineState>,
    repository_id: &str,
) -> Result<Json<Value>, ApiError> {
    let repository = state
        .registry
        .get(repository_id)
        .ok_or_else(|| ApiError::not_found(format!("repository not found: {}", repository_id)))?;

    repository.ensure_ready().await?;

    let probe = repository
        .base_path()
        .join(format!(".palisade-probe-{}", Uuid::new_v4().simple()));
    let writable = match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    };

    let info = repository.storage_info().await?;
    Ok(Json(json!({
        "repository_id": repository_id,
        "reachable": true,
        "writable": writable,
        "storage": info,
    })))
}

/// Backup contexts anchored in a repository.
#[get("/repositories/<repository_id>/contexts")]
pub async fn list_repository_contexts(
    state: &State<EngineState>,
    repository_id: &str,
) -> Result<Json<Value>, ApiError> {
    if queries::repository::get_repository(&state.pool, repository_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(format!("repository not found: {}", repository_id)));
    }

    let contexts =
        queries::context::list_contexts_for_repository(&state.pool, repository_id).await?;
    Ok(Json(json!({ "contexts": contexts, "total": contexts.len() })))
}

/// Deleting a repository requires it to hold no backups or contexts.
#[delete("/repositories/<repository_id>")]
pub async fn delete_repository(
    state: &State<EngineState>,
    repository_id: &str,
) -> Result<Json<Value>, ApiError> {
    if queries::repository::get_repository(&state.pool, repository_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(format!("repository not found: {}", repository_id)));
    }

    let backups = queries::backup::count_jobs_for_repository(&state.pool, repository_id).await?;
    if backups > 0 {
        return Err(ApiError::conflict(format!(
            "repository still holds {} backups",
            backups
        )));
    }

    let contexts = queries::context::count_contexts_for_repository(&state.pool, repository_id).await?;
    if contexts > 0 {
        return Err(ApiError::conflict(format!(
            "repository still anchors {} backup contexts",
            contexts
        )));
    }

    state.registry.unregister(repository_id);
    if let Err(e) = state.registry.mounts().unmount(repository_id).await {
        log::warn!("unmounting deleted repository {}: {}", repository_id, e);
    }
    queries::repository::delete_repository(&state.pool, repository_id).await?;

    Ok(Json(json!({ "message": "repository deleted", "repository_id": repository_id })))
}
