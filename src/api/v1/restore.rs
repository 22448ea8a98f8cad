//! Restore API: mount a completed backup disk, browse its partitions,
//! stream files and directory archives, and release the mount.

use rocket::http::ContentType;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use serde::Deserialize;
use std::path::PathBuf;

use crate::api::ApiError;
use crate::restore::archive::{self, ArchiveFormat};
use crate::restore::RestoreError;
use crate::state::EngineState;

#[derive(Debug, Deserialize)]
pub struct MountBody {
    pub backup_id: String,
    pub disk_index: i32,
}

#[post("/restore/mount", format = "json", data = "<body>")]
pub async fn mount_backup(
    state: &State<EngineState>,
    body: Json<MountBody>,
) -> Result<Json<Value>, ApiError> {
    let mount = state.restore.mount(&body.backup_id, body.disk_index).await?;
    Ok(Json(json!(mount)))
}

#[get("/restore/mounts")]
pub async fn list_mounts(state: &State<EngineState>) -> Result<Json<Value>, ApiError> {
    let mounts = state.restore.list_mounts().await?;
    Ok(Json(json!({ "mounts": mounts, "count": mounts.len() })))
}

#[get("/restore/<mount_id>/files?<path>")]
pub async fn list_files(
    state: &State<EngineState>,
    mount_id: &str,
    path: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let path = path.unwrap_or_else(|| "/".to_string());
    let files = state.restore.list_files(mount_id, &path).await?;
    Ok(Json(json!({
        "mount_id": mount_id,
        "path": path,
        "files": files,
        "count": files.len(),
    })))
}

#[get("/restore/<mount_id>/file-info?<path>")]
pub async fn file_info(
    state: &State<EngineState>,
    mount_id: &str,
    path: String,
) -> Result<Json<Value>, ApiError> {
    let info = state.restore.file_info(mount_id, &path).await?;
    Ok(Json(json!(info)))
}

/// Streaming body with a `Content-Disposition: attachment` header.
pub struct FileAttachment {
    file: tokio::fs::File,
    len: u64,
    filename: String,
    content_type: ContentType,
}

impl<'r> Responder<'r, 'static> for FileAttachment {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(self.content_type)
            .raw_header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", self.filename),
            )
            .sized_body(Some(self.len as usize), self.file)
            .ok()
    }
}

#[get("/restore/<mount_id>/download?<path>")]
pub async fn download_file(
    state: &State<EngineState>,
    mount_id: &str,
    path: String,
) -> Result<FileAttachment, ApiError> {
    let resolved: PathBuf = state.restore.resolve_file(mount_id, &path).await?;

    let file = tokio::fs::File::open(&resolved)
        .await
        .map_err(RestoreError::from)?;
    let len = file.metadata().await.map_err(RestoreError::from)?.len();
    let filename = resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    Ok(FileAttachment {
        file,
        len,
        filename,
        content_type: ContentType::Binary,
    })
}

/// Archive body streamed while the writer produces it, with attachment
/// headers. No Content-Length: the total size is unknown up front.
pub struct ArchiveAttachment {
    body: archive::ArchiveStream,
    filename: String,
    content_type: &'static str,
}

impl<'r> Responder<'r, 'static> for ArchiveAttachment {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .raw_header("Content-Type", self.content_type)
            .raw_header(
                "Content-Disposition",
                format!("attachment; filename=\"{}\"", self.filename),
            )
            .streamed_body(self.body)
            .ok()
    }
}

#[get("/restore/<mount_id>/download-directory?<path>&<format>")]
pub async fn download_directory(
    state: &State<EngineState>,
    mount_id: &str,
    path: String,
    format: Option<String>,
) -> Result<ArchiveAttachment, ApiError> {
    let format_str = format.unwrap_or_else(|| "zip".to_string());
    let archive_format = ArchiveFormat::parse(&format_str)
        .ok_or_else(|| ApiError::from(RestoreError::BadArchiveFormat(format_str)))?;

    let resolved = state.restore.resolve_directory(mount_id, &path).await?;

    let dir_name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());

    let body = archive::stream_archive(resolved, dir_name.clone(), archive_format);

    Ok(ArchiveAttachment {
        body,
        filename: format!("{}.{}", dir_name, archive_format.extension()),
        content_type: archive_format.content_type(),
    })
}

#[delete("/restore/<mount_id>")]
pub async fn unmount_backup(
    state: &State<EngineState>,
    mount_id: &str,
) -> Result<Json<Value>, ApiError> {
    state.restore.unmount(mount_id).await?;
    Ok(Json(json!({ "message": "restore mount released", "mount_id": mount_id })))
}
