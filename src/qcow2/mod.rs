// qcow2/mod.rs
//
// QCOW2 chain manager. All image files are created and inspected through
// qemu-img; the backing-file reference inside the QCOW2 header is the only
// source of truth for chain linkage.

use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::tools::{self, ToolError};

#[derive(Error, Debug)]
pub enum Qcow2Error {
    #[error("image not found: {0}")]
    NotFound(PathBuf),

    #[error("backing file not found: {0}")]
    BackingMissing(PathBuf),

    #[error("{0} is not a QCOW2 image (format: {1})")]
    NotQcow2(PathBuf, String),

    #[error("image is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to parse qemu-img output: {0}")]
    Parse(String),

    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Parsed subset of `qemu-img info --output=json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,

    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,

    pub format: String,

    #[serde(rename = "backing-filename")]
    pub backing_file: Option<String>,

    #[serde(rename = "backing-filename-format")]
    pub backing_format: Option<String>,
}

pub fn parse_image_info(raw: &str) -> Result<ImageInfo, Qcow2Error> {
    serde_json::from_str(raw).map_err(|e| Qcow2Error::Parse(e.to_string()))
}

/// Thin wrapper around qemu-img for creating and validating chain members.
#[derive(Clone)]
pub struct ImageManager {
    qemu_img: String,
    timeout: Duration,
}

impl ImageManager {
    pub fn new(setup_timeout: Duration) -> Self {
        Self {
            qemu_img: "qemu-img".to_string(),
            timeout: setup_timeout,
        }
    }

    /// Materialize a new full QCOW2 of the declared virtual size.
    pub async fn create_full(&self, path: &Path, size_bytes: u64) -> Result<(), Qcow2Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Qcow2Error::Parse(format!("mkdir {}: {}", parent.display(), e)))?;
        }

        let path_str = path.to_string_lossy();
        let size = size_bytes.to_string();
        tools::run(
            &self.qemu_img,
            &["create", "-f", "qcow2", &path_str, &size],
            self.timeout,
        )
        .await?;

        info!("Created full QCOW2 {} ({} bytes virtual)", path.display(), size_bytes);
        Ok(())
    }

    /// Materialize an incremental QCOW2 layered on `backing_path`. The
    /// backing image must exist and must itself be QCOW2.
    pub async fn create_incremental(
        &self,
        path: &Path,
        backing_path: &Path,
    ) -> Result<(), Qcow2Error> {
        if !backing_path.exists() {
            return Err(Qcow2Error::BackingMissing(backing_path.to_path_buf()));
        }

        let backing_info = self.info(backing_path).await?;
        if backing_info.format != "qcow2" {
            return Err(Qcow2Error::NotQcow2(
                backing_path.to_path_buf(),
                backing_info.format,
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Qcow2Error::Parse(format!("mkdir {}: {}", parent.display(), e)))?;
        }

        let path_str = path.to_string_lossy();
        let backing_str = backing_path.to_string_lossy();
        tools::run(
            &self.qemu_img,
            &[
                "create", "-f", "qcow2", "-b", &backing_str, "-F", "qcow2", &path_str,
            ],
            self.timeout,
        )
        .await?;

        info!(
            "Created incremental QCOW2 {} backed by {}",
            path.display(),
            backing_path.display()
        );
        Ok(())
    }

    /// Inspect an image via `qemu-img info --output=json`.
    pub async fn info(&self, path: &Path) -> Result<ImageInfo, Qcow2Error> {
        if !path.exists() {
            return Err(Qcow2Error::NotFound(path.to_path_buf()));
        }

        let path_str = path.to_string_lossy();
        let output = tools::run(
            &self.qemu_img,
            &["info", "--output=json", &path_str],
            self.timeout,
        )
        .await?;

        parse_image_info(&String::from_utf8_lossy(&output.stdout))
    }

    /// Structural check. qemu-img exits 2 on corruption and 3 on leaked
    /// clusters; leaks are tolerable for a backup target, corruption is not.
    pub async fn verify(&self, path: &Path) -> Result<(), Qcow2Error> {
        if !path.exists() {
            return Err(Qcow2Error::NotFound(path.to_path_buf()));
        }

        let path_str = path.to_string_lossy();
        let output = tools::run_unchecked(
            &self.qemu_img,
            &["check", &path_str],
            self.timeout,
        )
        .await?;

        match output.status.code() {
            Some(0) | Some(3) => Ok(()),
            Some(code) => Err(Qcow2Error::Corrupt(format!(
                "qemu-img check exited {}: {}",
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            None => Err(Qcow2Error::Corrupt("qemu-img check was killed".to_string())),
        }
    }

    /// Total on-disk size of the chain rooted at `path`, walking backing
    /// references down to the full image.
    pub async fn chain_size(&self, path: &Path) -> Result<u64, Qcow2Error> {
        let mut total = 0u64;
        let mut cursor = Some(path.to_path_buf());
        let mut hops = 0;

        while let Some(current) = cursor {
            // a cycle in backing references would be corruption
            hops += 1;
            if hops > 1024 {
                return Err(Qcow2Error::Corrupt(format!(
                    "backing chain of {} exceeds 1024 members",
                    path.display()
                )));
            }

            let info = self.info(&current).await?;
            total += info.actual_size;
            debug!(
                "chain member {} actual={} backing={:?}",
                current.display(),
                info.actual_size,
                info.backing_file
            );
            cursor = info.backing_file.map(PathBuf::from);
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_image_info() {
        let raw = r#"{
            "virtual-size": 107374182400,
            "filename": "/repo/ctx-1/disk-0/backup-pgtest1-disk0-20250101-000000.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 1978368,
            "dirty-flag": false
        }"#;

        let info = parse_image_info(raw).unwrap();
        assert_eq!(info.virtual_size, 107374182400);
        assert_eq!(info.actual_size, 1978368);
        assert_eq!(info.format, "qcow2");
        assert!(info.backing_file.is_none());
        assert!(info.backing_format.is_none());
    }

    #[test]
    fn parses_incremental_image_info() {
        let raw = r#"{
            "virtual-size": 5368709120,
            "filename": "/repo/ctx-1/disk-1/backup-pgtest1-disk1-20250102-000000.qcow2",
            "format": "qcow2",
            "actual-size": 262144,
            "backing-filename": "/repo/ctx-1/disk-1/backup-pgtest1-disk1-20250101-000000.qcow2",
            "backing-filename-format": "qcow2",
            "full-backing-filename": "/repo/ctx-1/disk-1/backup-pgtest1-disk1-20250101-000000.qcow2"
        }"#;

        let info = parse_image_info(raw).unwrap();
        assert_eq!(
            info.backing_file.as_deref(),
            Some("/repo/ctx-1/disk-1/backup-pgtest1-disk1-20250101-000000.qcow2")
        );
        assert_eq!(info.backing_format.as_deref(), Some("qcow2"));
    }

    #[test]
    fn rejects_malformed_info() {
        assert!(parse_image_info("not json").is_err());
        assert!(parse_image_info(r#"{"format": "qcow2"}"#).is_err());
    }
}
