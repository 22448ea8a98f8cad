// copyengine/mod.rs
//
// 3-2-1 replication workers. A fixed pool polls the backup_copies queue,
// copies every disk file of a completed backup to the destination
// repository, and verifies both sides with a streamed SHA-256 before the
// item may complete. Copy failures never touch the source backup.

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use sqlx::{MySql, Pool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::db::queries;
use crate::db::tables::BackupCopy;
use crate::repository::RepositoryRegistry;

pub struct CopyEngine {
    pool: Pool<MySql>,
    registry: Arc<RepositoryRegistry>,
    workers: usize,
    poll_interval: Duration,
}

impl CopyEngine {
    pub fn new(
        pool: Pool<MySql>,
        registry: Arc<RepositoryRegistry>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            workers: workers.max(1),
            poll_interval,
        }
    }

    /// Launch the worker pool.
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.worker_loop(worker_id).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize) {
        info!("copy worker {} up", worker_id);
        loop {
            let claimed = match queries::copy::claim_next_pending(&self.pool).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!("copy worker {}: queue poll failed: {}", worker_id, e);
                    None
                }
            };

            match claimed {
                Some(copy) => {
                    let copy_id = copy.id.clone();
                    if let Err(e) = self.process(copy).await {
                        error!("copy worker {}: item {} failed: {:#}", worker_id, copy_id, e);
                        if let Err(db_err) =
                            queries::copy::set_failed(&self.pool, &copy_id, &format!("{:#}", e))
                                .await
                        {
                            error!("copy worker {}: recording failure: {}", worker_id, db_err);
                        }
                    }
                }
                None => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Copy one backup (all of its completed disk files) to the destination
    /// repository and verify. Verification happens synchronously inside the
    /// job so an immutability grace period can never race it.
    async fn process(&self, copy: BackupCopy) -> Result<()> {
        info!(
            "copying backup {} to repository {}",
            copy.source_backup_id, copy.destination_repository_id
        );

        let job = queries::backup::get_job(&self.pool, &copy.source_backup_id)
            .await?
            .context("source backup vanished")?;

        let disks = queries::backup::list_disks(&self.pool, &job.id).await?;
        let completed: Vec<_> = disks.iter().filter(|d| d.status == "completed").collect();
        if completed.is_empty() {
            bail!("source backup {} has no completed disks", job.id);
        }

        let destination = self
            .registry
            .get(&copy.destination_repository_id)
            .with_context(|| {
                format!(
                    "destination repository {} not registered",
                    copy.destination_repository_id
                )
            })?;
        destination.ensure_ready().await?;

        let dest_base = destination.base_path().join(&job.context_id);
        let mut pairs: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(completed.len());

        for disk in &completed {
            let source = PathBuf::from(&disk.qcow2_path);
            let file_name = source
                .file_name()
                .with_context(|| format!("source path has no file name: {}", disk.qcow2_path))?;
            let dest_dir = dest_base.join(format!("disk-{}", disk.disk_index));
            tokio::fs::create_dir_all(&dest_dir).await?;
            let dest = dest_dir.join(file_name);

            let bytes = copy_file(&source, &dest)
                .await
                .with_context(|| format!("copying {}", source.display()))?;
            info!("copied {} ({} bytes)", dest.display(), bytes);

            pairs.push((source, dest));
        }

        queries::copy::set_verifying(&self.pool, &copy.id, &dest_base.to_string_lossy()).await?;

        let mut verified = false;
        if copy.verify_after_copy {
            for (source, dest) in &pairs {
                let source_hash = hash_file(source).await?;
                let dest_hash = hash_file(dest).await?;
                if source_hash != dest_hash {
                    bail!(
                        "checksum mismatch for {}: {} != {}",
                        dest.display(),
                        source_hash,
                        dest_hash
                    );
                }
            }
            verified = true;
        }

        queries::copy::set_completed(&self.pool, &copy.id, verified).await?;
        info!(
            "copy {} completed ({} files, verified: {})",
            copy.id,
            pairs.len(),
            verified
        );

        Ok(())
    }
}

/// Copy a file preferring a copy-on-write link (`cp --reflink=auto` falls
/// back to a byte copy on filesystems without reflink support); if the tool
/// itself is unavailable, stream the bytes. No timeout: data copies are
/// bounded only by their size.
pub async fn copy_file(source: &Path, dest: &Path) -> std::io::Result<u64> {
    let status = Command::new("cp")
        .arg("--reflink=auto")
        .arg(source)
        .arg(dest)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            let metadata = tokio::fs::metadata(dest).await?;
            Ok(metadata.len())
        }
        Ok(status) => {
            warn!(
                "cp --reflink=auto exited {:?} for {}, falling back to byte copy",
                status.code(),
                source.display()
            );
            tokio::fs::copy(source, dest).await
        }
        Err(e) => {
            warn!("cp unavailable ({}), falling back to byte copy", e);
            tokio::fs::copy(source, dest).await
        }
    }
}

/// Streamed SHA-256 of a file, hex-encoded.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let hash = hash_file(&path).await.unwrap();
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn copy_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.qcow2");
        let dest = dir.path().join("dst.qcow2");
        tokio::fs::write(&source, vec![7u8; 8192]).await.unwrap();

        let bytes = copy_file(&source, &dest).await.unwrap();
        assert_eq!(bytes, 8192);
        assert_eq!(
            hash_file(&source).await.unwrap(),
            hash_file(&dest).await.unwrap()
        );
    }

    #[tokio::test]
    async fn identical_then_diverged_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        tokio::fs::write(&a, b"payload").await.unwrap();
        tokio::fs::write(&b, b"payload").await.unwrap();
        assert_eq!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());

        tokio::fs::write(&b, b"payloae").await.unwrap();
        assert_ne!(hash_file(&a).await.unwrap(), hash_file(&b).await.unwrap());
    }
}
