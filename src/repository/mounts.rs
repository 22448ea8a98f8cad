// repository/mounts.rs
//
// Mount manager for network repositories. Mounts are acquired lazily on
// first use, shared through a reference count, and adopted when the target
// is already mounted (a restarted hub must not double-mount).

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::RepositoryError;
use crate::tools;

struct MountState {
    mountpoint: PathBuf,
    refcount: usize,
    mounted: bool,
}

pub struct MountManager {
    mounts: Mutex<HashMap<String, MountState>>,
    setup_timeout: Duration,
    teardown_timeout: Duration,
}

/// What to mount and how; built by the store from its repository record.
#[derive(Debug, Clone)]
pub enum MountSpec {
    Nfs {
        server: String,
        export_path: String,
        version: String,
        options: String,
    },
    Cifs {
        server: String,
        share: String,
        username: String,
        password_ref: String,
        options: String,
    },
}

impl MountManager {
    pub fn new(setup_timeout: Duration, teardown_timeout: Duration) -> Self {
        Self {
            mounts: Mutex::new(HashMap::new()),
            setup_timeout,
            teardown_timeout,
        }
    }

    /// Acquire the mount for `repo_id`, mounting on first use. The returned
    /// guard holds one reference; `unmount` refuses while any guard lives.
    pub async fn acquire(
        self: &Arc<Self>,
        repo_id: &str,
        mountpoint: &Path,
        spec: &MountSpec,
    ) -> Result<MountGuard, RepositoryError> {
        let needs_mount = {
            let mut mounts = self.mounts.lock();
            let state = mounts.entry(repo_id.to_string()).or_insert(MountState {
                mountpoint: mountpoint.to_path_buf(),
                refcount: 0,
                mounted: false,
            });
            state.refcount += 1;
            !state.mounted
        };

        if needs_mount {
            if let Err(e) = self.mount(repo_id, mountpoint, spec).await {
                self.drop_ref(repo_id);
                return Err(e);
            }
        }

        Ok(MountGuard {
            manager: Arc::clone(self),
            repo_id: repo_id.to_string(),
        })
    }

    async fn mount(
        &self,
        repo_id: &str,
        mountpoint: &Path,
        spec: &MountSpec,
    ) -> Result<(), RepositoryError> {
        std::fs::create_dir_all(mountpoint)?;

        if self.is_mounted(mountpoint) {
            info!(
                "repository {}: {} already mounted, adopting",
                repo_id,
                mountpoint.display()
            );
            self.mark_mounted(repo_id);
            return Ok(());
        }

        let target = mountpoint.to_string_lossy().to_string();
        match spec {
            MountSpec::Nfs {
                server,
                export_path,
                version,
                options,
            } => {
                let source = format!("{}:{}", server, export_path);
                let mut opts = format!("vers={}", version);
                if !options.is_empty() {
                    opts.push(',');
                    opts.push_str(options);
                }
                info!("mounting NFS {} on {}", source, target);
                tools::run(
                    "mount",
                    &["-t", "nfs", "-o", &opts, &source, &target],
                    self.setup_timeout,
                )
                .await
                .map_err(|e| RepositoryError::MountFailed(e.to_string()))?;
            }
            MountSpec::Cifs {
                server,
                share,
                username,
                password_ref,
                options,
            } => {
                let source = format!("//{}/{}", server, share.trim_start_matches('/'));
                // the credentials file is materialized by the secret store;
                // we only ever pass its path
                let mut opts = format!("username={},credentials={}", username, password_ref);
                if !options.is_empty() {
                    opts.push(',');
                    opts.push_str(options);
                }
                info!("mounting CIFS {} on {}", source, target);
                tools::run(
                    "mount",
                    &["-t", "cifs", "-o", &opts, &source, &target],
                    self.setup_timeout,
                )
                .await
                .map_err(|e| RepositoryError::MountFailed(e.to_string()))?;
            }
        }

        self.mark_mounted(repo_id);
        Ok(())
    }

    fn mark_mounted(&self, repo_id: &str) {
        if let Some(state) = self.mounts.lock().get_mut(repo_id) {
            state.mounted = true;
        }
    }

    fn drop_ref(&self, repo_id: &str) {
        if let Some(state) = self.mounts.lock().get_mut(repo_id) {
            state.refcount = state.refcount.saturating_sub(1);
        }
    }

    /// Unmount a repository target. Refuses while references are live.
    pub async fn unmount(&self, repo_id: &str) -> Result<(), RepositoryError> {
        let mountpoint = {
            let mounts = self.mounts.lock();
            let Some(state) = mounts.get(repo_id) else {
                return Ok(());
            };
            if state.refcount > 0 {
                return Err(RepositoryError::Busy(format!(
                    "{} operations still reference the mount",
                    state.refcount
                )));
            }
            if !state.mounted {
                return Ok(());
            }
            state.mountpoint.clone()
        };

        let target = mountpoint.to_string_lossy().to_string();
        tools::run("umount", &[&target], self.teardown_timeout)
            .await
            .map_err(|e| RepositoryError::MountFailed(e.to_string()))?;

        if let Some(state) = self.mounts.lock().get_mut(repo_id) {
            state.mounted = false;
        }
        info!("unmounted repository {} ({})", repo_id, target);
        Ok(())
    }

    /// Whether `mountpoint` appears in the kernel mount table.
    pub fn is_mounted(&self, mountpoint: &Path) -> bool {
        match std::fs::read_to_string("/proc/mounts") {
            Ok(table) => mount_table_contains(&table, mountpoint),
            Err(e) => {
                warn!("reading /proc/mounts: {}", e);
                false
            }
        }
    }
}

/// Parse the kernel mount table for an exact mountpoint match. Mountpoints
/// with spaces appear octal-escaped (`\040`), which never collides with a
/// literal comparison of our escaped form.
pub fn mount_table_contains(table: &str, mountpoint: &Path) -> bool {
    let needle = mountpoint.to_string_lossy().replace(' ', "\\040");
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mp| mp == needle)
}

/// RAII reference to a repository mount.
pub struct MountGuard {
    manager: Arc<MountManager>,
    repo_id: String,
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.manager.drop_ref(&self.repo_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec 0 0
/dev/sda1 / ext4 rw,relatime 0 0
10.0.0.5:/exports/backups /mnt/palisade/nfs-1 nfs4 rw,vers=4.1 0 0
//10.0.0.9/backups /mnt/palisade/cifs\\0401 cifs rw 0 0
";

    #[test]
    fn finds_exact_mountpoint() {
        assert!(mount_table_contains(TABLE, Path::new("/mnt/palisade/nfs-1")));
        assert!(mount_table_contains(TABLE, Path::new("/")));
    }

    #[test]
    fn does_not_match_prefixes() {
        assert!(!mount_table_contains(TABLE, Path::new("/mnt/palisade")));
        assert!(!mount_table_contains(TABLE, Path::new("/mnt/palisade/nfs")));
    }

    #[test]
    fn matches_escaped_spaces() {
        assert!(mount_table_contains(TABLE, Path::new("/mnt/palisade/cifs 1")));
    }
}
