// nbd/server.rs
//
// qemu-nbd process manager: one server process per QCOW2 being written,
// tracked by port. Spawning and signalling happen outside the map lock.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

use super::NbdError;

/// Concurrent client connections each export tolerates. The capture agent
/// reads a disk with multiple threads, so this must stay at 10 or above.
const SHARED_CLIENTS: u32 = 10;

struct ServerHandle {
    child: Child,
    qcow2_path: String,
    export_name: String,
    dead: bool,
}

pub struct QemuNbdManager {
    servers: Mutex<HashMap<u16, ServerHandle>>,
    teardown_timeout: Duration,
}

impl QemuNbdManager {
    pub fn new(teardown_timeout: Duration) -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
            teardown_timeout,
        }
    }

    /// Launch a qemu-nbd server exporting `qcow2_path` read-write on
    /// `127.0.0.1:port`. A dead entry on the same port is replaced.
    pub fn start(
        &self,
        qcow2_path: &Path,
        port: u16,
        export_name: &str,
    ) -> Result<(), NbdError> {
        {
            let mut servers = self.servers.lock();
            match servers.get(&port) {
                Some(handle) if !handle.dead => return Err(NbdError::PortBusy(port)),
                Some(_) => {
                    servers.remove(&port);
                }
                None => {}
            }
        }

        let path_str = qcow2_path.to_string_lossy().to_string();
        let child = Command::new("qemu-nbd")
            .arg("-f")
            .arg("qcow2")
            .arg("-x")
            .arg(export_name)
            .arg("-p")
            .arg(port.to_string())
            .arg("-b")
            .arg("127.0.0.1")
            .arg(format!("--shared={}", SHARED_CLIENTS))
            .arg("-t")
            .arg(&path_str)
            .kill_on_drop(true)
            .spawn()
            .map_err(NbdError::Spawn)?;

        info!(
            "qemu-nbd up on 127.0.0.1:{} export={} file={}",
            port, export_name, path_str
        );

        self.servers.lock().insert(
            port,
            ServerHandle {
                child,
                qcow2_path: path_str,
                export_name: export_name.to_string(),
                dead: false,
            },
        );

        Ok(())
    }

    /// Stop the server on `port`: SIGTERM, bounded wait, SIGKILL on expiry.
    /// A port with no server is a no-op. Port release stays with the caller.
    pub async fn stop(&self, port: u16) {
        let handle = self.servers.lock().remove(&port);
        let Some(mut handle) = handle else {
            debug!("stop: no qemu-nbd on port {}", port);
            return;
        };

        if handle.dead {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = handle.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("SIGTERM to qemu-nbd pid {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(self.teardown_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                info!("qemu-nbd on port {} exited with {}", port, status);
            }
            Ok(Err(e)) => {
                error!("waiting for qemu-nbd on port {}: {}", port, e);
            }
            Err(_) => {
                warn!(
                    "qemu-nbd on port {} ignored SIGTERM for {:?}, killing",
                    port, self.teardown_timeout
                );
                if let Err(e) = handle.child.kill().await {
                    error!("SIGKILL of qemu-nbd on port {} failed: {}", port, e);
                }
            }
        }
    }

    /// Stop every tracked server (shutdown / job unwind sweep).
    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.servers.lock().keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }

    /// Reap exited children, marking their entries dead so a later `start`
    /// on the same port re-creates. Returns the ports that died.
    pub fn reap(&self) -> Vec<u16> {
        let mut died = Vec::new();
        let mut servers = self.servers.lock();

        for (port, handle) in servers.iter_mut() {
            if handle.dead {
                continue;
            }
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(
                        "qemu-nbd on port {} (export {}, file {}) exited early: {}",
                        port, handle.export_name, handle.qcow2_path, status
                    );
                    handle.dead = true;
                    died.push(*port);
                }
                Ok(None) => {}
                Err(e) => {
                    error!("try_wait on qemu-nbd port {}: {}", port, e);
                }
            }
        }

        died
    }

    pub fn live_count(&self) -> usize {
        self.servers.lock().values().filter(|h| !h.dead).count()
    }

    /// Background reaper loop; one per process.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                manager.reap();
            }
        })
    }
}
