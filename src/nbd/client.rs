// nbd/client.rs
//
// qemu-nbd client-mode attach/detach for restore mounts. These are
// short-lived invocations, unlike the tracked server processes.

use std::path::Path;
use std::time::Duration;

use super::NbdError;
use crate::tools;

/// Attach `qcow2_path` read-only to an NBD client device.
pub async fn connect_readonly(
    device: &str,
    qcow2_path: &Path,
    timeout: Duration,
) -> Result<(), NbdError> {
    let path_str = qcow2_path.to_string_lossy();
    tools::run(
        "qemu-nbd",
        &[
            "--connect", device, "--read-only", "-f", "qcow2", &path_str,
        ],
        timeout,
    )
    .await?;
    Ok(())
}

/// Detach an NBD client device. Safe to call on an already-detached device;
/// qemu-nbd treats that as success.
pub async fn disconnect(device: &str, timeout: Duration) -> Result<(), NbdError> {
    tools::run("qemu-nbd", &["--disconnect", device], timeout).await?;
    Ok(())
}
