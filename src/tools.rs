// tools.rs
//
// Shared runner for the helper binaries the hub drives (qemu-img, qemu-nbd,
// mount, umount, lsblk, chattr). Every invocation is bounded by an explicit
// timeout; locks are never held across these calls.

use log::debug;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{program} exited with code {code}: {stderr}")]
    NonZero {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{program} did not finish within {timeout_secs}s")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run a helper binary to completion, capturing output. Non-zero exit is an
/// error carrying the exit code and stderr.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<Output, ToolError> {
    let output = run_unchecked(program, args, timeout).await?;

    if !output.status.success() {
        return Err(ToolError::NonZero {
            program: program.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

/// Run a helper binary and hand back the raw output whatever the exit
/// status. `qemu-img check` encodes its findings in the exit code, so some
/// callers interpret non-zero themselves.
pub async fn run_unchecked(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output, ToolError> {
    debug!("exec: {} {}", program, args.join(" "));

    let future = Command::new(program).args(args).output();

    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ToolError::Timeout {
            program: program.to_string(),
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })
}
