// orchestrator/agent.rs
//
// HTTP client for the remote capture agent. The agent reads VMware disks
// via VDDK and writes them into the NBD exports the hub has prepared; all
// we do here is hand it the job description and survive transient network
// trouble with bounded retries.

use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("capture agent unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    #[error("capture agent rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Job description submitted to the agent. `nbd_targets` is the
/// comma-separated `{vmware_disk_key}:nbd://host:port/export` list covering
/// every disk of the job.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStartRequest {
    pub job_id: String,
    pub vm_name: String,
    pub vcenter_host: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub vm_path: String,
    pub nbd_targets: String,
    pub backup_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_change_id: Option<String>,
}

#[derive(Clone)]
pub struct AgentClient {
    base_url: String,
    http: reqwest::Client,
    attempts: u32,
}

impl AgentClient {
    pub fn new(base_url: &str, attempts: u32, deadline: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .unwrap_or_default();

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            attempts: attempts.max(1),
        }
    }

    /// Submit a backup job. Transient transport errors and 5xx responses are
    /// retried with exponential backoff and jitter; 4xx responses surface
    /// immediately.
    pub async fn start_backup(&self, request: &BackupStartRequest) -> Result<(), AgentError> {
        let url = format!("{}/api/v1/backup/start", self.base_url);
        let mut last_error = String::new();

        for attempt in 0..self.attempts {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * (1u64 << attempt));
                let jitter = Duration::from_millis(rand::rng().random_range(0..250));
                warn!(
                    "agent start_backup attempt {} failed ({}), retrying in {:?}",
                    attempt, last_error, backoff + jitter
                );
                tokio::time::sleep(backoff + jitter).await;
            }

            match self.http.post(&url).json(request).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "capture agent accepted job {} ({} targets)",
                        request.job_id,
                        request.nbd_targets.split(',').count()
                    );
                    return Ok(());
                }
                Ok(response) if response.status().is_client_error() => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::Rejected { status, body });
                }
                Ok(response) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(AgentError::Unreachable {
            attempts: self.attempts,
            last_error,
        })
    }

    /// Best-effort cancellation notice; failures are logged, not surfaced.
    pub async fn cancel_backup(&self, job_id: &str) {
        let url = format!("{}/api/v1/backup/{}/cancel", self.base_url, job_id);
        if let Err(e) = self.http.post(&url).send().await {
            warn!("agent cancel for job {} failed: {}", job_id, e);
        }
    }

    /// Liveness probe used by the startup reconciliation pass.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/v1/health", self.base_url);
        matches!(
            self.http.get(&url).send().await,
            Ok(response) if response.status().is_success()
        )
    }
}
