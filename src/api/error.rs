// api/error.rs
//
// Uniform error body for the REST surface: {error, message, details?} with
// an HTTP status matching the error kind. Subsystem errors convert into
// this responder so route handlers can use `?` throughout.

use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use serde_json::{json, Value};
use std::io::Cursor;

use crate::flows::FlowError;
use crate::nbd::NbdError;
use crate::orchestrator::{AgentError, OrchestratorError};
use crate::repository::RepositoryError;
use crate::restore::RestoreError;
use crate::scheduler::SchedulerError;

#[derive(Debug)]
pub struct ApiError {
    pub status: Status,
    pub error: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: Status, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(Status::BadRequest, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Status::NotFound, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(Status::Conflict, "conflict", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Status::ServiceUnavailable, "resource_exhausted", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::InternalServerError, "internal", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        let mut body = json!({
            "error": self.error,
            "message": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        let serialized = body.to_string();

        Response::build()
            .status(self.status)
            .header(ContentType::JSON)
            .sized_body(serialized.len(), Cursor::new(serialized))
            .ok()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::internal(format!("database error: {}", e))
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match &e {
            RepositoryError::NotFound(_) => ApiError::not_found(e.to_string()),
            RepositoryError::ParentBackupRequired | RepositoryError::ParentNotFound(_) => {
                ApiError::new(Status::BadRequest, "parent_missing", e.to_string())
            }
            RepositoryError::ChainBroken(_) | RepositoryError::Busy(_) => {
                ApiError::conflict(e.to_string())
            }
            RepositoryError::RetentionNotMet { .. } => {
                ApiError::new(Status::Conflict, "retention_not_met", e.to_string())
            }
            RepositoryError::Qcow2(_) | RepositoryError::Tool(_) => {
                ApiError::new(Status::InternalServerError, "external_tool", e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<NbdError> for ApiError {
    fn from(e: NbdError) -> Self {
        match &e {
            NbdError::PortsExhausted | NbdError::DevicesExhausted => {
                ApiError::unavailable(e.to_string())
            }
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        match &e {
            AgentError::Unreachable { .. } => {
                ApiError::new(Status::ServiceUnavailable, "agent_unreachable", e.to_string())
            }
            AgentError::Rejected { .. } => ApiError::bad_request(e.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::VmNotFound(_)
            | OrchestratorError::RepositoryNotFound(_)
            | OrchestratorError::JobNotFound(_)
            | OrchestratorError::DiskNotFound { .. } => ApiError::not_found(e.to_string()),
            OrchestratorError::NoParentForIncremental { .. } => {
                ApiError::new(Status::BadRequest, "parent_missing", e.to_string())
            }
            OrchestratorError::VmHasNoDisks(_) | OrchestratorError::InvalidBackupType(_) => {
                ApiError::bad_request(e.to_string())
            }
            OrchestratorError::Nbd(inner) => inner.into(),
            OrchestratorError::Repository(inner) => inner.into(),
            OrchestratorError::Agent(inner) => inner.into(),
            OrchestratorError::Database(inner) => inner.into(),
        }
    }
}

impl From<RestoreError> for ApiError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::DiskNotFound { .. }
            | RestoreError::MountNotFound(_)
            | RestoreError::FileNotFound(_) => ApiError::not_found(e.to_string()),
            RestoreError::AlreadyMounted(_) => ApiError::conflict(e.to_string()),
            RestoreError::SlotsExhausted => ApiError::unavailable(e.to_string()),
            RestoreError::PathTraversal(_)
            | RestoreError::NotCompleted(_)
            | RestoreError::NotMounted(_)
            | RestoreError::NotAFile(_)
            | RestoreError::NotADirectory(_)
            | RestoreError::BadArchiveFormat(_) => ApiError::bad_request(e.to_string()),
            RestoreError::Nbd(inner) => inner.into(),
            RestoreError::Tool(_) | RestoreError::NoMountablePartitions => {
                ApiError::new(Status::InternalServerError, "external_tool", e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        match e {
            FlowError::NotFound(_) | FlowError::ExecutionNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            FlowError::NameTaken(_) | FlowError::AlreadyRunning(_) => {
                ApiError::conflict(e.to_string())
            }
            FlowError::Validation(_) => ApiError::bad_request(e.to_string()),
            FlowError::Database(inner) => inner.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidCron { .. } => ApiError::bad_request(e.to_string()),
            SchedulerError::ScheduleNotFound(_) => ApiError::not_found(e.to_string()),
            SchedulerError::Database(inner) => inner.into(),
        }
    }
}
