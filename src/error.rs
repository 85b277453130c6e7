//! Top-level error taxonomy.
//!
//! Every public entry point of the engine returns [`EngineError`]. Component
//! modules define their own `thiserror` enums for their internal failure
//! modes and convert into `EngineError` at the boundary, the same way the
//! teacher daemon layers `EnvironmentError` under its top-level `DaemonError`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::supervisor::SupervisorError;
use crate::workspace::WorkspaceError;

/// Tagged error kinds consumed by the Conversation Executor's reconciliation
/// block. The variant alone decides how a conversation's status resolves;
/// the message is for operators, not for branching logic.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("precondition missing: {0}")]
    PreconditionMissing(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("admission refused: {0}")]
    AdmissionRefused(String),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("git error: {0}")]
    Git(#[from] WorkspaceError),

    #[error("container runtime unavailable: {0}")]
    ContainerRuntimeUnavailable(String),

    #[error("child exited with error: {0}")]
    ChildExit(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<SupervisorError> for EngineError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::RuntimeUnavailable(msg) => EngineError::ContainerRuntimeUnavailable(msg),
            SupervisorError::NonZeroExit { stderr_tail } => EngineError::ChildExit(stderr_tail),
            SupervisorError::Timeout => {
                EngineError::Timeout("container execution exceeded deadline".into())
            }
            SupervisorError::Cancelled => EngineError::Cancelled,
            SupervisorError::Io(e) => EngineError::ChildExit(e.to_string()),
        }
    }
}

impl EngineError {
    /// Whether this error, surfaced mid-run, should be classified as a
    /// cancellation rather than a failure — the one case where the
    /// reconciliation block writes `Cancelled` instead of `Failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }

    pub fn repository(e: impl std::fmt::Display) -> Self {
        EngineError::Repository(e.to_string())
    }
}

/// Errors a `Repository` implementation may raise. Kept separate from
/// `EngineError` so storage backends aren't forced to know about engine
/// semantics; the executor wraps these with `EngineError::repository`.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(e: rusqlite::Error) -> Self {
        RepositoryError::Storage(e.to_string())
    }
}

/// The minimal JSON error body the demonstration streaming endpoint returns.
/// Production deployments front the engine with their own HTTP/auth layer;
/// this exists only so the endpoint in `streaming` has something to return.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Engine(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let body = Json(json!({ "error": true, "message": message }));
        (status, body).into_response()
    }
}
