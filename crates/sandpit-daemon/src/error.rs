//! Error responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sandpit_core::SandpitError;
use sandpit_core::protocol::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Run could not start: sandbox construction or worker failure
    #[error("{0}")]
    Execution(SandpitError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SandpitError> for ServerError {
    fn from(e: SandpitError) -> Self {
        match e {
            SandpitError::ChallengeNotFound(id) => Self::NotFound(format!("challenge {id:?}")),
            SandpitError::Collaborator(msg) => Self::Storage(msg),
            other => Self::Execution(other),
        }
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("run task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Execution(SandpitError::Sandbox(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "sandbox_error")
            }
            Self::Execution(_) => (StatusCode::INTERNAL_SERVER_ERROR, "worker_error"),
            Self::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(status = %status, code, error = %message, "request failed");
        } else {
            tracing::warn!(status = %status, code, error = %message, "request rejected");
        }

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
