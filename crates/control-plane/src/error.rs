//! Error types for the execflow control plane server.
//!
//! `AppError` implements `IntoResponse` so handlers can return
//! `AppResult<T>` and bubble failures up with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::compiler::CompileError;
use crate::db::StoreError;
use crate::services::ManagerError;

/// Application-level errors for the control plane.
#[derive(Error, Debug)]
pub enum AppError {
    /// Event store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Not found error
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The workflow failed to compile
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Conflict with the run's current status
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad request error
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Store(e) => {
                tracing::error!(error = %e, "Store error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Compile(e) => (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!(error = %msg, "Configuration error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone())
            }
            AppError::Serialization(e) => {
                tracing::error!(error = %e, "Serialization error");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound(run_id) => AppError::NotFound(format!("run {run_id}")),
            ManagerError::NotWaiting { .. }
            | ManagerError::NoCheckpoint(_)
            | ManagerError::AlreadyFinished { .. } => AppError::Conflict(err.to_string()),
            ManagerError::RunCorruption { .. } => AppError::Internal(err.to_string()),
            ManagerError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<envy::Error> for AppError {
    fn from(err: envy::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
