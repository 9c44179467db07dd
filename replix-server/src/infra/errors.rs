use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use replix_core::error::{ParameterError, StoreError};
use replix_core::SubmitError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));

        (self.status, body).into_response()
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Validation(e) => Self::bad_request(e.to_string()),
            e if e.is_capacity() => {
                tracing::warn!(error = %e, "submission refused at capacity");
                Self::internal("Capacity limit reached")
            }
            SubmitError::Vault(e) => {
                tracing::error!(error = %e, "credential sealing failed");
                Self::internal("Failed to protect credentials")
            }
            SubmitError::Store(e) => {
                tracing::error!(error = %e, "job store operation failed");
                Self::internal("Failed to record job")
            }
            SubmitError::Queue(e) => {
                tracing::error!(error = %e, "provisioning request could not be queued");
                Self::internal("Failed to queue provisioning request")
            }
            SubmitError::Provisioning(e) => {
                tracing::error!(error = %e, "worker provisioning failed");
                Self::internal("Failed to provision worker")
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            return Self::not_found("Job not found");
        }
        tracing::error!(error = %err, "job store operation failed");
        Self::internal("Job store operation failed")
    }
}

impl From<ParameterError> for AppError {
    fn from(err: ParameterError) -> Self {
        tracing::error!(error = %err, "failed to fetch API key parameter");
        Self::internal("Authentication is unavailable")
    }
}
