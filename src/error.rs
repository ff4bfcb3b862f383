use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::call::SessionError;
use crate::media::{CaptureError, MediaError};
use crate::storage::StorageError;
use crate::store::StoreError;

/// Failures of a call command
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("A call is already in progress")]
    Busy,

    #[error("No partner in the room to call")]
    NoPartner,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] StoreError),

    #[error("Call agent has stopped")]
    AgentStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InternalError(_) | AppError::StoreError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::StorageError(_) => StatusCode::BAD_GATEWAY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message shown to the client, without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::Conflict(msg)
            | AppError::InternalError(msg)
            | AppError::StoreError(msg)
            | AppError::StorageError(msg)
            | AppError::Unavailable(msg) => msg,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.message(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Busy | CallError::Session(_) => AppError::Conflict(err.to_string()),
            CallError::NoPartner | CallError::NoIncomingCall => AppError::NotFound(err.to_string()),
            CallError::Capture(capture) => AppError::BadRequest(capture.user_message()),
            CallError::Media(e) => AppError::InternalError(e.to_string()),
            CallError::Signaling(e) => AppError::StoreError(e.to_string()),
            CallError::AgentStopped => AppError::Unavailable(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => AppError::NotFound(path),
            StoreError::InvalidPath(path) => AppError::BadRequest(format!("Invalid path: {}", path)),
            other => AppError::StoreError(other.to_string()),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotConfigured => AppError::Unavailable(err.to_string()),
            other => AppError::StorageError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
