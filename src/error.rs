use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::workers::supervisor::SpawnError;

/// Bytes of raw worker output echoed back in decode-failure responses.
const RAW_OUTPUT_PREVIEW_BYTES: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("{message}")]
    Worker { message: String, details: String },

    #[error("could not parse worker output")]
    Decode { raw: String },
}

impl AppError {
    /// Decode failure carrying a truncated copy of the raw worker
    /// output to aid diagnosis.
    pub fn decode(raw: &str) -> Self {
        let mut end = raw.len().min(RAW_OUTPUT_PREVIEW_BYTES);
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        AppError::Decode {
            raw: raw[..end].to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match self {
            AppError::Json(ref err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::Io(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
            AppError::Internal(ref err) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None)
            }
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone(), None),
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone(), None),
            AppError::Spawn(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None),
            AppError::Worker {
                ref message,
                ref details,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                message.clone(),
                Some(details.clone()),
            ),
            AppError::Decode { ref raw } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not parse worker output".to_string(),
                Some(raw.clone()),
            ),
        };

        let body = match details {
            Some(details) => json!({ "error": error_message, "details": details }),
            None => json!({ "error": error_message }),
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rej: axum::extract::rejection::JsonRejection) -> Self {
        AppError::BadRequest(rej.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
