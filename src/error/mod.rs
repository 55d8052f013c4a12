//! Application error types for robust error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid session ID format: {0}")]
    InvalidSession(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Text carried by the `error` frame sent back to the offending connection.
    pub fn client_message(&self) -> String {
        match self {
            AppError::InvalidSession(_) => "Invalid session ID format".to_string(),
            AppError::UnknownMessageType(kind) => format!("Unknown message type: {}", kind),
            AppError::Serialization(_) => "Invalid message format".to_string(),
            AppError::Validation(msg) => msg.clone(),
            AppError::Redis(_) | AppError::Delivery(_) => {
                "Service temporarily unavailable".to_string()
            }
            AppError::Internal(_) => "Internal error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Redis(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Redis error: {}", e),
            ),
            AppError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid payload: {}", e),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidSession(_) => {
                (StatusCode::BAD_REQUEST, "Invalid session ID".to_string())
            }
            AppError::UnknownMessageType(kind) => (
                StatusCode::BAD_REQUEST,
                format!("Unknown message type: {}", kind),
            ),
            AppError::Delivery(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", e),
            ),
        };

        let body = Json(json!({ "success": false, "error": message }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
