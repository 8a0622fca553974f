//! Application error type shared by the HTTP surface and the delivery core

use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::api::response::{ApiResponse, IntoApiResponse};
use crate::fanout::QueueError;
use crate::presence::PresenceError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("presence registry unavailable: {0}")]
    Presence(#[from] PresenceError),

    #[error("fanout queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

impl AppError {
    pub fn internal(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }

    pub fn bad_request(msg: &str) -> Self {
        AppError::BadRequest(msg.to_string())
    }

    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::debug!(error = %self, "request failed");
        Err::<(), _>(self).into_api_response().into_response()
    }
}
