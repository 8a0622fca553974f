//! Standardized API response types
//!
//! Provides consistent response structures across all API endpoints.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request was successful
    pub success: bool,
    /// Response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

/// Error details in API response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    /// Create a successful response with data
    pub fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    /// Create an error response
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            // Determine status from error code
            match self.error.as_ref().map(|e| e.code.as_str()) {
                Some("NOT_FOUND") => StatusCode::NOT_FOUND,
                Some("BAD_REQUEST") => StatusCode::BAD_REQUEST,
                Some("CONFLICT") => StatusCode::CONFLICT,
                Some("PRESENCE_UNAVAILABLE") | Some("QUEUE_UNAVAILABLE") => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        };
        (status, Json(self)).into_response()
    }
}

/// Helper trait for converting results to API responses
pub trait IntoApiResponse<T> {
    fn into_api_response(self) -> ApiResponse<T>;
}

impl<T: Serialize> IntoApiResponse<T> for Result<T, crate::error::AppError> {
    fn into_api_response(self) -> ApiResponse<T> {
        match self {
            Ok(data) => ApiResponse::success(data),
            Err(e) => {
                let (code, message): (&str, String) = match &e {
                    crate::error::AppError::NotFound(msg) => ("NOT_FOUND", msg.clone()),
                    crate::error::AppError::BadRequest(msg) => ("BAD_REQUEST", msg.clone()),
                    crate::error::AppError::Conflict(msg) => ("CONFLICT", msg.clone()),
                    crate::error::AppError::Internal(msg) => ("INTERNAL_ERROR", msg.clone()),
                    crate::error::AppError::Database(err) => ("DATABASE_ERROR", err.to_string()),
                    crate::error::AppError::Serialization(err) => ("JSON_ERROR", err.to_string()),
                    crate::error::AppError::Presence(err) => {
                        ("PRESENCE_UNAVAILABLE", err.to_string())
                    }
                    crate::error::AppError::Queue(err) => ("QUEUE_UNAVAILABLE", err.to_string()),
                };
                ApiResponse {
                    success: false,
                    data: None,
                    error: Some(ApiError {
                        code: code.to_string(),
                        message,
                    }),
                }
            }
        }
    }
}
