//! Standardized API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use telemetry::ComponentHealthReport;

/// Result of publishing rows into a table.
#[derive(Debug, Serialize, Deserialize)]
pub struct InsertResponse {
    pub success: bool,
    pub received: usize,
    pub published: usize,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl InsertResponse {
    pub fn new(received: usize, published: usize, errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            received,
            published,
            timestamp: chrono::Utc::now().timestamp_millis(),
            errors: if errors.is_empty() { None } else { Some(errors) },
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub nats_connected: bool,
    pub tables: usize,
    pub components: Vec<ComponentHealthReport>,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

/// API error carrying the engine error code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn with_code(status: StatusCode, code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            status,
            response: ErrorResponse::new(msg, code),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::NOT_FOUND, "UNKNOWN_TABLE", msg)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl From<engine_core::Error> for ApiError {
    fn from(err: engine_core::Error) -> Self {
        use engine_core::Error;

        let status = match &err {
            Error::QueryNotAllowed(_) => StatusCode::FORBIDDEN,
            Error::BadArguments(_)
            | Error::MissingSetting(_)
            | Error::IncorrectData(_)
            | Error::Validation(_)
            | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::CannotConnect(_) | Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Logical(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::with_code(status, err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_status() {
        let err: ApiError = engine_core::Error::cannot_connect("No connection to nats://x:4222").into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.response.code, "CANNOT_CONNECT_NATS");

        let err: ApiError = engine_core::Error::bad_arguments("no such column").into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_insert_response_reports_errors() {
        let ok = InsertResponse::new(2, 2, Vec::new());
        assert!(ok.success);
        assert!(ok.errors.is_none());

        let partial = InsertResponse::new(2, 1, vec!["cannot publish: not connected".into()]);
        assert!(!partial.success);
        assert_eq!(partial.errors.unwrap().len(), 1);
    }
}
