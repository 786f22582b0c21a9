/// Unified error types for the eventhook engine
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum HookError {
    /// Persisted subscription store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Coordination store errors (connection loss, command failure)
    #[error("Coordination store error: {0}")]
    Store(String),

    /// Marshal/unmarshal failures of queued items and control messages
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Callback delivery failed (build, transport or confirmation mismatch)
    #[error("Delivery failed: {reason}, payload: {payload}")]
    Delivery { reason: String, payload: String },

    /// The subscription's confirm pattern is not a valid regular expression
    #[error("Invalid confirm pattern '{pattern}': {source}")]
    InvalidConfirmPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// A worker task panicked and was torn down
    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for HookError {
    fn from(err: redis::RedisError) -> Self {
        HookError::Store(err.to_string())
    }
}

impl HookError {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            HookError::Database(_) => "database",
            HookError::Store(_) => "store",
            HookError::Serialization(_) => "serialization",
            HookError::Delivery { .. } => "delivery",
            HookError::InvalidConfirmPattern { .. } => "invalid_pattern",
            HookError::Validation(_) => "validation",
            HookError::NotFound(_) => "not_found",
            HookError::WorkerPanicked(_) => "panic",
            HookError::Internal(_) => "internal",
            HookError::Io(_) => "io",
        }
    }
}

/// Error body returned by the admin HTTP surface
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for HookError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            HookError::Validation(_) | HookError::InvalidConfirmPattern { .. } => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            HookError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            HookError::Store(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "StoreUnavailable",
                self.to_string(),
            ),
            HookError::Database(_) | HookError::Internal(_) | HookError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                self.to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for engine operations
pub type HookResult<T> = Result<T, HookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_carries_payload() {
        let err = HookError::Delivery {
            reason: "status 500 does not match 200".to_string(),
            payload: "{\"id\":1}".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("status 500"));
        assert!(msg.contains("{\"id\":1}"));
        assert_eq!(err.kind(), "delivery");
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let resp = HookError::Store("connection refused".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_internal_error_hides_details() {
        let resp = HookError::Internal("secret".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
