use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Unified error type for the ProxyNest application
#[derive(Error, Debug)]
pub enum NestError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Lease errors
    #[error("No eligible proxy matches the requested filter")]
    NoEligibleProxy,

    #[error("Instance {instance_id} already holds the maximum of {limit} leases")]
    LeaseLimitExceeded { instance_id: String, limit: u32 },

    #[error("Proxy {proxy_id} is leased by another instance, not {instance_id}")]
    NotOwner { proxy_id: Uuid, instance_id: String },

    #[error("Proxy {proxy_id} has no active reservation")]
    NoActiveReservation { proxy_id: Uuid },

    #[error("Proxy not found: {id}")]
    ProxyNotFound { id: Uuid },

    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for ProxyNest operations
pub type Result<T> = std::result::Result<T, NestError>;

/// Failure of a single outbound probe (health check or geo lookup).
///
/// Probe failures originate from background tasks with no caller; they are
/// folded into health/backoff state and never surfaced as request errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("probe failed: {0}")]
    Unreachable(String),
}

impl NestError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            NestError::InvalidRequest(_) | NestError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found
            NestError::ProxyNotFound { .. } | NestError::NoActiveReservation { .. } => {
                StatusCode::NOT_FOUND
            }

            // 409 Conflict
            NestError::NotOwner { .. } | NestError::LeaseLimitExceeded { .. } => {
                StatusCode::CONFLICT
            }

            // 503 Service Unavailable
            NestError::NoEligibleProxy
            | NestError::DatabaseConnection(_)
            | NestError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            NestError::Database(_) | NestError::Io(_) | NestError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Implement IntoResponse for API error responses
impl IntoResponse for NestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
