//! Crate-wide error type.
//!
//! Every fallible operation in the coordination plane returns a
//! [`CoreError`]. The router's HTTP layer maps each variant to the
//! status codes documented in the external interface; nothing below
//! this type needs to know about HTTP.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the coordination plane.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed request input (bad id, missing field, unparsable size).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation conflicts with the entity's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Declared or observed size exceeds the 10 GiB file limit.
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The placement ring has no registered servers.
    #[error("no servers available")]
    NoServersAvailable,

    /// A chunk server's circuit breaker is open or retries were exhausted.
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    /// The chunk server ran out of disk space mid-write.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A checksum mismatch was detected on write or read.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// Everything else: I/O errors, database errors, bugs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::OutOfMemory {
            return CoreError::ResourceExhausted(err.to_string());
        }
        if let Some(28) = err.raw_os_error() {
            // ENOSPC
            return CoreError::ResourceExhausted(err.to_string());
        }
        CoreError::Internal(err.to_string())
    }
}

impl CoreError {
    /// Status code this error maps to on the client HTTP surface.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            CoreError::NoServersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ServerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::ResourceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::DataLoss(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind, mirrored in the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::PayloadTooLarge(_) => "payload_too_large",
            CoreError::NoServersAvailable => "no_servers_available",
            CoreError::ServerUnavailable(_) => "server_unavailable",
            CoreError::ResourceExhausted(_) => "resource_exhausted",
            CoreError::DataLoss(_) => "data_loss",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
        } else {
            tracing::warn!(kind = self.kind(), "{}", self);
        }
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Crate-wide result alias.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
