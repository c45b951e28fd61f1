//! Error types for the gateway and the bridge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
///
/// Tool-level variants are turned into JSON-RPC error responses and pushed
/// over the session stream. Transport-level variants (`Authorization`,
/// `SessionNotFound`) short-circuit with an HTTP status instead.
#[derive(Error, Debug)]
pub enum Error {
    /// No usable allowed directory is configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or wrong API key.
    #[error("unauthorized: {0}")]
    Authorization(String),

    /// Tool arguments do not match the declared input schema.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// Resolved path escapes the allowed directory.
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// The operator denied the call, explicitly or implicitly.
    #[error("user denied this request")]
    UserDenied,

    /// Tool not found.
    #[error("tool not found: {0}")]
    UnknownTool(String),

    /// Message posted against an unknown or closed session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error (bridge only).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::UnknownTool(_) => codes::METHOD_NOT_FOUND,
            Error::Validation(_) => codes::INVALID_PARAMS,
            Error::UserDenied | Error::Configuration(_) => codes::INVALID_REQUEST,
            Error::SandboxViolation(_) => -32000,
            Error::Authorization(_) => -32001,
            Error::Io(_) => -32002,
            Error::SessionNotFound(_) => -32004,
            Error::Http(_) => -32005,
            Error::Serialization(_) => codes::PARSE_ERROR,
            Error::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Convert to JSON-RPC error object.
    pub fn to_json_rpc_error(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Authorization(reason) => {
                tracing::debug!("Rejected request: {}", reason);
                (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "error": "Unauthorized" })),
                )
                    .into_response()
            }
            Error::SessionNotFound(_) => {
                (StatusCode::NOT_FOUND, "Session not found").into_response()
            }
            other => {
                let status = match other {
                    Error::Serialization(_) | Error::Validation(_) => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, Json(serde_json::json!({ "error": other.to_string() }))).into_response()
            }
        }
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Parse error.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}
