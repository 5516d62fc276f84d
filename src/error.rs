use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Store errors
// ============================================================================

/// Faults raised by a `TrialStore`. "No record" is never one of these.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("malformed store response: {0}")]
    Decode(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::CannotOpen
                ) =>
            {
                StoreError::Unavailable(e.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Decode(e.to_string()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            StoreError::Decode(e.to_string())
        } else {
            StoreError::Unavailable(e.to_string())
        }
    }
}

// ============================================================================
// Request-level errors
// ============================================================================

pub const MSG_METHOD_NOT_ALLOWED: &str = "Method Not Allowed";
pub const MSG_PAYLOAD_TOO_LARGE: &str = "Request body too large.";
pub const MSG_CONFIGURATION: &str = "Server configuration error (missing keys).";
pub const MSG_INTERNAL: &str = "Internal server error during trial request.";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TrialError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("request body exceeds the size limit")]
    PayloadTooLarge,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl TrialError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Configuration(_) | Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show the caller. Internal causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(msg) => msg.clone(),
            Self::MethodNotAllowed => MSG_METHOD_NOT_ALLOWED.to_string(),
            Self::PayloadTooLarge => MSG_PAYLOAD_TOO_LARGE.to_string(),
            Self::Configuration(_) => MSG_CONFIGURATION.to_string(),
            Self::Storage(_) => MSG_INTERNAL.to_string(),
        }
    }

    /// Build the JSON error body. `expose_details` is the diagnostic mode that
    /// echoes the storage cause in `error_details`.
    pub fn to_response(&self, expose_details: bool) -> Response {
        let error_details = match self {
            Self::Storage(e) if expose_details => Some(e.to_string()),
            _ => None,
        };
        let body = TrialResponse {
            success: false,
            message: self.public_message(),
            expires_at: None,
            error_details,
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl IntoResponse for TrialError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}

// ============================================================================
// Response body
// ============================================================================

/// Body returned by the request-trial endpoint for every outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrialResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}
