//! API error handling for the explorer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::governance::GovernanceError;
use crate::security::auth::AuthError;
use crate::security::rate_limiter::RateLimitError;
use crate::security::sql_sanitize::InjectionKind;
use crate::storage::StorageError;

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Seconds since the epoch
    pub timestamp: u64,
    /// Correlates the response with server logs
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: u16, message: String) -> Self {
        Self {
            code,
            message,
            details: None,
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            request_id: Some(Uuid::new_v4().to_string()),
        }
    }

    pub fn with_details(code: u16, message: String, details: serde_json::Value) -> Self {
        Self {
            details: Some(details),
            ..Self::new(code, message)
        }
    }

    // Common error constructors
    pub fn unauthorized(message: &str) -> Self {
        Self::new(401, message.to_string())
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(403, message.to_string())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(404, message.to_string())
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::new(500, message.to_string())
    }

    pub fn validation_error(field: &str, reason: &str) -> Self {
        Self::with_details(
            422,
            "Validation error".to_string(),
            serde_json::json!({
                "field": field,
                "reason": reason
            }),
        )
    }

    // Explorer-specific errors
    pub fn event_not_found(event_id: &str) -> Self {
        Self::with_details(
            404,
            "Event not found".to_string(),
            serde_json::json!({ "event_id": event_id }),
        )
    }

    pub fn contract_not_found(contract_id: &str) -> Self {
        Self::with_details(
            404,
            "Contract not found".to_string(),
            serde_json::json!({ "contract_id": contract_id }),
        )
    }

    pub fn injection_rejected(field: &str, kind: InjectionKind) -> Self {
        Self::with_details(
            400,
            "Input rejected".to_string(),
            serde_json::json!({ "field": field, "reason": kind }),
        )
    }

    pub fn rate_limit_exceeded(err: &RateLimitError) -> Self {
        Self::with_details(
            429,
            "Rate limit exceeded".to_string(),
            serde_json::json!({
                "limit": err.kind,
                "retry_after": err.retry_after,
            }),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "API Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub value: Option<serde_json::Value>,
}

/// Multiple validation errors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, field: &str, message: &str, value: Option<&str>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.to_string(),
            value: value.map(|v| serde_json::Value::String(v.to_string())),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    pub fn to_api_error(self) -> ApiError {
        ApiError::with_details(
            422,
            "Validation failed".to_string(),
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        errors.to_api_error()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        error!("Storage failure: {}", err);
        Self::internal_server_error("Storage failure")
    }
}

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        match err {
            GovernanceError::Storage(e) => e.into(),
            other => Self::with_details(
                422,
                "Invalid governance data".to_string(),
                serde_json::json!({ "reason": other.to_string() }),
            ),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Issue(reason) => {
                error!("Token issue failed: {}", reason);
                Self::internal_server_error("Failed to issue token")
            }
            other => Self::unauthorized(&other.to_string()),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        Self::rate_limit_exceeded(&err)
    }
}

/// A blocking storage task that panicked or was cancelled
impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        error!("Blocking task failed: {}", err);
        Self::internal_server_error("Internal task failure")
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        error!("I/O failure while serving request: {}", err);
        Self::internal_server_error("Internal server error")
    }
}
