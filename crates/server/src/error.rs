//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gleaner_gc::GcError;
use gleaner_vault::VaultError;
use serde::Serialize;

/// Error payload: `{"error": {"kind", "message"}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable kind from the error taxonomy.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("a GC cycle is already running")]
    CycleBusy,

    #[error("{0}")]
    Engine(GcError),
}

impl From<GcError> for ApiError {
    fn from(e: GcError) -> Self {
        match e {
            GcError::CycleBusy => Self::CycleBusy,
            GcError::OperationNotFound(op) => Self::NotFound(format!("operation {op}")),
            other => Self::Engine(other),
        }
    }
}

impl ApiError {
    /// Taxonomy kind for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::CycleBusy => "cycle_busy",
            Self::Engine(e) => match e {
                GcError::Vault(VaultError::Conflict { .. }) => "vault_conflict",
                GcError::Vault(VaultError::AlreadyRestored { .. }) => "already_restored",
                GcError::Vault(_) => "vault_error",
                GcError::Registry(gleaner_registry::RegistryError::Underflow(_)) => {
                    "registry_underflow"
                }
                GcError::Registry(_) => "registry_error",
                GcError::Storage(_) => "storage_error",
                GcError::Verify(_) => "cdc_error",
                GcError::Restore(_) => "restore_error",
                GcError::CycleBusy => "cycle_busy",
                GcError::OperationNotFound(_) => "not_found",
            },
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::CycleBusy => StatusCode::CONFLICT,
            Self::Engine(e) => match e {
                GcError::Vault(VaultError::Conflict { .. })
                | GcError::Vault(VaultError::AlreadyRestored { .. }) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
