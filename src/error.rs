//! Domain error types for the load test run orchestrator.
//!
//! Uses thiserror for ergonomic error handling with automatic Display implementations.
//! Variants are split into recoverable, user-displayable errors and fatal internal faults
//! (see [`AppError::is_fatal`]).

use actix_web::{HttpResponse, ResponseError};
use std::fmt;
use uuid::Uuid;

use crate::engine::EngineError;
use crate::models::RunId;

/// The resource a `NotFound` error refers to.
///
/// Each missing precondition of a run produces a distinct variant so callers
/// can tell a missing definition from a missing file association or missing content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    /// No load test with this id.
    LoadTest(Uuid),
    /// The load test has no associated file metadata.
    FileMetadata { test_id: Uuid },
    /// The file metadata exists but its content does not.
    FileContent { test_id: Uuid, file_id: Uuid },
    /// No run with this id on any node.
    Run(RunId),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadTest(id) => write!(f, "Load test {}", id),
            Self::FileMetadata { test_id } => {
                write!(f, "File metadata for load test {}", test_id)
            }
            Self::FileContent { test_id, file_id } => write!(
                f,
                "File content {} for load test {}",
                file_id, test_id
            ),
            Self::Run(run_id) => write!(f, "Run {}", run_id),
        }
    }
}

/// Application-level errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(Missing),

    /// No engine is registered for the declared file type
    #[error("Unrecognized test file type '{file_type}' for load test {test_id}")]
    UnsupportedType { test_id: Uuid, file_type: String },

    /// The engine rejected the run context
    #[error("Failed to initialize engine for load test {test_id}: {reason}")]
    InitFailed { test_id: Uuid, reason: String },

    /// A run of the same load test is already in progress
    #[error("Load test {test_id} is already running (run {run_id})")]
    AlreadyRunning { test_id: Uuid, run_id: RunId },

    /// Data integrity mismatch between collaborators
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Peer authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Engine fault that is not a context rejection
    #[error("Engine error: {0}")]
    Engine(String),

    /// Cluster directory or peer forwarding failed
    #[error("Cluster error: {0}")]
    Cluster(String),
}

impl AppError {
    /// Whether this error is an unexpected internal fault rather than a
    /// user-displayable precondition failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Engine(_) | AppError::Cluster(_)
        )
    }

    /// Stable machine-readable code used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::UnsupportedType { .. } => "UNSUPPORTED_TYPE",
            AppError::InitFailed { .. } => "INIT_FAILED",
            AppError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            AppError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Engine(_) => "ENGINE_ERROR",
            AppError::Cluster(_) => "CLUSTER_ERROR",
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, response_message) = match self {
            AppError::Database(err_str) => {
                tracing::error!("Database error: {}", err_str);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal database error occurred".to_string(),
                )
            }
            AppError::Engine(err_str) => {
                tracing::error!("Engine error: {}", err_str);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::Cluster(err_str) => {
                tracing::error!("Cluster error: {}", err_str);
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::UnsupportedType { .. } | AppError::InitFailed { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            AppError::AlreadyRunning { .. } => (StatusCode::CONFLICT, self.to_string()),
            AppError::PreconditionFailed(_) => {
                (StatusCode::PRECONDITION_FAILED, self.to_string())
            }
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
        };

        HttpResponse::build(status).json(ErrorResponse {
            error: self.code().to_string(),
            message: response_message,
        })
    }
}

/// Error response body matching OpenAPI schema.
#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

// Conversion implementations for common error types

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<sea_orm::DbErr> for AppError {
    fn from(err: sea_orm::DbErr) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("Invalid UUID: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Cluster(format!("Peer request failed: {}", err))
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        AppError::Engine(err.to_string())
    }
}
