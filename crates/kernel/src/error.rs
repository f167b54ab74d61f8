//! Error types.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced by permission checks and guarded dependency calls.
///
/// A cache miss is not an error (it is `None`), and a degraded answer is a
/// successful [`Decision`](crate::resolver::Decision) with `degraded` set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("dependency `{dependency}` unavailable: {message}")]
    Unavailable { dependency: String, message: String },

    #[error("circuit open for `{0}`")]
    CircuitOpen(String),

    #[error("rate limited on `{dependency}`, retry after {retry_after_ms}ms")]
    RateLimited {
        dependency: String,
        retry_after_ms: u64,
    },

    #[error("`{0}` overloaded")]
    Overloaded(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("maintenance mode is active")]
    MaintenanceMode,

    #[error("invalid permission key: {0}")]
    InvalidKey(String),
}

impl PermissionError {
    /// Build an `Unavailable` error for a dependency from any displayable cause.
    pub fn unavailable(dependency: &str, cause: impl std::fmt::Display) -> Self {
        PermissionError::Unavailable {
            dependency: dependency.to_string(),
            message: cause.to_string(),
        }
    }

    /// Rejections produced by a guard before the wrapped call ran.
    ///
    /// These are never retried by the resilience controller.
    pub fn is_guard_rejection(&self) -> bool {
        matches!(
            self,
            PermissionError::CircuitOpen(_)
                | PermissionError::RateLimited { .. }
                | PermissionError::Overloaded(_)
                | PermissionError::MaintenanceMode
        )
    }

    /// Errors after which a stale cached value may back a degraded answer.
    pub fn allows_degraded(&self) -> bool {
        !matches!(self, PermissionError::InvalidKey(_))
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PermissionError::Unavailable { .. } => "unavailable",
            PermissionError::CircuitOpen(_) => "circuit_open",
            PermissionError::RateLimited { .. } => "rate_limited",
            PermissionError::Overloaded(_) => "overloaded",
            PermissionError::Timeout(_) => "timeout",
            PermissionError::MaintenanceMode => "maintenance",
            PermissionError::InvalidKey(_) => "invalid_key",
        }
    }
}

/// Errors returned by the ops routes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Permission(#[from] PermissionError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Permission(e) => match e {
                PermissionError::InvalidKey(_) => StatusCode::BAD_REQUEST,
                PermissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                PermissionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
        };

        let body = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal server error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, body).into_response()
    }
}

/// Result type alias using AppError.
pub type AppResult<T> = Result<T, AppError>;
