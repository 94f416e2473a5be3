use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// The core's error taxonomy (six categories, one per outward treatment):
/// close the connection, emit `error{message}` to the caller and leave state
/// untouched, retry once and let the circuit breaker count persistent
/// failures, or log and surface a generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    AuthFailure,
    ValidationError,
    PreconditionError,
    NotFound,
    TransientStoreError,
    InternalError,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthFailure => "E0001",
            Self::ValidationError => "E0002",
            Self::PreconditionError => "E0003",
            Self::NotFound => "E0004",
            Self::TransientStoreError => "E0005",
            Self::InternalError => "E0006",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::PreconditionError => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::TransientStoreError => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known { code: ErrorCode, message: String },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
        }
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthFailure, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PreconditionError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransientStoreError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The text this error surfaces in an outbound `error{message}` socket
    /// event. `InternalError` and unexpected errors never leak their detail.
    pub fn client_message(&self) -> String {
        match self {
            Self::Known { code, message } => match code {
                ErrorCode::InternalError => "internal".to_string(),
                _ => message.clone(),
            },
            Self::Internal(_) | Self::Database(_) => "internal".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known { code, message } => {
                (code.status_code(), ApiErrorResponse::new(code.code(), message))
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new("E0006", "internal server error"),
                )
            }
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                match err {
                    diesel::result::Error::NotFound => (
                        StatusCode::NOT_FOUND,
                        ApiErrorResponse::new("E0004", "resource not found"),
                    ),
                    _ => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        ApiErrorResponse::new("E0005", "store unavailable"),
                    ),
                }
            }
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
