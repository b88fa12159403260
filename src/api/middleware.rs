use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::QueryViolation;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Unknown engine type, missing data source, unusable settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or authentication failure reaching the engine
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query text rejected by the statement-safety pipeline
    #[error("Query rejected: {0}")]
    InvalidQuery(#[from] QueryViolation),

    /// The engine accepted the statement but execution failed
    #[error("{0}")]
    Execution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::InvalidQuery(QueryViolation::Empty) => "VALIDATION_ERROR",
            AppError::InvalidQuery(_) => "FORBIDDEN_QUERY",
            AppError::Execution(_) => "EXECUTION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::Connection(_) => StatusCode::BAD_GATEWAY,
            AppError::InvalidQuery(QueryViolation::Empty) => StatusCode::BAD_REQUEST,
            AppError::InvalidQuery(_) => StatusCode::FORBIDDEN,
            AppError::Execution(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let error_detail = match &self {
            AppError::InvalidQuery(violation) => {
                ErrorDetail::new(code, violation.to_string()).with_details(violation.rule())
            }
            AppError::Execution(msg) => {
                // Engine message is surfaced verbatim; only a hint is attached
                let detail = ErrorDetail::new(code, msg.clone());
                if msg.contains("does not exist") || msg.contains("doesn't exist") {
                    detail.with_details("Try refreshing the schema or check the table name.")
                } else if msg.contains("timeout") {
                    detail.with_details("Consider simplifying your query or checking database performance.")
                } else {
                    detail
                }
            }
            other => ErrorDetail::new(code, other.to_string()),
        };

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Internal(format!("Config store error: {}", err))
    }
}
