use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{}", .0.message)]
    Validation(ValidationFailure),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("external service error: {0}")]
    External(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("internal error")]
    Internal,
}

/// Rejection of caller-supplied data. The merchant id lists name the
/// offending records so the operator can fix them and retry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unassigned_mids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_participant_mids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub held_mids: Vec<String>,
}

impl ValidationFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ValidationFailure>,
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(ValidationFailure::message(message))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::External(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Validation(_) => "validation_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Config(_) => "config_error",
            Self::External(_) => "external_error",
            Self::Persistence(_) => "persistence_error",
            Self::Internal => "internal_error",
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            details: match self {
                Self::Validation(failure) => Some(failure.clone()),
                _ => None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self.status_code(), StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "request failed");
        }
        (self.status_code(), Json(self.to_error_body())).into_response()
    }
}
