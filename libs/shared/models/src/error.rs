use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

const GENERIC_INTERNAL_MESSAGE: &str = "An internal error occurred";

/// Where a failure originated, so callers can tell "your request was
/// invalid" apart from "we failed internally" without knowing the service
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Validation,
    Conflict,
    NotFound,
    Authentication,
    Authorization,
    Persistence,
    ExternalService,
    Internal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

impl AppError {
    pub fn error_source(&self) -> ErrorSource {
        match self {
            AppError::Auth(_) => ErrorSource::Authentication,
            AppError::Forbidden(_) => ErrorSource::Authorization,
            AppError::NotFound(_) => ErrorSource::NotFound,
            AppError::BadRequest(_) | AppError::ValidationError(_) => ErrorSource::Validation,
            AppError::Conflict(_) => ErrorSource::Conflict,
            AppError::Database(_) => ErrorSource::Persistence,
            AppError::ExternalService(_) => ErrorSource::ExternalService,
            AppError::Internal(_) => ErrorSource::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ExternalService(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message safe to hand back to the caller. Internal details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Internal(_) => GENERIC_INTERNAL_MESSAGE.to_string(),
            AppError::Auth(msg)
            | AppError::Forbidden(msg)
            | AppError::NotFound(msg)
            | AppError::BadRequest(msg)
            | AppError::ValidationError(msg)
            | AppError::Conflict(msg)
            | AppError::ExternalService(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let source = self.error_source();

        if status.is_server_error() {
            tracing::error!(?source, "Error: {}: {}", status, self);
        } else {
            tracing::warn!(?source, "Error: {}: {}", status, self);
        }

        let body = Json(json!({
            "success": false,
            "error": self.public_message(),
            "source": source,
        }));

        (status, body).into_response()
    }
}
