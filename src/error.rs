//! Caller-facing error taxonomy. Every operation fails with an `ApiError`; the
//! HTTP layer turns it into a status code plus `{"error", "message"}` body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PreconditionFailed(String),
    #[error("{0}")]
    Validation(String),
    #[error("Webhook verification failed: {0}")]
    VerificationFailed(String),
    #[error("Failed to write user {0}")]
    DownstreamWriteFailed(String),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Storage error: {0}")]
    Internal(#[from] StoreError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        ApiError::PreconditionFailed(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "Unauthorized",
            ApiError::NotFound(_) => "NotFound",
            ApiError::PreconditionFailed(_) => "PreconditionFailed",
            ApiError::Validation(_) => "Validation",
            ApiError::VerificationFailed(_) => "VerificationFailed",
            ApiError::DownstreamWriteFailed(_) => "DownstreamWriteFailed",
            ApiError::RateLimited => "RateLimited",
            ApiError::Internal(_) => "Internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::VerificationFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::DownstreamWriteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Backend detail stays in the log.
            ApiError::Internal(e) => {
                error!("Store failure: {}", e);
                "Unexpected error occurred".to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({ "error": self.kind(), "message": message });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
