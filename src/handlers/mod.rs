//! HTTP surface. Handlers are thin: extract the verified subject and the body,
//! call one operation, and serialize its result.

pub mod conversations;
pub mod friends;
pub mod requests;
pub mod webhook;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::Path;
use axum::Json;

use crate::error::ApiError;

/// Unwrap a JSON body, turning a rejection into a validation error.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(b)) => Ok(b),
        Err(e) => Err(ApiError::validation(format!("Invalid JSON: {}", e.body_text()))),
    }
}

pub(crate) fn path_id<T>(path: Result<Path<T>, PathRejection>) -> Result<T, ApiError> {
    match path {
        Ok(Path(id)) => Ok(id),
        Err(_) => Err(ApiError::validation("Invalid id")),
    }
}

pub async fn health() -> &'static str {
    "ok"
}
