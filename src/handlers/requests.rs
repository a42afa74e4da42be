use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Extension, Path, State,
    },
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{json_body, path_id};
use crate::error::ApiResult;
use crate::identity::VerifiedSubject;
use crate::model::RequestId;
use crate::ops::requests::{self, IncomingRequest};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub email: String,
}

pub async fn create_request(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    body: Result<Json<CreateRequestBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = json_body(body)?;
    let id = requests::create(&state.store, &subject, &body.email).await?;
    Ok(Json(json!({ "request_id": id })))
}

pub async fn accept_request(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    request_id: Result<Path<RequestId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let request_id = path_id(request_id)?;
    let conversation_id = requests::accept(&state.store, &subject, request_id).await?;
    Ok(Json(json!({ "conversation_id": conversation_id })))
}

pub async fn deny_request(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    request_id: Result<Path<RequestId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let request_id = path_id(request_id)?;
    requests::deny(&state.store, &subject, request_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_requests(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
) -> ApiResult<Json<Vec<IncomingRequest>>> {
    Ok(Json(requests::list(&state.store, &subject).await?))
}

pub async fn count_requests(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
) -> ApiResult<Json<Value>> {
    let count = requests::count(&state.store, &subject).await?;
    Ok(Json(json!({ "count": count })))
}
