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
use crate::model::{ConversationId, User, UserId};
use crate::ops::friends;
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateGroupBody {
    pub name: String,
    #[serde(default)]
    pub members: Vec<UserId>,
}

pub async fn list_friends(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(friends::get(&state.store, &subject).await?))
}

pub async fn create_group(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    body: Result<Json<CreateGroupBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let body = json_body(body)?;
    let id = friends::create_group(&state.store, &subject, &body.name, &body.members).await?;
    Ok(Json(json!({ "conversation_id": id })))
}

pub async fn remove_friend(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let conversation_id = path_id(conversation_id)?;
    friends::remove(&state.store, &subject, conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}
