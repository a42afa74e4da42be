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
use crate::model::{ConversationId, MessageKind};
use crate::ops::conversations::{self, ConversationDetails, ConversationSummary};
use crate::ops::messages::{self, MessageView};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct CreateMessageBody {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Vec<String>,
}

pub async fn list_conversations(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(conversations::list(&state.store, &subject).await?))
}

pub async fn get_conversation(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
) -> ApiResult<Json<ConversationDetails>> {
    let conversation_id = path_id(conversation_id)?;
    Ok(Json(
        conversations::get(&state.store, &subject, conversation_id).await?,
    ))
}

pub async fn delete_group(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let conversation_id = path_id(conversation_id)?;
    conversations::delete_group(&state.store, &subject, conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn leave_group(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let conversation_id = path_id(conversation_id)?;
    conversations::leave_group(&state.store, &subject, conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_messages(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
) -> ApiResult<Json<Vec<MessageView>>> {
    let conversation_id = path_id(conversation_id)?;
    Ok(Json(
        messages::list(&state.store, &subject, conversation_id).await?,
    ))
}

pub async fn create_message(
    State(state): State<SharedState>,
    Extension(VerifiedSubject(subject)): Extension<VerifiedSubject>,
    conversation_id: Result<Path<ConversationId>, PathRejection>,
    body: Result<Json<CreateMessageBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let conversation_id = path_id(conversation_id)?;
    let body = json_body(body)?;
    let id = messages::create(&state.store, &subject, conversation_id, body.kind, body.content)
        .await?;
    Ok(Json(json!({ "message_id": id })))
}
