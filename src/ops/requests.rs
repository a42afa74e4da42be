//! Friend request workflow: NoRequest -> Pending -> (accepted | denied).
//! Accepting or denying deletes the request; accepting also creates the
//! friendship with its direct conversation and both memberships.

use chrono::Utc;
use log::info;
use serde::Serialize;

use super::conflict_as;
use crate::error::{ApiError, ApiResult};
use crate::guard::Authed;
use crate::model::{
    Conversation, ConversationId, ConversationMember, FriendPair, FriendRequest, Friendship,
    FriendshipId, MemberId, RequestId, User,
};
use crate::store::Store;

/// An incoming request together with the user who sent it.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingRequest {
    pub request: FriendRequest,
    pub sender: User,
}

pub async fn create(store: &Store, subject: &str, email: &str) -> ApiResult<RequestId> {
    let mut auth = Authed::begin(store, subject).await?;

    let email = email.trim();
    if email.is_empty() {
        return Err(ApiError::validation("Email is required"));
    }

    let receiver = auth
        .tx
        .user_by_email(email)
        .await?
        .ok_or_else(|| ApiError::not_found("User could not be found"))?;
    let sender_id = auth.caller_id();

    if receiver.id == sender_id {
        return Err(ApiError::precondition("Can't send a request to yourself"));
    }
    if auth.tx.request_between(sender_id, receiver.id).await?.is_some() {
        return Err(ApiError::precondition("Request already sent"));
    }
    if auth.tx.request_between(receiver.id, sender_id).await?.is_some() {
        return Err(ApiError::precondition("This user has already sent you a request"));
    }
    let pair = FriendPair::new(sender_id, receiver.id);
    if auth.tx.friendship_for_pair(pair).await?.is_some() {
        return Err(ApiError::precondition("You are already friends with this user"));
    }

    let request = FriendRequest {
        id: RequestId::new(),
        sender: sender_id,
        receiver: receiver.id,
        created_at: Utc::now(),
    };
    auth.tx
        .insert_request(&request)
        .await
        .map_err(conflict_as("Request already sent"))?;
    auth.tx
        .commit()
        .await
        .map_err(conflict_as("Request already sent"))?;

    info!("Friend request {} sent ({} -> {})", request.id, sender_id, receiver.id);
    Ok(request.id)
}

/// Accept a pending request; returns the new direct conversation.
pub async fn accept(store: &Store, subject: &str, request_id: RequestId) -> ApiResult<ConversationId> {
    let mut auth = Authed::begin(store, subject).await?;

    let request = auth
        .tx
        .request(request_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Request could not be found"))?;
    if request.receiver != auth.caller_id() {
        return Err(ApiError::precondition("Only the receiver can accept this request"));
    }

    let pair = FriendPair::new(request.sender, request.receiver);
    if auth.tx.friendship_for_pair(pair).await?.is_some() {
        return Err(ApiError::precondition("You are already friends with this user"));
    }

    auth.tx.delete_request(request.id).await?;

    // The friendship row references the conversation, so the conversation goes first.
    let now = Utc::now();
    let conversation = Conversation {
        id: ConversationId::new(),
        is_group: false,
        name: None,
        last_message_id: None,
        created_at: now,
    };
    auth.tx.insert_conversation(&conversation).await?;

    let friendship = Friendship {
        id: FriendshipId::new(),
        pair,
        conversation_id: conversation.id,
        created_at: now,
    };
    auth.tx
        .insert_friendship(&friendship)
        .await
        .map_err(conflict_as("You are already friends with this user"))?;

    for member_id in [request.sender, request.receiver] {
        let member = ConversationMember {
            id: MemberId::new(),
            conversation_id: conversation.id,
            member_id,
        };
        auth.tx.insert_member(&member).await?;
    }

    auth.tx
        .commit()
        .await
        .map_err(conflict_as("You are already friends with this user"))?;
    info!(
        "Friend request {} accepted; conversation {}",
        request.id, conversation.id
    );
    Ok(conversation.id)
}

pub async fn deny(store: &Store, subject: &str, request_id: RequestId) -> ApiResult<()> {
    let mut auth = Authed::begin(store, subject).await?;

    let request = auth
        .tx
        .request(request_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Request could not be found"))?;
    if request.receiver != auth.caller_id() {
        return Err(ApiError::precondition("Only the receiver can deny this request"));
    }

    auth.tx.delete_request(request.id).await?;
    auth.commit().await?;
    info!("Friend request {} denied", request.id);
    Ok(())
}

/// Incoming requests for the caller, oldest first.
pub async fn list(store: &Store, subject: &str) -> ApiResult<Vec<IncomingRequest>> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    let requests = auth.tx.requests_for_receiver(caller).await?;

    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        let sender = auth
            .user(request.sender)
            .await?
            .ok_or_else(|| ApiError::not_found("Request sender could not be found"))?;
        out.push(IncomingRequest { request, sender });
    }
    Ok(out)
}

pub async fn count(store: &Store, subject: &str) -> ApiResult<usize> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    Ok(auth.tx.requests_for_receiver(caller).await?.len())
}
