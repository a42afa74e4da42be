use std::collections::HashMap;

use chrono::Utc;
use log::info;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::guard::Authed;
use crate::model::{ConversationId, Message, MessageId, MessageKind, User, UserId};
use crate::store::Store;

/// A message as shown to one reader.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    pub sender_image: String,
    pub is_current_user: bool,
}

pub async fn create(
    store: &Store,
    subject: &str,
    conversation_id: ConversationId,
    kind: MessageKind,
    content: Vec<String>,
) -> ApiResult<MessageId> {
    let mut auth = Authed::begin(store, subject).await?;
    let caller = auth.caller_id();
    let access = auth.conversation(conversation_id).await?;
    access.require_member(caller, "You are not a member of this conversation")?;

    if content.iter().all(|part| part.trim().is_empty()) {
        return Err(ApiError::validation("Message cannot be empty"));
    }

    let message = Message {
        id: MessageId::new(),
        conversation_id,
        sender_id: caller,
        kind,
        content,
        created_at: Utc::now(),
    };
    auth.tx.insert_message(&message).await?;
    auth.tx.set_last_message(conversation_id, message.id).await?;
    auth.commit().await?;

    info!("Message {} posted to {}", message.id, conversation_id);
    Ok(message.id)
}

/// Messages of a conversation, newest first.
pub async fn list(
    store: &Store,
    subject: &str,
    conversation_id: ConversationId,
) -> ApiResult<Vec<MessageView>> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    let access = auth.conversation(conversation_id).await?;
    access.require_member(caller, "You are not a member of this conversation")?;

    let mut senders: HashMap<UserId, Option<User>> = HashMap::new();
    let mut messages = auth.tx.messages_of(conversation_id).await?;
    messages.reverse();

    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        if !senders.contains_key(&message.sender_id) {
            let sender = auth.user(message.sender_id).await?;
            senders.insert(message.sender_id, sender);
        }
        let (sender_name, sender_image) = match senders.get(&message.sender_id) {
            Some(Some(user)) => (user.username.clone(), user.image_url.clone()),
            _ => (String::new(), String::new()),
        };
        out.push(MessageView {
            is_current_user: message.sender_id == caller,
            message,
            sender_name,
            sender_image,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::friends;
    use crate::ops::testutil::seed_three;

    #[tokio::test]
    async fn create_updates_last_message() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id])
            .await
            .unwrap();

        let id = create(&store, "user_bob", group, MessageKind::Text, vec!["hello".into()])
            .await
            .unwrap();

        let mut tx = store.begin_read().await.unwrap();
        let conversation = tx.conversation(group).await.unwrap().unwrap();
        assert_eq!(conversation.last_message_id, Some(id));
    }

    #[tokio::test]
    async fn non_member_cannot_post() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id])
            .await
            .unwrap();

        match create(&store, "user_carol", group, MessageKind::Text, vec!["hi".into()]).await {
            Err(ApiError::PreconditionFailed(m)) => {
                assert_eq!(m, "You are not a member of this conversation")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(list(&store, "user_alice", group).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_content_is_rejected() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id])
            .await
            .unwrap();

        for content in [vec![], vec!["  ".to_string(), String::new()]] {
            assert!(matches!(
                create(&store, "user_alice", group, MessageKind::Text, content).await,
                Err(ApiError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn list_is_newest_first_with_sender_details() {
        let store = Store::memory();
        let (alice, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id])
            .await
            .unwrap();
        create(&store, "user_alice", group, MessageKind::Text, vec!["first".into()])
            .await
            .unwrap();
        create(&store, "user_bob", group, MessageKind::Text, vec!["second".into()])
            .await
            .unwrap();

        let views = list(&store, "user_alice", group).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].message.content, vec!["second".to_string()]);
        assert_eq!(views[0].sender_name, bob.username);
        assert!(!views[0].is_current_user);
        assert_eq!(views[1].sender_image, alice.image_url);
        assert!(views[1].is_current_user);
    }
}
