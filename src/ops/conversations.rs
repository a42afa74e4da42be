//! Conversation reads and the group removal paths.

use std::collections::HashMap;

use log::info;
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::guard::{Authed, ConversationAccess};
use crate::model::{Conversation, ConversationId, MessageKind, User, UserId};
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetails {
    pub conversation: Conversation,
    /// The other participant of a direct conversation.
    pub other_member: Option<User>,
    /// Everyone but the caller, for groups.
    pub other_members: Vec<User>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastMessage {
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub other_member: Option<User>,
    pub last_message: Option<LastMessage>,
}

/// Delete every membership and message of a conversation whose root row has
/// already been removed in the same transaction.
pub(crate) async fn delete_dependents(
    tx: &mut dyn StoreTx,
    access: &ConversationAccess,
) -> ApiResult<()> {
    for member in &access.members {
        tx.delete_member(member.id).await?;
    }
    tx.delete_messages_of(access.id()).await?;
    Ok(())
}

pub async fn delete_group(
    store: &Store,
    subject: &str,
    conversation_id: ConversationId,
) -> ApiResult<()> {
    let mut auth = Authed::begin(store, subject).await?;
    let access = auth.conversation(conversation_id).await?;

    access.require_group()?;
    access.require_several_members("This group does not have enough members")?;
    access.require_member(auth.caller_id(), "You are not a member of this group")?;

    auth.tx.delete_conversation(conversation_id).await?;
    delete_dependents(auth.tx.as_mut(), &access).await?;
    auth.commit().await?;

    info!("Group {} deleted ({} members)", conversation_id, access.members.len());
    Ok(())
}

/// Remove the caller's membership. The last member out tears the group down.
pub async fn leave_group(
    store: &Store,
    subject: &str,
    conversation_id: ConversationId,
) -> ApiResult<()> {
    let mut auth = Authed::begin(store, subject).await?;
    let access = auth.conversation(conversation_id).await?;

    access.require_group()?;
    let membership = access
        .require_member(auth.caller_id(), "You are not a member of this group")?
        .clone();

    if access.members.len() == 1 {
        auth.tx.delete_conversation(conversation_id).await?;
        delete_dependents(auth.tx.as_mut(), &access).await?;
        info!("Last member left group {}; removed", conversation_id);
    } else {
        auth.tx.delete_member(membership.id).await?;
        info!("User {} left group {}", membership.member_id, conversation_id);
    }

    auth.commit().await?;
    Ok(())
}

async fn load_users(auth: &mut Authed, ids: &[UserId]) -> ApiResult<Vec<User>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let user = auth
            .user(*id)
            .await?
            .ok_or_else(|| ApiError::not_found("Member could not be found"))?;
        out.push(user);
    }
    Ok(out)
}

pub async fn get(
    store: &Store,
    subject: &str,
    conversation_id: ConversationId,
) -> ApiResult<ConversationDetails> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    let access = auth.conversation(conversation_id).await?;
    access.require_member(caller, "You are not a member of this conversation")?;

    let others = load_users(&mut auth, &access.other_member_ids(caller)).await?;
    let (other_member, other_members) = if access.conversation.is_group {
        (None, others)
    } else {
        (others.into_iter().next(), Vec::new())
    };

    Ok(ConversationDetails {
        conversation: access.conversation,
        other_member,
        other_members,
    })
}

/// Every conversation the caller belongs to, most recently active first.
pub async fn list(store: &Store, subject: &str) -> ApiResult<Vec<ConversationSummary>> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    let memberships = auth.tx.memberships_of_user(caller).await?;

    let mut names: HashMap<UserId, String> = HashMap::new();
    let mut out = Vec::with_capacity(memberships.len());
    let mut activity = HashMap::new();

    for membership in memberships {
        let access = auth.conversation(membership.conversation_id).await?;

        let other_member = if access.conversation.is_group {
            None
        } else {
            let ids = access.other_member_ids(caller);
            load_users(&mut auth, &ids).await?.into_iter().next()
        };

        let mut last_active = access.conversation.created_at;
        let mut last_message = None;
        if let Some(message_id) = access.conversation.last_message_id {
            if let Some(message) = auth.tx.message(message_id).await? {
                last_active = message.created_at;
                let sender = match names.get(&message.sender_id) {
                    Some(name) => name.clone(),
                    None => {
                        let name = auth
                            .user(message.sender_id)
                            .await?
                            .map(|u| u.username)
                            .unwrap_or_default();
                        names.insert(message.sender_id, name.clone());
                        name
                    }
                };
                last_message = Some(LastMessage {
                    sender,
                    kind: message.kind,
                    content: message.content,
                });
            }
        }

        activity.insert(access.id(), last_active);
        out.push(ConversationSummary {
            conversation: access.conversation,
            other_member,
            last_message,
        });
    }

    out.sort_by(|a, b| activity[&b.conversation.id].cmp(&activity[&a.conversation.id]));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::seed_three;
    use crate::ops::{friends, messages, requests};

    async fn befriend(store: &Store, from: &str, to_email: &str, to: &str) -> ConversationId {
        let id = requests::create(store, from, to_email).await.unwrap();
        requests::accept(store, to, id).await.unwrap()
    }

    #[tokio::test]
    async fn delete_group_rejects_direct_conversation() {
        let store = Store::memory();
        seed_three(&store).await;
        let direct = befriend(&store, "user_alice", "bob@example.com", "user_bob").await;

        match delete_group(&store, "user_alice", direct).await {
            Err(ApiError::PreconditionFailed(m)) => assert_eq!(m, "This is not a group conversation"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(get(&store, "user_alice", direct).await.is_ok());
    }

    #[tokio::test]
    async fn delete_group_cascades() {
        let store = Store::memory();
        let (_, bob, carol) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id, carol.id])
            .await
            .unwrap();
        let message =
            messages::create(&store, "user_bob", group, MessageKind::Text, vec!["hi".into()])
                .await
                .unwrap();

        delete_group(&store, "user_carol", group).await.unwrap();

        let mut tx = store.begin_read().await.unwrap();
        assert!(tx.conversation(group).await.unwrap().is_none());
        assert!(tx.members_of(group).await.unwrap().is_empty());
        assert!(tx.messages_of(group).await.unwrap().is_empty());
        assert!(tx.message(message).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_group_requires_membership() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Pair", &[bob.id])
            .await
            .unwrap();

        assert!(matches!(
            delete_group(&store, "user_carol", group).await,
            Err(ApiError::PreconditionFailed(_))
        ));
        assert!(matches!(
            delete_group(&store, "user_alice", ConversationId::new()).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn leave_group_removes_only_caller() {
        let store = Store::memory();
        let (_, bob, carol) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id, carol.id])
            .await
            .unwrap();

        leave_group(&store, "user_bob", group).await.unwrap();

        let details = get(&store, "user_alice", group).await.unwrap();
        let mut ids: Vec<_> = details.other_members.iter().map(|u| u.id).collect();
        ids.sort();
        assert_eq!(ids, vec![carol.id]);
        assert!(matches!(
            get(&store, "user_bob", group).await,
            Err(ApiError::PreconditionFailed(_))
        ));
        assert!(matches!(
            leave_group(&store, "user_bob", group).await,
            Err(ApiError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn last_member_leaving_removes_group() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = friends::create_group(&store, "user_alice", "Pair", &[bob.id])
            .await
            .unwrap();

        leave_group(&store, "user_alice", group).await.unwrap();
        leave_group(&store, "user_bob", group).await.unwrap();

        let mut tx = store.begin_read().await.unwrap();
        assert!(tx.conversation(group).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leave_group_rejects_direct_conversation() {
        let store = Store::memory();
        seed_three(&store).await;
        let direct = befriend(&store, "user_alice", "bob@example.com", "user_bob").await;
        assert!(matches!(
            leave_group(&store, "user_alice", direct).await,
            Err(ApiError::PreconditionFailed(_))
        ));
    }

    #[tokio::test]
    async fn list_shows_other_member_and_last_message() {
        let store = Store::memory();
        let (_, bob, carol) = seed_three(&store).await;
        let direct = befriend(&store, "user_alice", "bob@example.com", "user_bob").await;
        let group = friends::create_group(&store, "user_alice", "Team", &[bob.id, carol.id])
            .await
            .unwrap();
        messages::create(&store, "user_bob", direct, MessageKind::Text, vec!["yo".into()])
            .await
            .unwrap();

        let list = list(&store, "user_alice").await.unwrap();
        assert_eq!(list.len(), 2);
        // The direct conversation has the newest activity.
        assert_eq!(list[0].conversation.id, direct);
        assert_eq!(list[0].other_member.as_ref().map(|u| u.id), Some(bob.id));
        let last = list[0].last_message.as_ref().unwrap();
        assert_eq!(last.sender, bob.username);
        assert_eq!(last.content, vec!["yo".to_string()]);
        assert_eq!(list[1].conversation.id, group);
        assert!(list[1].other_member.is_none());
        assert!(list[1].last_message.is_none());
    }
}
