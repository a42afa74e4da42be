use std::collections::BTreeSet;

use chrono::Utc;
use log::info;

use super::conflict_as;
use super::conversations::delete_dependents;
use crate::error::{ApiError, ApiResult};
use crate::guard::Authed;
use crate::model::{Conversation, ConversationId, ConversationMember, MemberId, User, UserId};
use crate::store::Store;

/// The users on the other side of every friendship involving the caller.
pub async fn get(store: &Store, subject: &str) -> ApiResult<Vec<User>> {
    let mut auth = Authed::begin_read(store, subject).await?;
    let caller = auth.caller_id();
    let friendships = auth.tx.friendships_of(caller).await?;

    let mut friends = Vec::with_capacity(friendships.len());
    for friendship in friendships {
        let Some(other) = friendship.pair.other(caller) else {
            continue;
        };
        let friend = auth
            .user(other)
            .await?
            .ok_or_else(|| ApiError::not_found("Friend not found"))?;
        friends.push(friend);
    }
    Ok(friends)
}

pub async fn create_group(
    store: &Store,
    subject: &str,
    name: &str,
    members: &[UserId],
) -> ApiResult<ConversationId> {
    let mut auth = Authed::begin(store, subject).await?;
    let caller = auth.caller_id();

    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("Group name is required"));
    }
    let distinct: BTreeSet<UserId> = members.iter().copied().filter(|id| *id != caller).collect();
    if distinct.is_empty() {
        return Err(ApiError::validation("At least one member is required"));
    }
    for id in &distinct {
        if auth.user(*id).await?.is_none() {
            return Err(ApiError::not_found("Member could not be found"));
        }
    }

    let conversation = Conversation {
        id: ConversationId::new(),
        is_group: true,
        name: Some(name.to_string()),
        last_message_id: None,
        created_at: Utc::now(),
    };
    auth.tx.insert_conversation(&conversation).await?;

    for member_id in distinct.iter().copied().chain(std::iter::once(caller)) {
        let member = ConversationMember {
            id: MemberId::new(),
            conversation_id: conversation.id,
            member_id,
        };
        auth.tx
            .insert_member(&member)
            .await
            .map_err(conflict_as("Member added twice"))?;
    }

    auth.commit().await?;
    info!(
        "Group {} created by {} with {} members",
        conversation.id,
        caller,
        distinct.len() + 1
    );
    Ok(conversation.id)
}

/// End a friendship: the direct conversation, the friendship row, both
/// memberships and every message go together.
pub async fn remove(store: &Store, subject: &str, conversation_id: ConversationId) -> ApiResult<()> {
    let mut auth = Authed::begin(store, subject).await?;
    let access = auth.conversation(conversation_id).await?;

    access.require_several_members("This conversation does not have any members")?;
    access.require_member(auth.caller_id(), "You are not a member of this conversation")?;

    let friendship = auth
        .tx
        .friendship_for_conversation(conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Friend could not be found"))?;

    auth.tx.delete_conversation(conversation_id).await?;
    auth.tx.delete_friendship(friendship.id).await?;
    delete_dependents(auth.tx.as_mut(), &access).await?;
    auth.commit().await?;

    info!("Friendship {} removed with conversation {}", friendship.id, conversation_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FriendPair, MessageKind};
    use crate::ops::testutil::seed_three;
    use crate::ops::{messages, requests};

    async fn befriend(store: &Store, from: &str, to_email: &str, to: &str) -> ConversationId {
        let id = requests::create(store, from, to_email).await.unwrap();
        requests::accept(store, to, id).await.unwrap()
    }

    #[tokio::test]
    async fn get_returns_other_side_of_each_friendship() {
        let store = Store::memory();
        let (alice, bob, carol) = seed_three(&store).await;
        befriend(&store, "user_alice", "bob@example.com", "user_bob").await;
        befriend(&store, "user_carol", "alice@example.com", "user_alice").await;

        let mut ids: Vec<_> = get(&store, "user_alice")
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        ids.sort();
        let mut expected = vec![bob.id, carol.id];
        expected.sort();
        assert_eq!(ids, expected);

        let bobs: Vec<_> = get(&store, "user_bob").await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id, alice.id);
        assert!(get(&store, "user_carol").await.unwrap().iter().all(|u| u.id != bob.id));
    }

    #[tokio::test]
    async fn remove_cascades_everything() {
        let store = Store::memory();
        let (alice, bob, _) = seed_three(&store).await;
        let conversation = befriend(&store, "user_alice", "bob@example.com", "user_bob").await;
        messages::create(&store, "user_alice", conversation, MessageKind::Text, vec!["hey".into()])
            .await
            .unwrap();

        remove(&store, "user_bob", conversation).await.unwrap();

        let mut tx = store.begin_read().await.unwrap();
        assert!(tx.conversation(conversation).await.unwrap().is_none());
        assert!(tx
            .friendship_for_pair(FriendPair::new(alice.id, bob.id))
            .await
            .unwrap()
            .is_none());
        assert!(tx.members_of(conversation).await.unwrap().is_empty());
        assert!(tx.messages_of(conversation).await.unwrap().is_empty());
        drop(tx);

        assert!(matches!(
            remove(&store, "user_bob", conversation).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(get(&store, "user_alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_requires_membership() {
        let store = Store::memory();
        seed_three(&store).await;
        let conversation = befriend(&store, "user_alice", "bob@example.com", "user_bob").await;

        match remove(&store, "user_carol", conversation).await {
            Err(ApiError::PreconditionFailed(m)) => {
                assert_eq!(m, "You are not a member of this conversation")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(get(&store, "user_alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_on_group_has_no_friendship() {
        let store = Store::memory();
        let (_, bob, _) = seed_three(&store).await;
        let group = create_group(&store, "user_alice", "Pair", &[bob.id]).await.unwrap();

        match remove(&store, "user_alice", group).await {
            Err(ApiError::NotFound(m)) => assert_eq!(m, "Friend could not be found"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_group_validates_input() {
        let store = Store::memory();
        let (alice, bob, _) = seed_three(&store).await;

        assert!(matches!(
            create_group(&store, "user_alice", "   ", &[bob.id]).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            create_group(&store, "user_alice", "Team", &[]).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            create_group(&store, "user_alice", "Team", &[alice.id]).await,
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            create_group(&store, "user_alice", "Team", &[bob.id, UserId::new()]).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_group_adds_caller_once() {
        let store = Store::memory();
        let (alice, bob, carol) = seed_three(&store).await;

        let group = create_group(
            &store,
            "user_alice",
            "  Team  ",
            &[bob.id, carol.id, bob.id, alice.id],
        )
        .await
        .unwrap();

        let mut tx = store.begin_read().await.unwrap();
        let conversation = tx.conversation(group).await.unwrap().unwrap();
        assert!(conversation.is_group);
        assert_eq!(conversation.name.as_deref(), Some("Team"));
        let mut members: Vec<_> = tx
            .members_of(group)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.member_id)
            .collect();
        members.sort();
        let mut expected = vec![alice.id, bob.id, carol.id];
        expected.sort();
        assert_eq!(members, expected);
    }
}
