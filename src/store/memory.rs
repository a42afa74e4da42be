//! In-process backend. Tables live behind one `RwLock`. Read-only transactions
//! share the read guard; a writing transaction holds the write guard for its
//! whole life, applies changes in place and records how to revert each one.
//! Dropping it without committing replays that log backwards.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::{StoreError, StoreResult, StoreTx};
use crate::model::{
    Conversation, ConversationId, ConversationMember, FriendPair, FriendRequest, Friendship,
    FriendshipId, MemberId, Message, MessageId, RequestId, User, UserId, UserProfile,
};

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub users: HashMap<UserId, User>,
    /// clerk_id -> user
    pub users_by_clerk_id: HashMap<String, UserId>,
    /// email -> user (non-empty emails only)
    pub users_by_email: HashMap<String, UserId>,
    pub requests: HashMap<RequestId, FriendRequest>,
    /// (sender, receiver) -> request
    pub requests_by_pair: HashMap<(UserId, UserId), RequestId>,
    pub friendships: HashMap<FriendshipId, Friendship>,
    pub friendships_by_pair: HashMap<FriendPair, FriendshipId>,
    pub conversations: HashMap<ConversationId, Conversation>,
    pub members: HashMap<MemberId, ConversationMember>,
    /// (conversation, user) -> membership
    pub members_by_pair: HashMap<(ConversationId, UserId), MemberId>,
    /// conversation -> messages in insertion order
    pub messages: HashMap<ConversationId, Vec<Message>>,
    pub message_conversation: HashMap<MessageId, ConversationId>,
}

/// Inverse of one applied change.
#[derive(Debug)]
enum Undo {
    User(UserId, Option<User>),
    ClerkIndex(String, Option<UserId>),
    EmailIndex(String, Option<UserId>),
    Request(RequestId, Option<FriendRequest>),
    RequestPair((UserId, UserId), Option<RequestId>),
    Friendship(FriendshipId, Option<Friendship>),
    FriendshipPair(FriendPair, Option<FriendshipId>),
    Conversation(ConversationId, Option<Conversation>),
    Member(MemberId, Option<ConversationMember>),
    MemberPair((ConversationId, UserId), Option<MemberId>),
    MessagePushed(ConversationId),
    MessagesRemoved(ConversationId, Vec<Message>),
}

fn restore<K: Eq + Hash, V>(map: &mut HashMap<K, V>, key: K, old: Option<V>) {
    match old {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Undo {
    fn revert(self, t: &mut Tables) {
        match self {
            Undo::User(k, old) => restore(&mut t.users, k, old),
            Undo::ClerkIndex(k, old) => restore(&mut t.users_by_clerk_id, k, old),
            Undo::EmailIndex(k, old) => restore(&mut t.users_by_email, k, old),
            Undo::Request(k, old) => restore(&mut t.requests, k, old),
            Undo::RequestPair(k, old) => restore(&mut t.requests_by_pair, k, old),
            Undo::Friendship(k, old) => restore(&mut t.friendships, k, old),
            Undo::FriendshipPair(k, old) => restore(&mut t.friendships_by_pair, k, old),
            Undo::Conversation(k, old) => restore(&mut t.conversations, k, old),
            Undo::Member(k, old) => restore(&mut t.members, k, old),
            Undo::MemberPair(k, old) => restore(&mut t.members_by_pair, k, old),
            Undo::MessagePushed(cid) => {
                if let Some(msgs) = t.messages.get_mut(&cid) {
                    if let Some(m) = msgs.pop() {
                        t.message_conversation.remove(&m.id);
                    }
                    if msgs.is_empty() {
                        t.messages.remove(&cid);
                    }
                }
            }
            Undo::MessagesRemoved(cid, msgs) => {
                for m in &msgs {
                    t.message_conversation.insert(m.id, cid);
                }
                t.messages.insert(cid, msgs);
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(&self) -> MemoryTx {
        MemoryTx {
            guard: Guard::Write(self.tables.clone().write_owned().await),
            undo: Vec::new(),
        }
    }

    /// A transaction that may only read; any number run at once.
    pub async fn begin_read(&self) -> MemoryTx {
        MemoryTx {
            guard: Guard::Read(self.tables.clone().read_owned().await),
            undo: Vec::new(),
        }
    }
}

enum Guard {
    Read(OwnedRwLockReadGuard<Tables>),
    Write(OwnedRwLockWriteGuard<Tables>),
}

pub struct MemoryTx {
    guard: Guard,
    undo: Vec<Undo>,
}

impl MemoryTx {
    fn read(&self) -> &Tables {
        match &self.guard {
            Guard::Read(g) => &**g,
            Guard::Write(g) => &**g,
        }
    }

    fn write(&mut self) -> StoreResult<(&mut Tables, &mut Vec<Undo>)> {
        match &mut self.guard {
            Guard::Write(g) => Ok((&mut **g, &mut self.undo)),
            Guard::Read(_) => Err(StoreError::Backend(
                "write in a read-only transaction".to_string(),
            )),
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Guard::Write(g) = &mut self.guard {
            while let Some(undo) = self.undo.pop() {
                undo.revert(&mut **g);
            }
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn user(&mut self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.read().users.get(&id).cloned())
    }

    async fn user_by_clerk_id(&mut self, clerk_id: &str) -> StoreResult<Option<User>> {
        let t = self.read();
        Ok(t.users_by_clerk_id
            .get(clerk_id)
            .and_then(|id| t.users.get(id))
            .cloned())
    }

    async fn user_by_email(&mut self, email: &str) -> StoreResult<Option<User>> {
        let t = self.read();
        Ok(t.users_by_email
            .get(email)
            .and_then(|id| t.users.get(id))
            .cloned())
    }

    async fn upsert_user(&mut self, profile: &UserProfile) -> StoreResult<User> {
        let (t, undo) = self.write()?;
        let existing = t.users_by_clerk_id.get(&profile.clerk_id).copied();
        if !profile.email.is_empty() {
            if let Some(owner) = t.users_by_email.get(&profile.email) {
                if Some(*owner) != existing {
                    return Err(StoreError::Conflict(format!(
                        "email {} belongs to another user",
                        profile.email
                    )));
                }
            }
        }

        let user = match existing.and_then(|id| t.users.get(&id)).cloned() {
            Some(old) => {
                if old.email != profile.email && !old.email.is_empty() {
                    let prev = t.users_by_email.remove(&old.email);
                    undo.push(Undo::EmailIndex(old.email.clone(), prev));
                }
                User {
                    id: old.id,
                    username: profile.username.clone(),
                    image_url: profile.image_url.clone(),
                    clerk_id: profile.clerk_id.clone(),
                    email: profile.email.clone(),
                    created_at: old.created_at,
                }
            }
            None => User {
                id: UserId::new(),
                username: profile.username.clone(),
                image_url: profile.image_url.clone(),
                clerk_id: profile.clerk_id.clone(),
                email: profile.email.clone(),
                created_at: Utc::now(),
            },
        };

        let prev = t.users_by_clerk_id.insert(user.clerk_id.clone(), user.id);
        undo.push(Undo::ClerkIndex(user.clerk_id.clone(), prev));
        if !user.email.is_empty() {
            let prev = t.users_by_email.insert(user.email.clone(), user.id);
            undo.push(Undo::EmailIndex(user.email.clone(), prev));
        }
        let prev = t.users.insert(user.id, user.clone());
        undo.push(Undo::User(user.id, prev));
        Ok(user)
    }

    async fn request(&mut self, id: RequestId) -> StoreResult<Option<FriendRequest>> {
        Ok(self.read().requests.get(&id).cloned())
    }

    async fn request_between(
        &mut self,
        sender: UserId,
        receiver: UserId,
    ) -> StoreResult<Option<FriendRequest>> {
        let t = self.read();
        Ok(t.requests_by_pair
            .get(&(sender, receiver))
            .and_then(|id| t.requests.get(id))
            .cloned())
    }

    async fn requests_for_receiver(&mut self, receiver: UserId) -> StoreResult<Vec<FriendRequest>> {
        let mut out: Vec<FriendRequest> = self
            .read()
            .requests
            .values()
            .filter(|r| r.receiver == receiver)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn insert_request(&mut self, request: &FriendRequest) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        let key = (request.sender, request.receiver);
        let reverse = (request.receiver, request.sender);
        if t.requests_by_pair.contains_key(&key) || t.requests_by_pair.contains_key(&reverse) {
            return Err(StoreError::Conflict("request already exists".to_string()));
        }
        let prev = t.requests_by_pair.insert(key, request.id);
        undo.push(Undo::RequestPair(key, prev));
        let prev = t.requests.insert(request.id, request.clone());
        undo.push(Undo::Request(request.id, prev));
        Ok(())
    }

    async fn delete_request(&mut self, id: RequestId) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(req) = t.requests.remove(&id) {
            let key = (req.sender, req.receiver);
            let prev = t.requests_by_pair.remove(&key);
            undo.push(Undo::RequestPair(key, prev));
            undo.push(Undo::Request(id, Some(req)));
        }
        Ok(())
    }

    async fn friendship_for_pair(&mut self, pair: FriendPair) -> StoreResult<Option<Friendship>> {
        let t = self.read();
        Ok(t.friendships_by_pair
            .get(&pair)
            .and_then(|id| t.friendships.get(id))
            .cloned())
    }

    async fn friendship_for_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<Friendship>> {
        Ok(self
            .read()
            .friendships
            .values()
            .find(|f| f.conversation_id == conversation_id)
            .cloned())
    }

    async fn friendships_of(&mut self, user: UserId) -> StoreResult<Vec<Friendship>> {
        Ok(self
            .read()
            .friendships
            .values()
            .filter(|f| f.pair.contains(user))
            .cloned()
            .collect())
    }

    async fn insert_friendship(&mut self, friendship: &Friendship) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if t.friendships_by_pair.contains_key(&friendship.pair) {
            return Err(StoreError::Conflict("friendship already exists".to_string()));
        }
        let prev = t.friendships_by_pair.insert(friendship.pair, friendship.id);
        undo.push(Undo::FriendshipPair(friendship.pair, prev));
        let prev = t.friendships.insert(friendship.id, friendship.clone());
        undo.push(Undo::Friendship(friendship.id, prev));
        Ok(())
    }

    async fn delete_friendship(&mut self, id: FriendshipId) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(f) = t.friendships.remove(&id) {
            let prev = t.friendships_by_pair.remove(&f.pair);
            undo.push(Undo::FriendshipPair(f.pair, prev));
            undo.push(Undo::Friendship(id, Some(f)));
        }
        Ok(())
    }

    async fn conversation(&mut self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        Ok(self.read().conversations.get(&id).cloned())
    }

    async fn insert_conversation(&mut self, conversation: &Conversation) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        let prev = t.conversations.insert(conversation.id, conversation.clone());
        undo.push(Undo::Conversation(conversation.id, prev));
        Ok(())
    }

    async fn set_last_message(
        &mut self,
        id: ConversationId,
        message_id: MessageId,
    ) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(c) = t.conversations.get_mut(&id) {
            undo.push(Undo::Conversation(id, Some(c.clone())));
            c.last_message_id = Some(message_id);
        }
        Ok(())
    }

    async fn delete_conversation(&mut self, id: ConversationId) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(c) = t.conversations.remove(&id) {
            undo.push(Undo::Conversation(id, Some(c)));
        }
        Ok(())
    }

    async fn members_of(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ConversationMember>> {
        Ok(self
            .read()
            .members
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn memberships_of_user(&mut self, user: UserId) -> StoreResult<Vec<ConversationMember>> {
        Ok(self
            .read()
            .members
            .values()
            .filter(|m| m.member_id == user)
            .cloned()
            .collect())
    }

    async fn insert_member(&mut self, member: &ConversationMember) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        let key = (member.conversation_id, member.member_id);
        if t.members_by_pair.contains_key(&key) {
            return Err(StoreError::Conflict("membership already exists".to_string()));
        }
        let prev = t.members_by_pair.insert(key, member.id);
        undo.push(Undo::MemberPair(key, prev));
        let prev = t.members.insert(member.id, member.clone());
        undo.push(Undo::Member(member.id, prev));
        Ok(())
    }

    async fn delete_member(&mut self, id: MemberId) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(m) = t.members.remove(&id) {
            let key = (m.conversation_id, m.member_id);
            let prev = t.members_by_pair.remove(&key);
            undo.push(Undo::MemberPair(key, prev));
            undo.push(Undo::Member(id, Some(m)));
        }
        Ok(())
    }

    async fn message(&mut self, id: MessageId) -> StoreResult<Option<Message>> {
        let t = self.read();
        Ok(t.message_conversation
            .get(&id)
            .and_then(|cid| t.messages.get(cid))
            .and_then(|msgs| msgs.iter().rev().find(|m| m.id == id))
            .cloned())
    }

    async fn messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        Ok(self
            .read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_message(&mut self, message: &Message) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if t.message_conversation.contains_key(&message.id) {
            return Err(StoreError::Conflict("message already exists".to_string()));
        }
        t.message_conversation
            .insert(message.id, message.conversation_id);
        t.messages
            .entry(message.conversation_id)
            .or_default()
            .push(message.clone());
        undo.push(Undo::MessagePushed(message.conversation_id));
        Ok(())
    }

    async fn delete_messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<()> {
        let (t, undo) = self.write()?;
        if let Some(msgs) = t.messages.remove(&conversation_id) {
            for m in &msgs {
                t.message_conversation.remove(&m.id);
            }
            undo.push(Undo::MessagesRemoved(conversation_id, msgs));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tx = self;
        tx.undo.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(clerk_id: &str, email: &str) -> UserProfile {
        UserProfile {
            username: "Ada Lovelace".to_string(),
            image_url: String::new(),
            clerk_id: clerk_id.to_string(),
            email: email.to_string(),
        }
    }

    fn message(conversation_id: ConversationId, text: &str) -> Message {
        Message {
            id: MessageId::new(),
            conversation_id,
            sender_id: UserId::new(),
            kind: crate::model::MessageKind::Text,
            content: vec![text.to_string()],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await;
            tx.upsert_user(&profile("user_1", "ada@example.com")).await.unwrap();
        }
        let mut tx = store.begin().await;
        assert!(tx.user_by_clerk_id("user_1").await.unwrap().is_none());
        assert!(tx.user_by_email("ada@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let mut tx = Box::new(store.begin().await);
        let user = tx.upsert_user(&profile("user_1", "ada@example.com")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_read().await;
        let found = tx.user_by_email("ada@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
    }

    #[tokio::test]
    async fn rollback_restores_overwritten_and_deleted_rows() {
        let store = MemoryStore::new();
        let conversation_id = ConversationId::new();
        let kept = message(conversation_id, "kept");
        {
            let mut tx = Box::new(store.begin().await);
            tx.upsert_user(&profile("user_1", "old@example.com")).await.unwrap();
            tx.insert_message(&kept).await.unwrap();
            tx.commit().await.unwrap();
        }
        {
            let mut tx = store.begin().await;
            tx.upsert_user(&profile("user_1", "new@example.com")).await.unwrap();
            tx.insert_message(&message(conversation_id, "dropped")).await.unwrap();
            tx.delete_messages_of(conversation_id).await.unwrap();
            assert!(tx.message(kept.id).await.unwrap().is_none());
        }

        let mut tx = store.begin_read().await;
        let user = tx.user_by_clerk_id("user_1").await.unwrap().unwrap();
        assert_eq!(user.email, "old@example.com");
        assert!(tx.user_by_email("new@example.com").await.unwrap().is_none());
        assert_eq!(tx.messages_of(conversation_id).await.unwrap(), vec![kept.clone()]);
        assert_eq!(tx.message(kept.id).await.unwrap(), Some(kept));
    }

    #[tokio::test]
    async fn read_transactions_refuse_writes_and_run_together() {
        let store = MemoryStore::new();
        let mut first = store.begin_read().await;
        let mut second = store.begin_read().await;
        assert!(second.user_by_clerk_id("user_1").await.unwrap().is_none());
        let err = first.upsert_user(&profile("user_1", "")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn delete_messages_of_leaves_other_conversations() {
        let store = MemoryStore::new();
        let a = ConversationId::new();
        let b = ConversationId::new();
        let other = message(b, "other");
        let mut tx = store.begin().await;
        tx.insert_message(&message(a, "one")).await.unwrap();
        tx.insert_message(&message(a, "two")).await.unwrap();
        tx.insert_message(&other).await.unwrap();

        tx.delete_messages_of(a).await.unwrap();

        assert!(tx.messages_of(a).await.unwrap().is_empty());
        assert_eq!(tx.messages_of(b).await.unwrap(), vec![other]);
        assert_eq!(tx.read().message_conversation.len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_id_and_reindexes_email() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await;
        let first = tx.upsert_user(&profile("user_1", "old@example.com")).await.unwrap();
        let second = tx.upsert_user(&profile("user_1", "new@example.com")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(tx.user_by_email("old@example.com").await.unwrap().is_none());
        assert_eq!(tx.user_by_email("new@example.com").await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn email_owned_by_another_user_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await;
        tx.upsert_user(&profile("user_1", "ada@example.com")).await.unwrap();
        let err = tx.upsert_user(&profile("user_2", "ada@example.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn empty_emails_do_not_collide() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await;
        tx.upsert_user(&profile("user_1", "")).await.unwrap();
        tx.upsert_user(&profile("user_2", "")).await.unwrap();
        assert_eq!(tx.read().users.len(), 2);
    }
}
