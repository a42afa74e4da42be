//! Storage handle. Every operation opens one transaction with [`Store::begin`],
//! does its reads and writes through [`StoreTx`], and commits. Pure reads use
//! [`Store::begin_read`]. Dropping a transaction without committing discards
//! all of its writes.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Conversation, ConversationId, ConversationMember, FriendPair, FriendRequest, Friendship,
    FriendshipId, MemberId, Message, MessageId, RequestId, User, UserId, UserProfile,
};

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness rule was violated (duplicate request, pair, email, ...).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait StoreTx: Send {
    // ---------- Users ----------
    async fn user(&mut self, id: UserId) -> StoreResult<Option<User>>;
    async fn user_by_clerk_id(&mut self, clerk_id: &str) -> StoreResult<Option<User>>;
    async fn user_by_email(&mut self, email: &str) -> StoreResult<Option<User>>;
    /// Insert, or overwrite the profile of the user with the same `clerk_id`.
    async fn upsert_user(&mut self, profile: &UserProfile) -> StoreResult<User>;

    // ---------- Friend requests ----------
    async fn request(&mut self, id: RequestId) -> StoreResult<Option<FriendRequest>>;
    async fn request_between(
        &mut self,
        sender: UserId,
        receiver: UserId,
    ) -> StoreResult<Option<FriendRequest>>;
    async fn requests_for_receiver(&mut self, receiver: UserId) -> StoreResult<Vec<FriendRequest>>;
    async fn insert_request(&mut self, request: &FriendRequest) -> StoreResult<()>;
    async fn delete_request(&mut self, id: RequestId) -> StoreResult<()>;

    // ---------- Friendships ----------
    async fn friendship_for_pair(&mut self, pair: FriendPair) -> StoreResult<Option<Friendship>>;
    async fn friendship_for_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<Friendship>>;
    async fn friendships_of(&mut self, user: UserId) -> StoreResult<Vec<Friendship>>;
    async fn insert_friendship(&mut self, friendship: &Friendship) -> StoreResult<()>;
    async fn delete_friendship(&mut self, id: FriendshipId) -> StoreResult<()>;

    // ---------- Conversations ----------
    async fn conversation(&mut self, id: ConversationId) -> StoreResult<Option<Conversation>>;
    async fn insert_conversation(&mut self, conversation: &Conversation) -> StoreResult<()>;
    async fn set_last_message(
        &mut self,
        id: ConversationId,
        message_id: MessageId,
    ) -> StoreResult<()>;
    async fn delete_conversation(&mut self, id: ConversationId) -> StoreResult<()>;

    // ---------- Memberships ----------
    async fn members_of(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ConversationMember>>;
    async fn memberships_of_user(&mut self, user: UserId) -> StoreResult<Vec<ConversationMember>>;
    async fn insert_member(&mut self, member: &ConversationMember) -> StoreResult<()>;
    async fn delete_member(&mut self, id: MemberId) -> StoreResult<()>;

    // ---------- Messages ----------
    async fn message(&mut self, id: MessageId) -> StoreResult<Option<Message>>;
    /// Oldest first.
    async fn messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<Vec<Message>>;
    async fn insert_message(&mut self, message: &Message) -> StoreResult<()>;
    /// Removes every message of the conversation.
    async fn delete_messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Client handle shared by every handler. Cloning is cheap.
#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    #[cfg(feature = "postgres")]
    Postgres(PgStore),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(MemoryStore::new())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            #[cfg(feature = "postgres")]
            Store::Postgres(_) => "postgres",
        }
    }

    pub async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        match self {
            Store::Memory(store) => Ok(Box::new(store.begin().await)),
            #[cfg(feature = "postgres")]
            Store::Postgres(store) => Ok(Box::new(store.begin().await?)),
        }
    }

    /// Like [`Store::begin`] but every write fails. Read transactions do not
    /// block each other.
    pub async fn begin_read(&self) -> StoreResult<Box<dyn StoreTx>> {
        match self {
            Store::Memory(store) => Ok(Box::new(store.begin_read().await)),
            #[cfg(feature = "postgres")]
            Store::Postgres(store) => Ok(Box::new(store.begin_read().await?)),
        }
    }
}
