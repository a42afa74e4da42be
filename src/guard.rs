//! Authorization guard shared by every operation.
//!
//! An operation opens an [`Authed`] context, which begins the transaction and
//! resolves the caller, then uses the precondition helpers below before it
//! writes anything. Committing the context commits the transaction; dropping it
//! rolls everything back.

use crate::error::{ApiError, ApiResult};
use crate::identity::resolve_caller;
use crate::model::{Conversation, ConversationId, ConversationMember, User, UserId};
use crate::store::{Store, StoreTx};

pub struct Authed {
    pub tx: Box<dyn StoreTx>,
    pub caller: User,
}

impl Authed {
    pub async fn begin(store: &Store, subject: &str) -> ApiResult<Self> {
        let mut tx = store.begin().await?;
        let caller = resolve_caller(tx.as_mut(), subject).await?;
        Ok(Self { tx, caller })
    }

    /// Same as [`Authed::begin`] on a read-only transaction.
    pub async fn begin_read(store: &Store, subject: &str) -> ApiResult<Self> {
        let mut tx = store.begin_read().await?;
        let caller = resolve_caller(tx.as_mut(), subject).await?;
        Ok(Self { tx, caller })
    }

    pub fn caller_id(&self) -> UserId {
        self.caller.id
    }

    pub async fn commit(self) -> ApiResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn conversation(&mut self, id: ConversationId) -> ApiResult<ConversationAccess> {
        ConversationAccess::load(self.tx.as_mut(), id).await
    }

    pub async fn user(&mut self, id: UserId) -> ApiResult<Option<User>> {
        Ok(self.tx.user(id).await?)
    }
}

/// A conversation together with its membership rows.
#[derive(Debug, Clone)]
pub struct ConversationAccess {
    pub conversation: Conversation,
    pub members: Vec<ConversationMember>,
}

impl ConversationAccess {
    pub async fn load(tx: &mut dyn StoreTx, id: ConversationId) -> ApiResult<Self> {
        let conversation = tx
            .conversation(id)
            .await?
            .ok_or_else(|| ApiError::not_found("The conversation is not found"))?;
        let members = tx.members_of(id).await?;
        Ok(Self {
            conversation,
            members,
        })
    }

    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn membership(&self, user: UserId) -> Option<&ConversationMember> {
        self.members.iter().find(|m| m.member_id == user)
    }

    pub fn require_group(&self) -> ApiResult<()> {
        if !self.conversation.is_group {
            return Err(ApiError::precondition("This is not a group conversation"));
        }
        Ok(())
    }

    pub fn require_several_members(&self, msg: &str) -> ApiResult<()> {
        if self.members.len() <= 1 {
            return Err(ApiError::precondition(msg));
        }
        Ok(())
    }

    pub fn require_member(&self, user: UserId, msg: &str) -> ApiResult<&ConversationMember> {
        self.membership(user)
            .ok_or_else(|| ApiError::precondition(msg))
    }

    pub fn other_member_ids(&self, user: UserId) -> Vec<UserId> {
        self.members
            .iter()
            .map(|m| m.member_id)
            .filter(|id| *id != user)
            .collect()
    }
}
