//! Postgres backend (feature `postgres`). One sqlx transaction per operation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{StoreError, StoreResult, StoreTx};
use crate::model::{
    Conversation, ConversationId, ConversationMember, FriendPair, FriendRequest, Friendship,
    FriendshipId, MemberId, Message, MessageId, MessageKind, RequestId, User, UserId, UserProfile,
};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE codes that mean another transaction got there first.
fn is_conflict_code(code: &str) -> bool {
    code == UNIQUE_VIOLATION || code == SERIALIZATION_FAILURE
}

fn db_err(ctx: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        if let sqlx::Error::Database(db) = &e {
            if db.code().as_deref().is_some_and(is_conflict_code) {
                return StoreError::Conflict(format!("{}: {}", ctx, db.message()));
            }
        }
        StoreError::Backend(format!("{}: {}", ctx, e))
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(db_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .map_err(db_err("connect"))?;
        init_db(&pool).await?;
        Ok(Self { pool })
    }

    /// Serializable, so check-then-write sequences cannot interleave. A
    /// transaction that loses a race fails with [`StoreError::Conflict`].
    pub async fn begin(&self) -> StoreResult<PgTx> {
        self.begin_with("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .await
    }

    pub async fn begin_read(&self) -> StoreResult<PgTx> {
        self.begin_with("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY")
            .await
    }

    async fn begin_with(&self, mode: &'static str) -> StoreResult<PgTx> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin"))?;
        sqlx::query(mode)
            .execute(&mut *tx)
            .await
            .map_err(db_err("begin"))?;
        Ok(PgTx { tx })
    }
}

pub async fn init_db(pool: &PgPool) -> StoreResult<()> {
    let statements: [(&'static str, &str); 11] = [
        (
            "init_db users",
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id UUID PRIMARY KEY,
              username TEXT NOT NULL,
              image_url TEXT NOT NULL,
              clerk_id TEXT NOT NULL UNIQUE,
              email TEXT NOT NULL,
              created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        ),
        (
            "init_db users_email_idx",
            "CREATE UNIQUE INDEX IF NOT EXISTS users_email_idx ON users (email) WHERE email <> '';",
        ),
        (
            "init_db friend_requests",
            r#"
            CREATE TABLE IF NOT EXISTS friend_requests (
              id UUID PRIMARY KEY,
              sender UUID NOT NULL,
              receiver UUID NOT NULL,
              created_at TIMESTAMPTZ NOT NULL,
              UNIQUE (sender, receiver)
            );
            "#,
        ),
        (
            "init_db friend_requests_pair_idx",
            "CREATE UNIQUE INDEX IF NOT EXISTS friend_requests_pair_idx ON friend_requests (LEAST(sender, receiver), GREATEST(sender, receiver));",
        ),
        (
            "init_db friend_requests_receiver_idx",
            "CREATE INDEX IF NOT EXISTS friend_requests_receiver_idx ON friend_requests (receiver);",
        ),
        (
            "init_db conversations",
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
              id UUID PRIMARY KEY,
              is_group BOOLEAN NOT NULL,
              name TEXT,
              last_message_id UUID,
              created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        ),
        (
            "init_db friendships",
            r#"
            CREATE TABLE IF NOT EXISTS friendships (
              id UUID PRIMARY KEY,
              user_low UUID NOT NULL,
              user_high UUID NOT NULL,
              conversation_id UUID NOT NULL UNIQUE,
              created_at TIMESTAMPTZ NOT NULL,
              UNIQUE (user_low, user_high)
            );
            "#,
        ),
        (
            "init_db conversation_members",
            r#"
            CREATE TABLE IF NOT EXISTS conversation_members (
              id UUID PRIMARY KEY,
              conversation_id UUID NOT NULL,
              member_id UUID NOT NULL,
              UNIQUE (conversation_id, member_id)
            );
            "#,
        ),
        (
            "init_db conversation_members_member_idx",
            "CREATE INDEX IF NOT EXISTS conversation_members_member_idx ON conversation_members (member_id);",
        ),
        (
            "init_db messages",
            r#"
            CREATE TABLE IF NOT EXISTS messages (
              seq BIGSERIAL,
              id UUID PRIMARY KEY,
              conversation_id UUID NOT NULL,
              sender_id UUID NOT NULL,
              kind TEXT NOT NULL,
              content TEXT[] NOT NULL,
              created_at TIMESTAMPTZ NOT NULL
            );
            "#,
        ),
        (
            "init_db messages_conversation_idx",
            "CREATE INDEX IF NOT EXISTS messages_conversation_idx ON messages (conversation_id, seq);",
        ),
    ];

    for (ctx, sql) in statements {
        sqlx::query(sql).execute(pool).await.map_err(db_err(ctx))?;
    }
    Ok(())
}

// ---------- Row mapping ----------

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: UserId(row.try_get("id")?),
        username: row.try_get("username")?,
        image_url: row.try_get("image_url")?,
        clerk_id: row.try_get("clerk_id")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<FriendRequest, sqlx::Error> {
    Ok(FriendRequest {
        id: RequestId(row.try_get("id")?),
        sender: UserId(row.try_get("sender")?),
        receiver: UserId(row.try_get("receiver")?),
        created_at: row.try_get("created_at")?,
    })
}

fn friendship_from_row(row: &PgRow) -> Result<Friendship, sqlx::Error> {
    let low: Uuid = row.try_get("user_low")?;
    let high: Uuid = row.try_get("user_high")?;
    Ok(Friendship {
        id: FriendshipId(row.try_get("id")?),
        pair: FriendPair::new(UserId(low), UserId(high)),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        created_at: row.try_get("created_at")?,
    })
}

fn conversation_from_row(row: &PgRow) -> Result<Conversation, sqlx::Error> {
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        is_group: row.try_get("is_group")?,
        name: row.try_get("name")?,
        last_message_id: row
            .try_get::<Option<Uuid>, _>("last_message_id")?
            .map(MessageId),
        created_at: row.try_get("created_at")?,
    })
}

fn member_from_row(row: &PgRow) -> Result<ConversationMember, sqlx::Error> {
    Ok(ConversationMember {
        id: MemberId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        member_id: UserId(row.try_get("member_id")?),
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let kind = MessageKind::parse(&kind).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "kind".to_string(),
        source: format!("unknown message kind {}", kind).into(),
    })?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        kind,
        content: row.try_get("content")?,
        created_at,
    })
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn fetch_optional<T>(
        &mut self,
        ctx: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T, sqlx::Error>,
    ) -> StoreResult<Option<T>> {
        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err(ctx))?;
        row.as_ref().map(map).transpose().map_err(db_err(ctx))
    }

    async fn fetch_all<T>(
        &mut self,
        ctx: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        map: fn(&PgRow) -> Result<T, sqlx::Error>,
    ) -> StoreResult<Vec<T>> {
        let rows = query.fetch_all(&mut *self.tx).await.map_err(db_err(ctx))?;
        rows.iter()
            .map(map)
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err(ctx))
    }

    async fn execute(
        &mut self,
        ctx: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> StoreResult<()> {
        query.execute(&mut *self.tx).await.map_err(db_err(ctx))?;
        Ok(())
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn user(&mut self, id: UserId) -> StoreResult<Option<User>> {
        let q = sqlx::query("SELECT * FROM users WHERE id = $1").bind(id.0);
        self.fetch_optional("user", q, user_from_row).await
    }

    async fn user_by_clerk_id(&mut self, clerk_id: &str) -> StoreResult<Option<User>> {
        let q = sqlx::query("SELECT * FROM users WHERE clerk_id = $1").bind(clerk_id.to_string());
        self.fetch_optional("user_by_clerk_id", q, user_from_row).await
    }

    async fn user_by_email(&mut self, email: &str) -> StoreResult<Option<User>> {
        let q = sqlx::query("SELECT * FROM users WHERE email = $1 AND email <> ''")
            .bind(email.to_string());
        self.fetch_optional("user_by_email", q, user_from_row).await
    }

    async fn upsert_user(&mut self, profile: &UserProfile) -> StoreResult<User> {
        let q = sqlx::query(
            r#"
            INSERT INTO users (id, username, image_url, clerk_id, email, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (clerk_id) DO UPDATE
            SET username = EXCLUDED.username,
                image_url = EXCLUDED.image_url,
                email = EXCLUDED.email
            RETURNING *
            "#,
        )
        .bind(UserId::new().0)
        .bind(profile.username.clone())
        .bind(profile.image_url.clone())
        .bind(profile.clerk_id.clone())
        .bind(profile.email.clone());
        self.fetch_optional("upsert_user", q, user_from_row)
            .await?
            .ok_or_else(|| StoreError::Backend("upsert_user: no row returned".to_string()))
    }

    async fn request(&mut self, id: RequestId) -> StoreResult<Option<FriendRequest>> {
        let q = sqlx::query("SELECT * FROM friend_requests WHERE id = $1").bind(id.0);
        self.fetch_optional("request", q, request_from_row).await
    }

    async fn request_between(
        &mut self,
        sender: UserId,
        receiver: UserId,
    ) -> StoreResult<Option<FriendRequest>> {
        let q = sqlx::query("SELECT * FROM friend_requests WHERE sender = $1 AND receiver = $2")
            .bind(sender.0)
            .bind(receiver.0);
        self.fetch_optional("request_between", q, request_from_row).await
    }

    async fn requests_for_receiver(&mut self, receiver: UserId) -> StoreResult<Vec<FriendRequest>> {
        let q = sqlx::query("SELECT * FROM friend_requests WHERE receiver = $1 ORDER BY created_at")
            .bind(receiver.0);
        self.fetch_all("requests_for_receiver", q, request_from_row).await
    }

    async fn insert_request(&mut self, request: &FriendRequest) -> StoreResult<()> {
        let q = sqlx::query(
            "INSERT INTO friend_requests (id, sender, receiver, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(request.id.0)
        .bind(request.sender.0)
        .bind(request.receiver.0)
        .bind(request.created_at);
        self.execute("insert_request", q).await
    }

    async fn delete_request(&mut self, id: RequestId) -> StoreResult<()> {
        let q = sqlx::query("DELETE FROM friend_requests WHERE id = $1").bind(id.0);
        self.execute("delete_request", q).await
    }

    async fn friendship_for_pair(&mut self, pair: FriendPair) -> StoreResult<Option<Friendship>> {
        let q = sqlx::query("SELECT * FROM friendships WHERE user_low = $1 AND user_high = $2")
            .bind(pair.low().0)
            .bind(pair.high().0);
        self.fetch_optional("friendship_for_pair", q, friendship_from_row).await
    }

    async fn friendship_for_conversation(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Option<Friendship>> {
        let q = sqlx::query("SELECT * FROM friendships WHERE conversation_id = $1")
            .bind(conversation_id.0);
        self.fetch_optional("friendship_for_conversation", q, friendship_from_row)
            .await
    }

    async fn friendships_of(&mut self, user: UserId) -> StoreResult<Vec<Friendship>> {
        let q = sqlx::query("SELECT * FROM friendships WHERE user_low = $1 OR user_high = $1")
            .bind(user.0);
        self.fetch_all("friendships_of", q, friendship_from_row).await
    }

    async fn insert_friendship(&mut self, friendship: &Friendship) -> StoreResult<()> {
        let q = sqlx::query(
            r#"
            INSERT INTO friendships (id, user_low, user_high, conversation_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(friendship.id.0)
        .bind(friendship.pair.low().0)
        .bind(friendship.pair.high().0)
        .bind(friendship.conversation_id.0)
        .bind(friendship.created_at);
        self.execute("insert_friendship", q).await
    }

    async fn delete_friendship(&mut self, id: FriendshipId) -> StoreResult<()> {
        let q = sqlx::query("DELETE FROM friendships WHERE id = $1").bind(id.0);
        self.execute("delete_friendship", q).await
    }

    async fn conversation(&mut self, id: ConversationId) -> StoreResult<Option<Conversation>> {
        let q = sqlx::query("SELECT * FROM conversations WHERE id = $1").bind(id.0);
        self.fetch_optional("conversation", q, conversation_from_row).await
    }

    async fn insert_conversation(&mut self, conversation: &Conversation) -> StoreResult<()> {
        let q = sqlx::query(
            r#"
            INSERT INTO conversations (id, is_group, name, last_message_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(conversation.id.0)
        .bind(conversation.is_group)
        .bind(conversation.name.clone())
        .bind(conversation.last_message_id.map(|m| m.0))
        .bind(conversation.created_at);
        self.execute("insert_conversation", q).await
    }

    async fn set_last_message(
        &mut self,
        id: ConversationId,
        message_id: MessageId,
    ) -> StoreResult<()> {
        let q = sqlx::query("UPDATE conversations SET last_message_id = $2 WHERE id = $1")
            .bind(id.0)
            .bind(message_id.0);
        self.execute("set_last_message", q).await
    }

    async fn delete_conversation(&mut self, id: ConversationId) -> StoreResult<()> {
        let q = sqlx::query("DELETE FROM conversations WHERE id = $1").bind(id.0);
        self.execute("delete_conversation", q).await
    }

    async fn members_of(
        &mut self,
        conversation_id: ConversationId,
    ) -> StoreResult<Vec<ConversationMember>> {
        let q = sqlx::query("SELECT * FROM conversation_members WHERE conversation_id = $1")
            .bind(conversation_id.0);
        self.fetch_all("members_of", q, member_from_row).await
    }

    async fn memberships_of_user(&mut self, user: UserId) -> StoreResult<Vec<ConversationMember>> {
        let q = sqlx::query("SELECT * FROM conversation_members WHERE member_id = $1").bind(user.0);
        self.fetch_all("memberships_of_user", q, member_from_row).await
    }

    async fn insert_member(&mut self, member: &ConversationMember) -> StoreResult<()> {
        let q = sqlx::query(
            "INSERT INTO conversation_members (id, conversation_id, member_id) VALUES ($1, $2, $3)",
        )
        .bind(member.id.0)
        .bind(member.conversation_id.0)
        .bind(member.member_id.0);
        self.execute("insert_member", q).await
    }

    async fn delete_member(&mut self, id: MemberId) -> StoreResult<()> {
        let q = sqlx::query("DELETE FROM conversation_members WHERE id = $1").bind(id.0);
        self.execute("delete_member", q).await
    }

    async fn message(&mut self, id: MessageId) -> StoreResult<Option<Message>> {
        let q = sqlx::query("SELECT * FROM messages WHERE id = $1").bind(id.0);
        self.fetch_optional("message", q, message_from_row).await
    }

    async fn messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let q = sqlx::query("SELECT * FROM messages WHERE conversation_id = $1 ORDER BY seq")
            .bind(conversation_id.0);
        self.fetch_all("messages_of", q, message_from_row).await
    }

    async fn insert_message(&mut self, message: &Message) -> StoreResult<()> {
        let q = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, kind, content, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id.0)
        .bind(message.conversation_id.0)
        .bind(message.sender_id.0)
        .bind(message.kind.as_str())
        .bind(message.content.clone())
        .bind(message.created_at);
        self.execute("insert_message", q).await
    }

    async fn delete_messages_of(&mut self, conversation_id: ConversationId) -> StoreResult<()> {
        let q = sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id.0);
        self.execute("delete_messages_of", q).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(db_err("commit"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_races_are_conflicts() {
        assert!(is_conflict_code("23505"));
        assert!(is_conflict_code("40001"));
        assert!(!is_conflict_code("23503"));
        assert!(!is_conflict_code("42P01"));
    }
}
