use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tracing::warn;
use url::Url;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, NewConversation, PresenceUpdate, UserRecord},
};

use crate::{feeds::Feeds, DocSnapshots, DurableStore, Snapshots};

/// SQLite-backed implementation of [`DurableStore`].
///
/// Nested message payloads (attachments, recording, reply snapshot) are
/// stored as JSON columns; unread counters live on the membership rows so
/// bumps are a single atomic `UPDATE`.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    feeds: Feeds,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            feeds: Feeds::new(),
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn users_snapshot(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(
            "SELECT id, name, avatar_url, is_online, is_typing
             FROM users
             ORDER BY lower(name) ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(user_from_row).collect())
    }

    async fn user_record(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, name, avatar_url, is_online, is_typing FROM users WHERE id = ?",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(user_from_row))
    }

    async fn conversations_snapshot(&self, user_id: &UserId) -> Result<Vec<ConversationRecord>> {
        let rows = sqlx::query(
            "SELECT c.id, c.is_group, c.title, c.picture_url, c.latest_message
             FROM conversations c
             INNER JOIN conversation_members m ON m.conversation_id = c.id
             WHERE m.user_id = ?
             ORDER BY c.id ASC",
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in rows {
            let id = ConversationId(row.get::<String, _>(0));
            let members = sqlx::query(
                "SELECT user_id, unread_count FROM conversation_members WHERE conversation_id = ?",
            )
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await?;

            let users: Vec<UserId> = members
                .iter()
                .map(|m| UserId(m.get::<String, _>(0)))
                .collect();
            let users_unread_count_info = members
                .iter()
                .map(|m| (UserId(m.get::<String, _>(0)), m.get::<i64, _>(1).max(0) as u32))
                .collect();

            let latest_message = row
                .get::<Option<String>, _>(4)
                .map(|json| serde_json::from_str::<MessageRecord>(&json))
                .transpose()
                .context("malformed latest_message column")?;

            conversations.push(ConversationRecord {
                id,
                users,
                is_group: row.get::<bool, _>(1),
                title: row.get::<Option<String>, _>(2),
                picture_url: row
                    .get::<Option<String>, _>(3)
                    .and_then(|raw| Url::parse(&raw).ok()),
                users_unread_count_info,
                latest_message,
            });
        }
        Ok(conversations)
    }

    async fn messages_snapshot(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            "SELECT id, user_id, created_at, text, attachments, recording, reply_message
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn conversation_members(&self, conversation_id: &ConversationId) -> Result<Vec<UserId>> {
        let rows =
            sqlx::query("SELECT user_id FROM conversation_members WHERE conversation_id = ?")
                .bind(conversation_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<String, _>(0)))
            .collect())
    }

    /// Snapshot feeds are refreshed best-effort after a committed write; a
    /// failed refresh leaves listeners one change behind, never corrupts
    /// the store.
    async fn refresh_user_feeds(&self, user_id: &UserId) {
        match self.users_snapshot().await {
            Ok(users) => self.feeds.publish_users(users),
            Err(error) => warn!(%error, "failed to refresh users feed"),
        }
        match self.user_record(user_id).await {
            Ok(Some(record)) => self.feeds.publish_user_doc(user_id, record),
            Ok(None) => {}
            Err(error) => warn!(%user_id, %error, "failed to refresh user doc feed"),
        }
    }

    async fn refresh_conversation_feeds(&self, conversation_id: &ConversationId) {
        for user_id in self.feeds.conversation_listeners() {
            match self.conversations_snapshot(&user_id).await {
                Ok(conversations) => self.feeds.publish_conversations(&user_id, conversations),
                Err(error) => {
                    warn!(%user_id, %error, "failed to refresh conversations feed")
                }
            }
        }
        if self.feeds.has_message_listeners(conversation_id) {
            match self.messages_snapshot(conversation_id).await {
                Ok(messages) => self.feeds.publish_messages(conversation_id, messages),
                Err(error) => {
                    warn!(%conversation_id, %error, "failed to refresh messages feed")
                }
            }
        }
    }
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> UserRecord {
    UserRecord {
        id: UserId(row.get::<String, _>(0)),
        name: row.get::<String, _>(1),
        avatar_url: row
            .get::<Option<String>, _>(2)
            .and_then(|raw| Url::parse(&raw).ok()),
        is_online: row.get::<bool, _>(3),
        is_typing: row.get::<bool, _>(4),
    }
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> Result<MessageRecord> {
    let attachments = serde_json::from_str(&row.get::<String, _>(4))
        .context("malformed attachments column")?;
    let recording = row
        .get::<Option<String>, _>(5)
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .context("malformed recording column")?;
    let reply_message = row
        .get::<Option<String>, _>(6)
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .context("malformed reply_message column")?;

    Ok(MessageRecord {
        id: shared::domain::MessageId(row.get::<String, _>(0)),
        user_id: UserId(row.get::<String, _>(1)),
        created_at: row.get::<DateTime<Utc>, _>(2),
        text: row.get::<String, _>(3),
        attachments,
        recording,
        reply_message,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, name, avatar_url, is_online, is_typing)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, avatar_url = excluded.avatar_url",
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .bind(user.avatar_url.as_ref().map(Url::as_str))
        .bind(user.is_online)
        .bind(user.is_typing)
        .execute(&self.pool)
        .await?;

        self.refresh_user_feeds(&user.id).await;
        Ok(())
    }

    async fn get_users(&self) -> Result<Vec<UserRecord>> {
        self.users_snapshot().await
    }

    async fn subscribe_users(&self) -> Result<Snapshots<UserRecord>> {
        let current = self.users_snapshot().await?;
        Ok(self.feeds.subscribe_users(current))
    }

    async fn update_presence(&self, user_id: &UserId, update: PresenceUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let updated = sqlx::query(
            "UPDATE users
             SET is_online = COALESCE(?, is_online), is_typing = COALESCE(?, is_typing)
             WHERE id = ?",
        )
        .bind(update.is_online)
        .bind(update.is_typing)
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            bail!("unknown user {user_id}");
        }

        self.refresh_user_feeds(user_id).await;
        Ok(())
    }

    async fn subscribe_user(&self, user_id: &UserId) -> Result<DocSnapshots<UserRecord>> {
        let current = self.user_record(user_id).await?;
        Ok(self.feeds.subscribe_user_doc(user_id, current))
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<ConversationId> {
        if conversation.users.is_empty() {
            bail!("conversation must have at least one member");
        }

        let id = ConversationId::fresh();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (id, is_group, title, picture_url) VALUES (?, ?, ?, ?)",
        )
        .bind(id.as_str())
        .bind(conversation.is_group)
        .bind(conversation.title.as_deref())
        .bind(conversation.picture_url.as_ref().map(Url::as_str))
        .execute(&mut *tx)
        .await?;

        for user_id in &conversation.users {
            let unread = conversation
                .users_unread_count_info
                .get(user_id)
                .copied()
                .unwrap_or(0);
            sqlx::query(
                "INSERT INTO conversation_members (conversation_id, user_id, unread_count)
                 VALUES (?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(user_id.as_str())
            .bind(i64::from(unread))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.refresh_conversation_feeds(&id).await;
        Ok(id)
    }

    async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRecord>> {
        self.conversations_snapshot(user_id).await
    }

    async fn subscribe_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Snapshots<ConversationRecord>> {
        let current = self.conversations_snapshot(user_id).await?;
        Ok(self.feeds.subscribe_conversations(user_id, current))
    }

    async fn put_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            bail!("unknown conversation {conversation_id}");
        }

        let attachments = serde_json::to_string(&message.attachments)?;
        let recording = message
            .recording
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let reply_message = message
            .reply_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO messages (conversation_id, id, user_id, created_at, text, attachments, recording, reply_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, id) DO UPDATE SET
                user_id = excluded.user_id,
                created_at = excluded.created_at,
                text = excluded.text,
                attachments = excluded.attachments,
                recording = excluded.recording,
                reply_message = excluded.reply_message",
        )
        .bind(conversation_id.as_str())
        .bind(message.id.as_str())
        .bind(message.user_id.as_str())
        .bind(message.created_at)
        .bind(&message.text)
        .bind(attachments)
        .bind(recording)
        .bind(reply_message)
        .execute(&self.pool)
        .await?;

        self.refresh_conversation_feeds(conversation_id).await;
        Ok(())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>> {
        self.messages_snapshot(conversation_id).await
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Snapshots<MessageRecord>> {
        let current = self.messages_snapshot(conversation_id).await?;
        Ok(self.feeds.subscribe_messages(conversation_id, current))
    }

    async fn set_latest_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()> {
        let json = serde_json::to_string(&message)?;
        let updated = sqlx::query("UPDATE conversations SET latest_message = ? WHERE id = ?")
            .bind(json)
            .bind(conversation_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            bail!("unknown conversation {conversation_id}");
        }

        self.refresh_conversation_feeds(conversation_id).await;
        Ok(())
    }

    async fn bump_unread_counts(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
    ) -> Result<()> {
        let members = self.conversation_members(conversation_id).await?;
        if members.is_empty() {
            bail!("unknown conversation {conversation_id}");
        }

        sqlx::query(
            "UPDATE conversation_members
             SET unread_count = unread_count + 1
             WHERE conversation_id = ? AND user_id <> ?",
        )
        .bind(conversation_id.as_str())
        .bind(sender.as_str())
        .execute(&self.pool)
        .await?;

        self.refresh_conversation_feeds(conversation_id).await;
        Ok(())
    }

    async fn reset_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversation_members
             SET unread_count = 0
             WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.as_str())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        self.refresh_conversation_feeds(conversation_id).await;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
