use anyhow::Result;
use async_trait::async_trait;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, NewConversation, PresenceUpdate, UserRecord},
};

mod feeds;
mod memory;
mod snapshots;
mod sqlite;

pub use memory::MemoryStore;
pub use snapshots::{DocSnapshots, Snapshots};
pub use sqlite::SqliteStore;

/// Durable document store with snapshot-listener semantics.
///
/// Subscriptions deliver the complete current result set on every change,
/// never deltas; a fresh subscriber sees the current state on its first
/// poll. Message documents are keyed by a client-chosen id, so a retried
/// write under the same id replaces rather than duplicates.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert_user(&self, user: UserRecord) -> Result<()>;
    async fn get_users(&self) -> Result<Vec<UserRecord>>;
    async fn subscribe_users(&self) -> Result<Snapshots<UserRecord>>;

    /// Atomic partial merge on the user document: only populated fields
    /// of the update change.
    async fn update_presence(&self, user_id: &UserId, update: PresenceUpdate) -> Result<()>;
    async fn subscribe_user(&self, user_id: &UserId) -> Result<DocSnapshots<UserRecord>>;

    /// Atomic single-document create returning the generated id.
    async fn create_conversation(&self, conversation: NewConversation) -> Result<ConversationId>;
    async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRecord>>;
    /// Membership-filtered feed: every conversation whose user list
    /// contains `user_id`.
    async fn subscribe_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Snapshots<ConversationRecord>>;

    /// Upsert keyed by `message.id`.
    async fn put_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()>;
    async fn messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>>;
    /// Ordered-by-`createdAt` feed of the full message set.
    async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Snapshots<MessageRecord>>;

    async fn set_latest_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()>;

    /// Atomic +1 for every member except `sender`.
    async fn bump_unread_counts(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
    ) -> Result<()>;
    /// Atomic set-to-zero for one member.
    async fn reset_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()>;
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
