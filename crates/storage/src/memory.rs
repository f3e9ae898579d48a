use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::{bail, Result};
use async_trait::async_trait;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, NewConversation, PresenceUpdate, UserRecord},
};

use crate::{feeds::Feeds, DocSnapshots, DurableStore, Snapshots};

/// In-process implementation of [`DurableStore`].
///
/// Backs the client test-beds and small single-process deployments where
/// the store and the clients share one runtime.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    feeds: Feeds,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserRecord>,
    conversations: HashMap<ConversationId, ConversationRecord>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
}

impl Inner {
    fn users_snapshot(&self) -> Vec<UserRecord> {
        let mut users: Vec<UserRecord> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        users
    }

    fn conversations_snapshot(&self, user_id: &UserId) -> Vec<ConversationRecord> {
        let mut conversations: Vec<ConversationRecord> = self
            .conversations
            .values()
            .filter(|record| record.contains_user(user_id))
            .cloned()
            .collect();
        conversations.sort_by(|a, b| a.id.cmp(&b.id));
        conversations
    }

    fn messages_snapshot(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        let mut messages = self
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages
    }
}

fn lock(mutex: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            feeds: Feeds::new(),
        }
    }

    /// Push refreshed conversation snapshots to every member feed that has
    /// a listener, then refresh the message feed if one is registered.
    fn publish_conversation_change(&self, inner: &Inner, conversation_id: &ConversationId) {
        for user_id in self.feeds.conversation_listeners() {
            self.feeds
                .publish_conversations(&user_id, inner.conversations_snapshot(&user_id));
        }
        if self.feeds.has_message_listeners(conversation_id) {
            self.feeds
                .publish_messages(conversation_id, inner.messages_snapshot(conversation_id));
        }
    }

    fn publish_user_change(&self, inner: &Inner, user_id: &UserId) {
        self.feeds.publish_users(inner.users_snapshot());
        if let Some(record) = inner.users.get(user_id) {
            self.feeds.publish_user_doc(user_id, record.clone());
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert_user(&self, user: UserRecord) -> Result<()> {
        let mut inner = lock(&self.inner);
        let user_id = user.id.clone();
        inner.users.insert(user_id.clone(), user);
        self.publish_user_change(&inner, &user_id);
        Ok(())
    }

    async fn get_users(&self) -> Result<Vec<UserRecord>> {
        Ok(lock(&self.inner).users_snapshot())
    }

    async fn subscribe_users(&self) -> Result<Snapshots<UserRecord>> {
        let inner = lock(&self.inner);
        Ok(self.feeds.subscribe_users(inner.users_snapshot()))
    }

    async fn update_presence(&self, user_id: &UserId, update: PresenceUpdate) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut inner = lock(&self.inner);
        let Some(record) = inner.users.get_mut(user_id) else {
            bail!("unknown user {user_id}");
        };
        if let Some(is_online) = update.is_online {
            record.is_online = is_online;
        }
        if let Some(is_typing) = update.is_typing {
            record.is_typing = is_typing;
        }
        self.publish_user_change(&inner, user_id);
        Ok(())
    }

    async fn subscribe_user(&self, user_id: &UserId) -> Result<DocSnapshots<UserRecord>> {
        let inner = lock(&self.inner);
        let current = inner.users.get(user_id).cloned();
        Ok(self.feeds.subscribe_user_doc(user_id, current))
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<ConversationId> {
        if conversation.users.is_empty() {
            bail!("conversation must have at least one member");
        }
        let mut inner = lock(&self.inner);
        let id = ConversationId::fresh();
        let record = ConversationRecord {
            id: id.clone(),
            users: conversation.users,
            is_group: conversation.is_group,
            title: conversation.title,
            picture_url: conversation.picture_url,
            users_unread_count_info: conversation.users_unread_count_info,
            latest_message: None,
        };
        inner.conversations.insert(id.clone(), record);
        inner.messages.insert(id.clone(), Vec::new());
        self.publish_conversation_change(&inner, &id);
        Ok(id)
    }

    async fn conversations_for_user(&self, user_id: &UserId) -> Result<Vec<ConversationRecord>> {
        Ok(lock(&self.inner).conversations_snapshot(user_id))
    }

    async fn subscribe_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Snapshots<ConversationRecord>> {
        let inner = lock(&self.inner);
        let current = inner.conversations_snapshot(user_id);
        Ok(self.feeds.subscribe_conversations(user_id, current))
    }

    async fn put_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.conversations.contains_key(conversation_id) {
            bail!("unknown conversation {conversation_id}");
        }
        let messages = inner.messages.entry(conversation_id.clone()).or_default();
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => messages.push(message),
        }
        self.publish_conversation_change(&inner, conversation_id);
        Ok(())
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>> {
        Ok(lock(&self.inner).messages_snapshot(conversation_id))
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Snapshots<MessageRecord>> {
        let inner = lock(&self.inner);
        let current = inner.messages_snapshot(conversation_id);
        Ok(self.feeds.subscribe_messages(conversation_id, current))
    }

    async fn set_latest_message(
        &self,
        conversation_id: &ConversationId,
        message: MessageRecord,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(record) = inner.conversations.get_mut(conversation_id) else {
            bail!("unknown conversation {conversation_id}");
        };
        record.latest_message = Some(message);
        self.publish_conversation_change(&inner, conversation_id);
        Ok(())
    }

    async fn bump_unread_counts(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(record) = inner.conversations.get_mut(conversation_id) else {
            bail!("unknown conversation {conversation_id}");
        };
        let members = record.users.clone();
        for member in members {
            if &member == sender {
                continue;
            }
            *record.users_unread_count_info.entry(member).or_insert(0) += 1;
        }
        self.publish_conversation_change(&inner, conversation_id);
        Ok(())
    }

    async fn reset_unread_count(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Some(record) = inner.conversations.get_mut(conversation_id) else {
            bail!("unknown conversation {conversation_id}");
        };
        record
            .users_unread_count_info
            .insert(user_id.clone(), 0);
        self.publish_conversation_change(&inner, conversation_id);
        Ok(())
    }
}
