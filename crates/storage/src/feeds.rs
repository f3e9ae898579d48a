use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::watch;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, UserRecord},
};

use crate::{DocSnapshots, Snapshots};

/// Listener registry shared by both store implementations.
///
/// Senders are created lazily: the first subscriber for a key registers a
/// watch channel seeded with the snapshot the caller computed, and later
/// mutations push refreshed snapshots through `send_replace` so the value
/// stays current even while nobody is listening.
pub(crate) struct Feeds {
    users: watch::Sender<Vec<UserRecord>>,
    user_docs: Mutex<HashMap<UserId, watch::Sender<Option<UserRecord>>>>,
    conversations: Mutex<HashMap<UserId, watch::Sender<Vec<ConversationRecord>>>>,
    messages: Mutex<HashMap<ConversationId, watch::Sender<Vec<MessageRecord>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Feeds {
    pub(crate) fn new() -> Self {
        let (users, _) = watch::channel(Vec::new());
        Self {
            users,
            user_docs: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn subscribe_users(&self, current: Vec<UserRecord>) -> Snapshots<UserRecord> {
        self.users.send_replace(current);
        Snapshots::new(self.users.subscribe())
    }

    pub(crate) fn publish_users(&self, users: Vec<UserRecord>) {
        self.users.send_replace(users);
    }

    pub(crate) fn subscribe_user_doc(
        &self,
        user_id: &UserId,
        current: Option<UserRecord>,
    ) -> DocSnapshots<UserRecord> {
        let mut docs = lock(&self.user_docs);
        let sender = docs.entry(user_id.clone()).or_insert_with(|| {
            let (tx, _) = watch::channel(None);
            tx
        });
        sender.send_replace(current);
        DocSnapshots::new(sender.subscribe())
    }

    pub(crate) fn publish_user_doc(&self, user_id: &UserId, record: UserRecord) {
        let docs = lock(&self.user_docs);
        if let Some(sender) = docs.get(user_id) {
            sender.send_replace(Some(record));
        }
    }

    pub(crate) fn subscribe_conversations(
        &self,
        user_id: &UserId,
        current: Vec<ConversationRecord>,
    ) -> Snapshots<ConversationRecord> {
        let mut feeds = lock(&self.conversations);
        let sender = feeds.entry(user_id.clone()).or_insert_with(|| {
            let (tx, _) = watch::channel(Vec::new());
            tx
        });
        sender.send_replace(current);
        Snapshots::new(sender.subscribe())
    }

    /// Members whose conversation feed has a registered listener channel.
    pub(crate) fn conversation_listeners(&self) -> Vec<UserId> {
        lock(&self.conversations).keys().cloned().collect()
    }

    pub(crate) fn publish_conversations(
        &self,
        user_id: &UserId,
        conversations: Vec<ConversationRecord>,
    ) {
        let feeds = lock(&self.conversations);
        if let Some(sender) = feeds.get(user_id) {
            sender.send_replace(conversations);
        }
    }

    pub(crate) fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
        current: Vec<MessageRecord>,
    ) -> Snapshots<MessageRecord> {
        let mut feeds = lock(&self.messages);
        let sender = feeds.entry(conversation_id.clone()).or_insert_with(|| {
            let (tx, _) = watch::channel(Vec::new());
            tx
        });
        sender.send_replace(current);
        Snapshots::new(sender.subscribe())
    }

    pub(crate) fn has_message_listeners(&self, conversation_id: &ConversationId) -> bool {
        lock(&self.messages).contains_key(conversation_id)
    }

    pub(crate) fn publish_messages(
        &self,
        conversation_id: &ConversationId,
        messages: Vec<MessageRecord>,
    ) {
        let feeds = lock(&self.messages);
        if let Some(sender) = feeds.get(conversation_id) {
            sender.send_replace(messages);
        }
    }
}
