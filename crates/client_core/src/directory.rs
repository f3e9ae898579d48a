use std::{cmp::Ordering, sync::Arc};

use anyhow::Result;
use futures::Stream;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::warn;

use shared::{
    domain::UserId,
    model::{Conversation, LatestMessage, User},
    protocol::{ConversationRecord, MessageRecord, UserRecord},
};
use storage::DurableStore;

use crate::{ClientEvent, SessionContext};

/// Canonical per-session lists of known users and conversations.
///
/// Both lists are fed by store subscriptions; derived fields (display
/// titles, latest-message subtexts, sort order) are recomputed whenever
/// either feed fires. UI access is snapshot/subscribe-only.
pub struct Directory {
    session: SessionContext,
    store: Arc<dyn DurableStore>,
    state: Mutex<DirectoryState>,
    users_tx: watch::Sender<Vec<User>>,
    conversations_tx: watch::Sender<Vec<Conversation>>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct DirectoryState {
    /// Known users, current user excluded.
    users: Vec<User>,
    /// Known users including the current user.
    all_users: Vec<User>,
    /// Raw records, re-hydrated whenever the user set changes.
    conversation_records: Vec<ConversationRecord>,
}

impl Directory {
    pub(crate) fn new(
        session: SessionContext,
        store: Arc<dyn DurableStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let current_user = User {
            is_current_user: true,
            ..session.user.clone()
        };
        let (users_tx, _) = watch::channel(Vec::new());
        let (conversations_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            session,
            store,
            state: Mutex::new(DirectoryState {
                users: Vec::new(),
                all_users: vec![current_user],
                conversation_records: Vec::new(),
            }),
            users_tx,
            conversations_tx,
            events,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the users and conversations subscriptions. Each feed delivers
    /// its current state immediately, so the directory is populated once
    /// this returns.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut users_feed = self.store.subscribe_users().await?;
        let mut conversations_feed = self
            .store
            .subscribe_conversations(self.session.user_id())
            .await?;

        // Prime synchronously so callers observe a populated directory.
        if let Some(users) = users_feed.next().await {
            self.store_users(users).await;
        }
        if let Some(conversations) = conversations_feed.next().await {
            self.store_conversations(conversations).await;
        }

        let directory = Arc::clone(self);
        let users_task = tokio::spawn(async move {
            while let Some(users) = users_feed.next().await {
                directory.store_users(users).await;
            }
        });

        let directory = Arc::clone(self);
        let conversations_task = tokio::spawn(async move {
            while let Some(conversations) = conversations_feed.next().await {
                directory.store_conversations(conversations).await;
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(users_task);
        tasks.push(conversations_task);
        Ok(())
    }

    /// Tear down the feed listeners. Without this (or dropping the
    /// directory) the store keeps the subscriptions alive.
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.lock().await.users.clone()
    }

    pub async fn all_users(&self) -> Vec<User> {
        self.state.lock().await.all_users.clone()
    }

    pub async fn user(&self, user_id: &UserId) -> Option<User> {
        self.state
            .lock()
            .await
            .all_users
            .iter()
            .find(|user| &user.id == user_id)
            .cloned()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations_tx.borrow().clone()
    }

    pub fn watch_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations_tx.subscribe()
    }

    pub fn conversations_stream(&self) -> impl Stream<Item = Vec<Conversation>> + Send {
        WatchStream::new(self.conversations_tx.subscribe())
    }

    pub fn watch_users(&self) -> watch::Receiver<Vec<User>> {
        self.users_tx.subscribe()
    }

    /// Existing non-group conversation containing `user_id`, if the
    /// membership feed has reported one. This is the convergence lookup
    /// for the creation race: whichever side lost the race finds the
    /// winner's record here.
    pub fn direct_conversation_with(&self, user_id: &UserId) -> Option<Conversation> {
        self.conversations().into_iter().find(|conversation| {
            !conversation.is_group && conversation.users.iter().any(|user| &user.id == user_id)
        })
    }

    async fn store_users(&self, records: Vec<UserRecord>) {
        let mut state = self.state.lock().await;
        let current_id = self.session.user_id().clone();
        state.users = records
            .into_iter()
            .filter(|record| record.id != current_id)
            .map(|record| User {
                id: record.id,
                name: record.name,
                avatar_url: record.avatar_url,
                is_current_user: false,
            })
            .collect();

        let mut all_users = state.users.clone();
        all_users.push(User {
            is_current_user: true,
            ..self.session.user.clone()
        });
        state.all_users = all_users;

        self.users_tx.send_replace(state.users.clone());
        let _ = self
            .events
            .send(ClientEvent::UsersUpdated(state.users.clone()));

        // User names feed conversation titles and latest-message lines,
        // so a user change re-hydrates the conversation list too.
        self.publish_conversations(&state);
    }

    async fn store_conversations(&self, records: Vec<ConversationRecord>) {
        let mut state = self.state.lock().await;
        state.conversation_records = records;
        self.publish_conversations(&state);
    }

    fn publish_conversations(&self, state: &DirectoryState) {
        let mut conversations: Vec<Conversation> = state
            .conversation_records
            .iter()
            .map(|record| hydrate_conversation(record, &state.all_users))
            .collect();
        sort_conversations(&mut conversations, self.session.user_id());

        self.conversations_tx.send_replace(conversations.clone());
        let _ = self
            .events
            .send(ClientEvent::ConversationsUpdated(conversations));
    }
}

/// Resolve a raw record against the known-user set. Members the directory
/// has not seen yet are dropped from the user list; a latest message from
/// an unknown sender is omitted rather than shown with a blank name.
fn hydrate_conversation(record: &ConversationRecord, all_users: &[User]) -> Conversation {
    let users: Vec<User> = record
        .users
        .iter()
        .filter_map(|id| all_users.iter().find(|user| &user.id == id).cloned())
        .collect();

    let latest_message = record
        .latest_message
        .as_ref()
        .and_then(|message| latest_message_line(message, all_users));

    Conversation {
        id: record.id.clone(),
        users,
        is_group: record.is_group,
        title: record.title.clone(),
        picture_url: record.picture_url.clone(),
        users_unread_count_info: record.users_unread_count_info.clone(),
        latest_message,
    }
}

fn latest_message_line(message: &MessageRecord, all_users: &[User]) -> Option<LatestMessage> {
    let sender = all_users.iter().find(|user| user.id == message.user_id)?;

    let subtext = if let Some(first) = message.attachments.first() {
        Some(first.kind.title().to_string())
    } else if message.recording.is_some() {
        Some("Voice recording".to_string())
    } else {
        None
    };

    Some(LatestMessage {
        sender_id: sender.id.clone(),
        sender_name: sender.name.clone(),
        created_at: message.created_at,
        text: if message.text.is_empty() {
            None
        } else {
            Some(message.text.clone())
        },
        subtext,
    })
}

/// Newest activity first; conversations that have never seen a message
/// come after every dated one, ordered by display title.
fn sort_conversations(conversations: &mut [Conversation], current_user: &UserId) {
    conversations.sort_by(|a, b| match (&a.latest_message, &b.latest_message) {
        (Some(lhs), Some(rhs)) => rhs.created_at.cmp(&lhs.created_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a
            .display_title(current_user)
            .cmp(&b.display_title(current_user)),
    });
}

impl Drop for Directory {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        } else {
            warn!("directory dropped while listener registry was locked");
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
