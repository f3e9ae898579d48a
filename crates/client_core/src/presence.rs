use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use shared::{
    domain::UserId,
    protocol::{PresenceUpdate, UserRecord},
};
use storage::DurableStore;

use crate::{ClientEvent, SessionContext};

/// Quiet period after the last draft change before "stopped typing" is
/// published.
pub const TYPING_DEBOUNCE: Duration = Duration::from_secs(2);

/// Publishes the session user's ephemeral status and mirrors the status
/// of tracked counterparts.
///
/// Online/offline follows app-lifecycle signals only — there is no
/// heartbeat, so "online" is an optimistic signal and a peer that dies
/// without backgrounding stays online until it says otherwise. Typing
/// publishes coalesce through a debounce timer: rapid keystrokes produce
/// one "stopped typing" event after the burst, not one per keystroke.
pub struct PresenceTracker {
    session: SessionContext,
    store: Arc<dyn DurableStore>,
    state: Mutex<PresenceState>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct PresenceState {
    online: HashMap<UserId, bool>,
    typing: HashMap<UserId, bool>,
    last_draft: String,
}

impl PresenceTracker {
    pub(crate) fn new(
        session: SessionContext,
        store: Arc<dyn DurableStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            state: Mutex::new(PresenceState::default()),
            debounce: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            events,
        })
    }

    /// Follow one counterpart's user document and mirror its presence
    /// fields into the local status maps.
    pub async fn track_user(self: &Arc<Self>, user_id: &UserId) -> Result<()> {
        let mut doc = self.store.subscribe_user(user_id).await?;
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(snapshot) = doc.next().await {
                let Some(record) = snapshot else {
                    continue;
                };
                tracker.store_status(record).await;
            }
        });
        self.listeners.lock().await.push(task);
        Ok(())
    }

    /// Signal a draft-text change. Publishes `isTyping = true` once per
    /// change and re-arms the debounce; an unchanged draft (cursor moves,
    /// repeated notifications) publishes nothing.
    pub async fn draft_changed(self: &Arc<Self>, draft_text: &str) {
        {
            let mut state = self.state.lock().await;
            if state.last_draft == draft_text {
                return;
            }
            state.last_draft = draft_text.to_string();
        }

        self.publish(PresenceUpdate::typing(true)).await;

        let tracker = Arc::clone(self);
        let replacement = tokio::spawn(async move {
            tokio::time::sleep(TYPING_DEBOUNCE).await;
            tracker.publish(PresenceUpdate::typing(false)).await;
            tracker.state.lock().await.last_draft.clear();
        });
        let mut debounce = self.debounce.lock().await;
        if let Some(previous) = debounce.replace(replacement) {
            previous.abort();
        }
    }

    pub async fn app_became_active(&self) {
        self.publish(PresenceUpdate::online(true)).await;
    }

    pub async fn app_entered_background(&self) {
        self.publish(PresenceUpdate::online(false)).await;
    }

    pub async fn online_status(&self) -> HashMap<UserId, bool> {
        self.state.lock().await.online.clone()
    }

    pub async fn typing_status(&self) -> HashMap<UserId, bool> {
        self.state.lock().await.typing.clone()
    }

    /// Derived status line. Offline wins over a stale typing flag; typing
    /// wins over plain online.
    pub async fn status_text(&self, user_id: &UserId) -> &'static str {
        let state = self.state.lock().await;
        let online = state.online.get(user_id).copied().unwrap_or(false);
        let typing = state.typing.get(user_id).copied().unwrap_or(false);
        if !online {
            "Offline"
        } else if typing {
            "Typing"
        } else {
            "Online"
        }
    }

    /// Stop counterpart listeners and any armed debounce timer.
    pub async fn close(&self) {
        let mut listeners = self.listeners.lock().await;
        for task in listeners.drain(..) {
            task.abort();
        }
        drop(listeners);
        if let Some(task) = self.debounce.lock().await.take() {
            task.abort();
        }
    }

    async fn store_status(&self, record: UserRecord) {
        {
            let mut state = self.state.lock().await;
            state.online.insert(record.id.clone(), record.is_online);
            state.typing.insert(record.id.clone(), record.is_typing);
        }
        let _ = self.events.send(ClientEvent::PresenceUpdated {
            user_id: record.id,
            is_online: record.is_online,
            is_typing: record.is_typing,
        });
    }

    /// Presence writes are best-effort and eventually consistent; a
    /// failed publish is logged and dropped, never surfaced to the UI.
    async fn publish(&self, update: PresenceUpdate) {
        if let Err(error) = self
            .store
            .update_presence(self.session.user_id(), update)
            .await
        {
            warn!(user_id = %self.session.user_id(), %error, "presence publish failed");
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
