use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use url::Url;

use shared::{
    domain::{ConversationId, UserId},
    model::{Conversation, Media, Message, Recording, User},
    protocol::UserRecord,
};
use storage::DurableStore;

pub mod conversation;
pub mod directory;
pub mod error;
pub mod presence;
mod upload;

pub use conversation::ConversationController;
pub use directory::Directory;
pub use error::{SendError, UploadError};
pub use presence::{PresenceTracker, TYPING_DEBOUNCE};

/// Explicitly constructed session identity. Passed into every component
/// instead of living in process-wide singletons, so engines stay testable
/// without hidden state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user: User,
    pub device_id: String,
}

impl SessionContext {
    pub fn new(user: User, device_id: impl Into<String>) -> Self {
        Self {
            user,
            device_id: device_id.into(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}

/// Out-of-band media upload. Implementations return durable URLs; the
/// engine never submits a message until every referenced upload resolved.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload_image(&self, media: &Media) -> Result<Url>;
    /// Returns `(thumbnail, full)`; both must succeed.
    async fn upload_video(&self, media: &Media) -> Result<(Url, Url)>;
    async fn upload_recording(&self, recording: &Recording) -> Result<Url>;
}

/// Null object for text-only deployments: any media send fails cleanly.
pub struct MissingMediaUploader;

#[async_trait]
impl MediaUploader for MissingMediaUploader {
    async fn upload_image(&self, media: &Media) -> Result<Url> {
        Err(anyhow!("media uploader unavailable for media {}", media.id))
    }

    async fn upload_video(&self, media: &Media) -> Result<(Url, Url)> {
        Err(anyhow!("media uploader unavailable for media {}", media.id))
    }

    async fn upload_recording(&self, _recording: &Recording) -> Result<Url> {
        Err(anyhow!("media uploader unavailable for voice recording"))
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    UsersUpdated(Vec<User>),
    ConversationsUpdated(Vec<Conversation>),
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageSendFailed {
        conversation_id: Option<ConversationId>,
        message_id: shared::domain::MessageId,
        reason: String,
    },
    PresenceUpdated {
        user_id: UserId,
        is_online: bool,
        is_typing: bool,
    },
}

/// Entry point for one signed-in session: owns the directory and hands
/// out per-conversation controllers wired to the same store, uploader and
/// event bus.
pub struct ChatClient {
    session: SessionContext,
    store: Arc<dyn DurableStore>,
    uploader: Arc<dyn MediaUploader>,
    directory: Arc<Directory>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(session: SessionContext, store: Arc<dyn DurableStore>) -> Arc<Self> {
        Self::new_with_uploader(session, store, Arc::new(MissingMediaUploader))
    }

    pub fn new_with_uploader(
        session: SessionContext,
        store: Arc<dyn DurableStore>,
        uploader: Arc<dyn MediaUploader>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let directory = Directory::new(session.clone(), store.clone(), events.clone());
        Arc::new(Self {
            session,
            store,
            uploader,
            directory,
            events,
        })
    }

    /// Registers the session user with the store and starts the directory
    /// subscriptions.
    pub async fn start(&self) -> Result<()> {
        self.store
            .upsert_user(UserRecord {
                id: self.session.user.id.clone(),
                name: self.session.user.name.clone(),
                avatar_url: self.session.user.avatar_url.clone(),
                is_online: false,
                is_typing: false,
            })
            .await?;
        self.directory.start().await
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Open an existing conversation (direct or group).
    pub async fn open_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<Arc<ConversationController>> {
        ConversationController::open(
            self.session.clone(),
            self.store.clone(),
            self.uploader.clone(),
            self.directory.clone(),
            self.events.clone(),
            Some(conversation.clone()),
            conversation
                .not_me_users(self.session.user_id())
                .cloned()
                .collect(),
        )
        .await
    }

    /// Open a direct exchange with `counterpart` before any conversation
    /// document exists; the conversation is created lazily on the first
    /// send, unless the counterpart creates it first.
    pub async fn open_direct(&self, counterpart: User) -> Result<Arc<ConversationController>> {
        ConversationController::open(
            self.session.clone(),
            self.store.clone(),
            self.uploader.clone(),
            self.directory.clone(),
            self.events.clone(),
            None,
            vec![counterpart],
        )
        .await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
