use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use futures::Stream;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::warn;
use uuid::Uuid;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    model::{
        Attachment, Conversation, DraftMessage, Message, MessageStatus, Recording, ReplyMessage,
        User,
    },
    protocol::{
        AttachmentRecord, MessageRecord, NewConversation, RecordingRecord, ReplyMessageRecord,
    },
};
use storage::DurableStore;

use crate::{
    error::SendError, presence::PresenceTracker, upload, ClientEvent, Directory, MediaUploader,
    SessionContext,
};

/// Synchronization engine for one open conversation.
///
/// Owns the authoritative visible message list, merging locally
/// originated optimistic writes with the store's confirmed stream: each
/// confirmed snapshot replaces the confirmed prefix, and local entries
/// whose id now appears in it are dropped, so an id is visible at most
/// once and an optimistic message disappears the instant its confirmed
/// copy arrives.
pub struct ConversationController {
    session: SessionContext,
    store: Arc<dyn DurableStore>,
    uploader: Arc<dyn MediaUploader>,
    directory: Arc<Directory>,
    presence: Arc<PresenceTracker>,
    inner: Mutex<ControllerState>,
    messages_tx: watch::Sender<Vec<Message>>,
    events: broadcast::Sender<ClientEvent>,
    tasks: Mutex<ControllerTasks>,
}

struct ControllerState {
    conversation_id: Option<ConversationId>,
    /// Participants other than the current user.
    counterparts: Vec<User>,
    /// Hydrated confirmed stream, ordered by the store.
    confirmed: Vec<Message>,
    /// Optimistic entries not yet present in the confirmed stream
    /// (`Sending` until the write resolves, `Error` after a failure).
    local: Vec<Message>,
}

#[derive(Default)]
struct ControllerTasks {
    message_listener: Option<JoinHandle<()>>,
    creation_watch: Option<JoinHandle<()>>,
}

impl ConversationController {
    pub(crate) async fn open(
        session: SessionContext,
        store: Arc<dyn DurableStore>,
        uploader: Arc<dyn MediaUploader>,
        directory: Arc<Directory>,
        events: broadcast::Sender<ClientEvent>,
        conversation: Option<Conversation>,
        counterparts: Vec<User>,
    ) -> anyhow::Result<Arc<Self>> {
        let presence = PresenceTracker::new(session.clone(), store.clone(), events.clone());
        let (messages_tx, _) = watch::channel(Vec::new());

        let controller = Arc::new(Self {
            session,
            store,
            uploader,
            directory,
            presence,
            inner: Mutex::new(ControllerState {
                conversation_id: None,
                counterparts: counterparts.clone(),
                confirmed: Vec::new(),
                local: Vec::new(),
            }),
            messages_tx,
            events,
            tasks: Mutex::new(ControllerTasks::default()),
        });

        for user in &counterparts {
            if let Err(error) = controller.presence.track_user(&user.id).await {
                warn!(user_id = %user.id, %error, "presence subscription failed");
            }
        }
        controller.presence.app_became_active().await;

        match conversation {
            Some(conversation) => {
                controller.adopt_conversation(&conversation.id).await?;
                controller.mark_opened().await;
            }
            // No conversation document yet: watch for one created by the
            // counterparty while we wait for the first send.
            None => controller.spawn_creation_watch().await?,
        }

        Ok(controller)
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub async fn conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.conversation_id.clone()
    }

    /// Current visible list: confirmed stream followed by pending local
    /// entries.
    pub fn messages(&self) -> Vec<Message> {
        self.messages_tx.borrow().clone()
    }

    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages_tx.subscribe()
    }

    pub fn messages_stream(&self) -> impl Stream<Item = Vec<Message>> + Send {
        WatchStream::new(self.messages_tx.subscribe())
    }

    /// Forward a draft-text change into the typing tracker.
    pub async fn draft_changed(&self, draft_text: &str) {
        self.presence.draft_changed(draft_text).await;
    }

    /// Submit a draft. The message appears immediately with `Sending`
    /// status under a fresh client-minted id; the confirmed stream later
    /// supplies the `Sent` copy under the same id. On upload or write
    /// failure the entry flips to `Error` and keeps the draft for a
    /// user-initiated retry.
    pub async fn send(self: &Arc<Self>, draft: DraftMessage) -> Result<MessageId, SendError> {
        let conversation_id = match self.conversation_id().await {
            Some(id) => id,
            None => self.create_direct_conversation().await?,
        };

        let id = MessageId::fresh();
        let message = Message {
            id: id.clone(),
            user: User {
                is_current_user: true,
                ..self.session.user.clone()
            },
            status: MessageStatus::Sending,
            created_at: draft.created_at,
            text: draft.text.clone(),
            attachments: Vec::new(),
            recording: draft.recording.clone(),
            reply_message: draft.reply_message.clone(),
        };
        {
            let mut inner = self.inner.lock().await;
            inner.local.push(message);
            self.publish_visible(&inner);
        }

        let (attachments, recording) =
            match upload::resolve_attachments(&draft, self.uploader.as_ref()).await {
                Ok(resolved) => resolved,
                Err(error) => {
                    self.mark_error(&id, draft, &error.to_string()).await;
                    return Err(SendError::Upload(error));
                }
            };

        let record = record_from_draft(
            &id,
            self.session.user_id(),
            &draft,
            &attachments,
            recording.as_ref(),
        );

        if let Err(error) = self.store.put_message(&conversation_id, record.clone()).await {
            self.mark_error(&id, draft, &error.to_string()).await;
            return Err(SendError::Submission(error));
        }
        // No explicit flip to `Sent` here: the message subscription will
        // deliver the confirmed copy under the same id and supersede the
        // optimistic entry.

        if let Err(error) = self
            .store
            .set_latest_message(&conversation_id, record)
            .await
        {
            warn!(%conversation_id, %error, "failed to update latest message");
        }
        if let Err(error) = self
            .store
            .bump_unread_counts(&conversation_id, self.session.user_id())
            .await
        {
            warn!(%conversation_id, %error, "failed to bump unread counters");
        }

        Ok(id)
    }

    /// Resubmit a failed message. The errored entry is removed and its
    /// preserved draft goes through `send` again as a new attempt with a
    /// fresh id.
    pub async fn retry(self: &Arc<Self>, message_id: &MessageId) -> Result<MessageId, SendError> {
        let draft = {
            let mut inner = self.inner.lock().await;
            let index = inner
                .local
                .iter()
                .position(|message| {
                    &message.id == message_id
                        && matches!(message.status, MessageStatus::Error { .. })
                })
                .ok_or_else(|| SendError::NotRetryable(message_id.clone()))?;
            let removed = inner.local.remove(index);
            let MessageStatus::Error { draft } = removed.status else {
                return Err(SendError::NotRetryable(message_id.clone()));
            };
            self.publish_visible(&inner);
            *draft
        };
        self.send(draft).await
    }

    /// Reset the current user's unread counter; called on entry when the
    /// conversation already exists, and again on close.
    pub async fn mark_opened(&self) {
        let Some(conversation_id) = self.conversation_id().await else {
            return;
        };
        if let Err(error) = self
            .store
            .reset_unread_count(&conversation_id, self.session.user_id())
            .await
        {
            warn!(%conversation_id, %error, "failed to reset unread counter");
        }
    }

    /// Tear down listeners and reset the unread counter. Subscriptions do
    /// not expire on their own; leaving a controller un-closed leaks them.
    pub async fn close(&self) {
        self.mark_opened().await;
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.message_listener.take() {
            task.abort();
        }
        if let Some(task) = tasks.creation_watch.take() {
            task.abort();
        }
        drop(tasks);
        self.presence.close().await;
    }

    /// Bind this controller to a conversation document and start the
    /// confirmed-stream listener. Idempotent: once bound, later adoption
    /// attempts (e.g. from the creation watch losing a race it already
    /// resolved) are no-ops.
    async fn adopt_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.conversation_id.is_some() {
                return Ok(());
            }
            inner.conversation_id = Some(conversation_id.clone());
        }

        let mut feed = self.store.subscribe_messages(conversation_id).await?;
        let controller = Arc::clone(self);
        let listener = tokio::spawn(async move {
            while let Some(records) = feed.next().await {
                controller.apply_confirmed(records).await;
            }
        });
        self.tasks.lock().await.message_listener = Some(listener);
        Ok(())
    }

    /// Convergence mechanism for the creation race: until a document id
    /// is adopted, watch the membership feed for a direct conversation
    /// containing the counterpart — created by either side — and bind to
    /// the first one observed.
    async fn spawn_creation_watch(self: &Arc<Self>) -> anyhow::Result<()> {
        let counterpart_id = {
            let inner = self.inner.lock().await;
            match inner.counterparts.as_slice() {
                [user] => user.id.clone(),
                _ => return Ok(()), // group conversations are created out-of-band
            }
        };

        let mut feed = self
            .store
            .subscribe_conversations(self.session.user_id())
            .await?;
        let controller = Arc::clone(self);
        let watch_task = tokio::spawn(async move {
            while let Some(records) = feed.next().await {
                let existing = records
                    .iter()
                    .find(|record| !record.is_group && record.contains_user(&counterpart_id));
                if let Some(record) = existing {
                    if let Err(error) = controller.adopt_conversation(&record.id).await {
                        warn!(conversation_id = %record.id, %error, "failed to adopt peer-created conversation");
                    }
                    break;
                }
            }
        });
        self.tasks.lock().await.creation_watch = Some(watch_task);
        Ok(())
    }

    /// First-send path for a direct exchange with no conversation
    /// document yet. If the peer's creation already reached our feed we
    /// adopt it; otherwise we issue one atomic create carrying the full
    /// member list and a zeroed unread map. A true tie can still leave
    /// two documents behind — there is no after-the-fact deduplication.
    async fn create_direct_conversation(self: &Arc<Self>) -> Result<ConversationId, SendError> {
        let counterpart = {
            let inner = self.inner.lock().await;
            match inner.counterparts.as_slice() {
                [user] => user.clone(),
                _ => {
                    return Err(SendError::Creation(anyhow!(
                        "group conversations are created out-of-band"
                    )))
                }
            }
        };

        if let Some(existing) = self.directory.direct_conversation_with(&counterpart.id) {
            self.adopt_conversation(&existing.id)
                .await
                .map_err(SendError::Creation)?;
            return Ok(existing.id);
        }

        let mut users: Vec<UserId> = vec![self.session.user_id().clone()];
        users.push(counterpart.id.clone());
        let conversation_id = self
            .store
            .create_conversation(NewConversation::direct(users, counterpart.name.clone()))
            .await
            .map_err(SendError::Creation)?;

        self.adopt_conversation(&conversation_id)
            .await
            .map_err(SendError::Creation)?;
        Ok(conversation_id)
    }

    async fn apply_confirmed(&self, records: Vec<MessageRecord>) {
        let all_users = self.directory.all_users().await;
        let mut inner = self.inner.lock().await;
        // Records from senders the directory has not resolved yet are
        // withheld until a later users snapshot supplies them.
        let confirmed: Vec<Message> = records
            .iter()
            .filter_map(|record| hydrate_message(record, &all_users))
            .collect();
        let confirmed_ids: HashSet<&MessageId> =
            confirmed.iter().map(|message| &message.id).collect();
        inner
            .local
            .retain(|message| !confirmed_ids.contains(&message.id));
        inner.confirmed = confirmed;
        self.publish_visible(&inner);
    }

    fn publish_visible(&self, inner: &ControllerState) {
        let mut local = inner.local.clone();
        local.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut visible = inner.confirmed.clone();
        visible.extend(local);

        self.messages_tx.send_replace(visible.clone());
        if let Some(conversation_id) = &inner.conversation_id {
            let _ = self.events.send(ClientEvent::MessagesUpdated {
                conversation_id: conversation_id.clone(),
                messages: visible,
            });
        }
    }

    async fn mark_error(&self, message_id: &MessageId, draft: DraftMessage, reason: &str) {
        let conversation_id = {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner
                .local
                .iter_mut()
                .rev()
                .find(|message| &message.id == message_id)
            {
                entry.status = MessageStatus::Error {
                    draft: Box::new(draft),
                };
            }
            self.publish_visible(&inner);
            inner.conversation_id.clone()
        };

        warn!(message_id = %message_id, reason, "message send failed");
        let _ = self.events.send(ClientEvent::MessageSendFailed {
            conversation_id,
            message_id: message_id.clone(),
            reason: reason.to_string(),
        });
    }
}

/// Resolve a confirmed record against the known-user set. Everything the
/// store reports is `Sent` by definition. Ordering stays keyed on the
/// caller-supplied `createdAt`; with no server-authoritative clock this
/// is vulnerable to client clock skew, which is a known limitation of the
/// protocol rather than something this engine papers over.
fn hydrate_message(record: &MessageRecord, all_users: &[User]) -> Option<Message> {
    let user = all_users.iter().find(|user| user.id == record.user_id)?;

    let reply_message = record.reply_message.as_ref().and_then(|reply| {
        let reply_user = all_users.iter().find(|user| user.id == reply.user_id)?;
        Some(ReplyMessage {
            id: reply.id.clone(),
            user: reply_user.clone(),
            text: reply.text.clone(),
            attachments: reply.attachments.iter().map(hydrate_attachment).collect(),
            recording: reply.recording.as_ref().map(hydrate_recording),
        })
    });

    Some(Message {
        id: record.id.clone(),
        user: user.clone(),
        status: MessageStatus::Sent,
        created_at: record.created_at,
        text: record.text.clone(),
        attachments: record.attachments.iter().map(hydrate_attachment).collect(),
        recording: record.recording.as_ref().map(hydrate_recording),
        reply_message,
    })
}

fn hydrate_attachment(record: &AttachmentRecord) -> Attachment {
    Attachment {
        id: Uuid::new_v4().to_string(),
        thumbnail: record.thumb_url.clone(),
        full: record.url.clone(),
        kind: record.kind,
    }
}

fn hydrate_recording(record: &RecordingRecord) -> Recording {
    Recording {
        duration: record.duration,
        waveform_samples: record.waveform_samples.clone(),
        url: record.url.clone(),
    }
}

fn record_from_draft(
    id: &MessageId,
    user_id: &UserId,
    draft: &DraftMessage,
    attachments: &[Attachment],
    recording: Option<&Recording>,
) -> MessageRecord {
    MessageRecord {
        id: id.clone(),
        user_id: user_id.clone(),
        created_at: draft.created_at,
        text: draft.text.clone(),
        attachments: attachments.iter().map(attachment_record).collect(),
        recording: recording.map(recording_record),
        reply_message: draft.reply_message.as_ref().map(|reply| ReplyMessageRecord {
            id: reply.id.clone(),
            user_id: reply.user.id.clone(),
            text: reply.text.clone(),
            attachments: reply.attachments.iter().map(attachment_record).collect(),
            recording: reply.recording.as_ref().map(recording_record),
        }),
    }
}

fn attachment_record(attachment: &Attachment) -> AttachmentRecord {
    AttachmentRecord {
        thumb_url: attachment.thumbnail.clone(),
        url: attachment.full.clone(),
        kind: attachment.kind,
    }
}

fn recording_record(recording: &Recording) -> RecordingRecord {
    RecordingRecord {
        duration: recording.duration,
        waveform_samples: recording.waveform_samples.clone(),
        url: recording.url.clone(),
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
