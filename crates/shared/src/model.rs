use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::{AttachmentKind, ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Url>,
    /// Derived per session, never persisted.
    #[serde(default)]
    pub is_current_user: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub users: Vec<User>,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<Url>,
    #[serde(default)]
    pub users_unread_count_info: HashMap<UserId, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<LatestMessage>,
}

impl Conversation {
    /// Group title when present, otherwise the counterpart names.
    pub fn display_title(&self, current_user: &UserId) -> String {
        if let Some(title) = &self.title {
            if self.is_group || !title.is_empty() {
                return title.clone();
            }
        }
        let names: Vec<&str> = self
            .not_me_users(current_user)
            .map(|user| user.name.as_str())
            .collect();
        names.join(", ")
    }

    pub fn not_me_users<'a>(
        &'a self,
        current_user: &'a UserId,
    ) -> impl Iterator<Item = &'a User> + 'a {
        self.users.iter().filter(move |user| &user.id != current_user)
    }

    pub fn unread_count_for(&self, user_id: &UserId) -> u32 {
        self.users_unread_count_info
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Denormalized newest-message cache used for conversation list rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMessage {
    pub sender_id: UserId,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// "Photo" / "Video" / "Voice recording" when the message has no text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtext: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub user: User,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<Recording>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message: Option<ReplyMessage>,
}

/// `Sent` and `Error` are terminal; a failed send keeps its draft so the
/// user can resubmit it as a fresh attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Error { draft: Box<DraftMessage> },
}

impl MessageStatus {
    pub fn is_sent(&self) -> bool {
        matches!(self, MessageStatus::Sent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub thumbnail: Url,
    pub full: Url,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub duration: f64,
    #[serde(default)]
    pub waveform_samples: Vec<f32>,
    /// `None` until the upload resolves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

/// Shallow snapshot of a prior message, not a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub id: MessageId,
    pub user: User,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<Recording>,
}

/// A locally authored, not-yet-persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMessage {
    pub text: String,
    #[serde(default)]
    pub medias: Vec<Media>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<Recording>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message: Option<ReplyMessage>,
    pub created_at: DateTime<Utc>,
}

impl DraftMessage {
    pub fn text(text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            medias: Vec::new(),
            recording: None,
            reply_message: None,
            created_at,
        }
    }
}

/// Opaque handle to local media pending upload; the uploader resolves it
/// into durable URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub filename: String,
    pub kind: AttachmentKind,
}
