use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    domain::{AttachmentKind, ConversationId, MessageId, UserId},
    error::ApiError,
};

/// User document as stored. Presence lives on the user record and is
/// merged field-wise via [`PresenceUpdate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Url>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_typing: bool,
}

/// Partial presence write: only the populated fields change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
}

impl PresenceUpdate {
    pub fn online(is_online: bool) -> Self {
        Self {
            is_online: Some(is_online),
            is_typing: None,
        }
    }

    pub fn typing(is_typing: bool) -> Self {
        Self {
            is_online: None,
            is_typing: Some(is_typing),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_online.is_none() && self.is_typing.is_none()
    }
}

/// Payload for the atomic conversation create. The creator supplies the
/// full member list and an unread map initialized to zero for everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConversation {
    pub users: Vec<UserId>,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<Url>,
    #[serde(default)]
    pub users_unread_count_info: HashMap<UserId, u32>,
}

impl NewConversation {
    pub fn direct(users: Vec<UserId>, title: impl Into<String>) -> Self {
        let users_unread_count_info = users.iter().cloned().map(|id| (id, 0)).collect();
        Self {
            users,
            is_group: false,
            title: Some(title.into()),
            picture_url: None,
            users_unread_count_info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub users: Vec<UserId>,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<Url>,
    #[serde(default)]
    pub users_unread_count_info: HashMap<UserId, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message: Option<MessageRecord>,
}

impl ConversationRecord {
    pub fn contains_user(&self, user_id: &UserId) -> bool {
        self.users.contains(user_id)
    }
}

/// Message document keyed by a client-chosen id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_message: Option<ReplyMessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    #[serde(rename = "thumbURL")]
    pub thumb_url: Url,
    pub url: Url,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub duration: f64,
    #[serde(default)]
    pub waveform_samples: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessageRecord {
    pub id: MessageId,
    pub user_id: UserId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingRecord>,
}

/// Server push envelope. Every variant carries the full current state of
/// its collection, never a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    UsersUpdated {
        users: Vec<UserRecord>,
    },
    ConversationsUpdated {
        conversations: Vec<ConversationRecord>,
    },
    MessagesUpdated {
        conversation_id: ConversationId,
        messages: Vec<MessageRecord>,
    },
    Error(ApiError),
}
