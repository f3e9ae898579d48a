use std::sync::Arc;

use tracing::warn;

use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationRecord, MessageRecord, NewConversation, PresenceUpdate, UserRecord},
};
use storage::DurableStore;

/// Shared context handed to every operation.
#[derive(Clone)]
pub struct ApiContext {
    pub store: Arc<dyn DurableStore>,
}

fn internal(error: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, error.to_string())
}

/// Membership guard: the conversation must exist and contain `user_id`.
/// Non-members get the same answer as a missing conversation, so the
/// endpoint does not leak which conversations exist.
async fn ensure_membership(
    ctx: &ApiContext,
    conversation_id: &ConversationId,
    user_id: &UserId,
) -> Result<ConversationRecord, ApiError> {
    let conversations = ctx
        .store
        .conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    conversations
        .into_iter()
        .find(|record| &record.id == conversation_id)
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::NotFound,
                "conversation not found or user is not a member",
            )
        })
}

pub async fn register_user(ctx: &ApiContext, user: UserRecord) -> Result<UserRecord, ApiError> {
    if user.name.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "name cannot be empty"));
    }
    ctx.store
        .upsert_user(user.clone())
        .await
        .map_err(internal)?;
    Ok(user)
}

pub async fn list_users(ctx: &ApiContext) -> Result<Vec<UserRecord>, ApiError> {
    ctx.store.get_users().await.map_err(internal)
}

pub async fn publish_presence(
    ctx: &ApiContext,
    user_id: &UserId,
    update: PresenceUpdate,
) -> Result<(), ApiError> {
    if update.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "presence update carries no fields",
        ));
    }
    ctx.store
        .update_presence(user_id, update)
        .await
        .map_err(|error| ApiError::new(ErrorCode::NotFound, error.to_string()))
}

pub async fn create_conversation(
    ctx: &ApiContext,
    creator: &UserId,
    conversation: NewConversation,
) -> Result<ConversationId, ApiError> {
    if conversation.users.len() < 2 {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a conversation needs at least two members",
        ));
    }
    if !conversation.users.contains(creator) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "creator must be a member of the conversation",
        ));
    }
    if conversation.is_group
        && conversation
            .title
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
    {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "group conversations require a title",
        ));
    }

    ctx.store
        .create_conversation(conversation)
        .await
        .map_err(internal)
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: &UserId,
) -> Result<Vec<ConversationRecord>, ApiError> {
    ctx.store
        .conversations_for_user(user_id)
        .await
        .map_err(internal)
}

/// Write a message under its client-chosen id, then update the
/// denormalized latest-message cache and bump the other members' unread
/// counters. The follow-up writes are best-effort: the message stands
/// even if they fail.
pub async fn post_message(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
    message: MessageRecord,
) -> Result<(), ApiError> {
    if &message.user_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "message sender must match the authenticated user",
        ));
    }
    ensure_membership(ctx, conversation_id, user_id).await?;

    ctx.store
        .put_message(conversation_id, message.clone())
        .await
        .map_err(internal)?;

    if let Err(error) = ctx.store.set_latest_message(conversation_id, message).await {
        warn!(%conversation_id, %error, "failed to update latest message");
    }
    if let Err(error) = ctx.store.bump_unread_counts(conversation_id, user_id).await {
        warn!(%conversation_id, %error, "failed to bump unread counters");
    }
    Ok(())
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
) -> Result<Vec<MessageRecord>, ApiError> {
    ensure_membership(ctx, conversation_id, user_id).await?;
    ctx.store
        .messages_for_conversation(conversation_id)
        .await
        .map_err(internal)
}

pub async fn mark_read(
    ctx: &ApiContext,
    user_id: &UserId,
    conversation_id: &ConversationId,
) -> Result<(), ApiError> {
    ensure_membership(ctx, conversation_id, user_id).await?;
    ctx.store
        .reset_unread_count(conversation_id, user_id)
        .await
        .map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shared::domain::MessageId;
    use storage::MemoryStore;

    fn context() -> ApiContext {
        ApiContext {
            store: Arc::new(MemoryStore::new()),
        }
    }

    fn user(id: &str, name: &str) -> UserRecord {
        UserRecord {
            id: UserId::from(id),
            name: name.to_string(),
            avatar_url: None,
            is_online: false,
            is_typing: false,
        }
    }

    fn message(id: &str, sender: &str) -> MessageRecord {
        MessageRecord {
            id: MessageId::from(id),
            user_id: UserId::from(sender),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            text: "hello".to_string(),
            attachments: Vec::new(),
            recording: None,
            reply_message: None,
        }
    }

    #[tokio::test]
    async fn rejects_blank_user_names() {
        let ctx = context();
        let result = register_user(&ctx, user("a", "   ")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn group_conversations_require_a_title() {
        let ctx = context();
        let group = NewConversation {
            users: vec![UserId::from("a"), UserId::from("b"), UserId::from("c")],
            is_group: true,
            title: None,
            picture_url: None,
            users_unread_count_info: Default::default(),
        };
        let result = create_conversation(&ctx, &UserId::from("a"), group).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn creator_must_be_a_member() {
        let ctx = context();
        let conversation =
            NewConversation::direct(vec![UserId::from("a"), UserId::from("b")], "b");
        let result = create_conversation(&ctx, &UserId::from("intruder"), conversation).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn post_message_requires_membership_and_updates_counters() {
        let ctx = context();
        register_user(&ctx, user("a", "alice")).await.expect("user");
        register_user(&ctx, user("b", "bob")).await.expect("user");
        let conversation_id = create_conversation(
            &ctx,
            &UserId::from("a"),
            NewConversation::direct(vec![UserId::from("a"), UserId::from("b")], "bob"),
        )
        .await
        .expect("conversation");

        let outsider = post_message(
            &ctx,
            &UserId::from("mallory"),
            &conversation_id,
            message("m1", "mallory"),
        )
        .await;
        assert!(outsider.is_err());

        post_message(&ctx, &UserId::from("a"), &conversation_id, message("m2", "a"))
            .await
            .expect("post");

        let conversations = list_conversations(&ctx, &UserId::from("b"))
            .await
            .expect("conversations");
        assert_eq!(
            conversations[0].users_unread_count_info[&UserId::from("b")],
            1
        );
        assert_eq!(
            conversations[0]
                .latest_message
                .as_ref()
                .map(|m| m.text.as_str()),
            Some("hello")
        );

        mark_read(&ctx, &UserId::from("b"), &conversation_id)
            .await
            .expect("mark read");
        let conversations = list_conversations(&ctx, &UserId::from("b"))
            .await
            .expect("conversations");
        assert_eq!(
            conversations[0].users_unread_count_info[&UserId::from("b")],
            0
        );
    }

    #[tokio::test]
    async fn sender_spoofing_is_rejected() {
        let ctx = context();
        register_user(&ctx, user("a", "alice")).await.expect("user");
        register_user(&ctx, user("b", "bob")).await.expect("user");
        let conversation_id = create_conversation(
            &ctx,
            &UserId::from("a"),
            NewConversation::direct(vec![UserId::from("a"), UserId::from("b")], "bob"),
        )
        .await
        .expect("conversation");

        let spoofed = post_message(
            &ctx,
            &UserId::from("a"),
            &conversation_id,
            message("m1", "b"),
        )
        .await;
        assert!(spoofed.is_err());
    }

    #[tokio::test]
    async fn empty_presence_updates_are_rejected() {
        let ctx = context();
        register_user(&ctx, user("a", "alice")).await.expect("user");
        let result = publish_presence(&ctx, &UserId::from("a"), PresenceUpdate::default()).await;
        assert!(result.is_err());
    }
}
