use super::*;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use shared::{
    domain::AttachmentKind,
    model::{DraftMessage, MessageStatus},
};
use storage::MemoryStore;
use tokio::time::timeout;

struct FixedUploader;

#[async_trait]
impl MediaUploader for FixedUploader {
    async fn upload_image(&self, media: &Media) -> Result<Url> {
        Ok(Url::parse(&format!("https://cdn.test/{}.jpg", media.id))?)
    }

    async fn upload_video(&self, media: &Media) -> Result<(Url, Url)> {
        Ok((
            Url::parse(&format!("https://cdn.test/{}-thumb.jpg", media.id))?,
            Url::parse(&format!("https://cdn.test/{}.mp4", media.id))?,
        ))
    }

    async fn upload_recording(&self, _recording: &Recording) -> Result<Url> {
        Ok(Url::parse("https://cdn.test/voice.m4a")?)
    }
}

fn test_user(id: &str, name: &str) -> User {
    User {
        id: UserId::from(id),
        name: name.to_string(),
        avatar_url: None,
        is_current_user: false,
    }
}

fn media(id: &str, kind: shared::domain::AttachmentKind) -> Media {
    Media {
        id: id.to_string(),
        filename: format!("{id}.bin"),
        kind,
    }
}

fn draft(text: &str) -> DraftMessage {
    DraftMessage::text(text, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
}

#[tokio::test]
async fn start_registers_the_session_user_with_the_store() {
    let store = Arc::new(MemoryStore::new());
    let client = ChatClient::new(
        SessionContext::new(test_user("alice", "Alice"), "device-1"),
        store.clone(),
    );
    client.start().await.expect("start");

    let users = store.get_users().await.expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "Alice");
}

#[tokio::test]
async fn media_sends_fail_cleanly_without_an_uploader() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_user(shared::protocol::UserRecord {
            id: UserId::from("bob"),
            name: "Bob".to_string(),
            avatar_url: None,
            is_online: false,
            is_typing: false,
        })
        .await
        .expect("user");
    let client = ChatClient::new(
        SessionContext::new(test_user("alice", "Alice"), "device-1"),
        store,
    );
    client.start().await.expect("start");

    let controller = client
        .open_direct(test_user("bob", "Bob"))
        .await
        .expect("open");
    let mut doomed = draft("photo");
    doomed.medias.push(media("m-1", AttachmentKind::Image));

    let result = controller.send(doomed).await;
    assert!(matches!(result, Err(SendError::Upload(_))));
    assert!(matches!(
        controller.messages()[0].status,
        MessageStatus::Error { .. }
    ));
}

#[tokio::test]
async fn image_uploads_use_one_url_for_thumbnail_and_full() {
    let mut with_image = draft("pic");
    with_image.medias.push(media("img", AttachmentKind::Image));

    let (attachments, _) = upload::resolve_attachments(&with_image, &FixedUploader)
        .await
        .expect("resolve");
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].thumbnail, attachments[0].full);
}

#[tokio::test]
async fn video_uploads_produce_separate_thumbnail_and_full_urls() {
    let mut with_video = draft("clip");
    with_video.medias.push(media("vid", AttachmentKind::Video));

    let (attachments, _) = upload::resolve_attachments(&with_video, &FixedUploader)
        .await
        .expect("resolve");
    assert_eq!(attachments.len(), 1);
    assert_ne!(attachments[0].thumbnail, attachments[0].full);
}

#[tokio::test]
async fn recording_resolution_fills_in_the_durable_url() {
    let mut with_voice = draft("");
    with_voice.recording = Some(Recording {
        duration: 2.0,
        waveform_samples: vec![0.2, 0.8],
        url: None,
    });

    let (_, recording) = upload::resolve_attachments(&with_voice, &FixedUploader)
        .await
        .expect("resolve");
    let recording = recording.expect("recording");
    assert_eq!(
        recording.url.as_ref().map(Url::as_str),
        Some("https://cdn.test/voice.m4a")
    );
    assert_eq!(recording.duration, 2.0);
}

#[tokio::test]
async fn client_event_bus_carries_conversation_updates() {
    let store = Arc::new(MemoryStore::new());
    let client = ChatClient::new(
        SessionContext::new(test_user("alice", "Alice"), "device-1"),
        store.clone(),
    );
    client.start().await.expect("start");
    let mut events = client.subscribe_events();

    store
        .create_conversation(shared::protocol::NewConversation::direct(
            vec![UserId::from("alice"), UserId::from("bob")],
            "Bob",
        ))
        .await
        .expect("conversation");

    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await.expect("event bus closed") {
                ClientEvent::ConversationsUpdated(conversations)
                    if !conversations.is_empty() =>
                {
                    return;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("no conversation update event");
}
