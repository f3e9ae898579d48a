use super::*;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use shared::{
    domain::{AttachmentKind, MessageId},
    protocol::{AttachmentRecord, NewConversation, RecordingRecord},
};
use storage::MemoryStore;
use tokio::time::timeout;
use url::Url;

fn user(id: &str, name: &str) -> User {
    User {
        id: UserId::from(id),
        name: name.to_string(),
        avatar_url: None,
        is_current_user: false,
    }
}

fn user_record(id: &str, name: &str) -> UserRecord {
    UserRecord {
        id: UserId::from(id),
        name: name.to_string(),
        avatar_url: None,
        is_online: false,
        is_typing: false,
    }
}

fn message_record(id: &str, sender: &str, text: &str, offset_secs: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId::from(id),
        user_id: UserId::from(sender),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs),
        text: text.to_string(),
        attachments: Vec::new(),
        recording: None,
        reply_message: None,
    }
}

fn conversation_with_latest(title: &str, latest: Option<LatestMessage>) -> Conversation {
    Conversation {
        id: shared::domain::ConversationId::from(title),
        users: Vec::new(),
        is_group: false,
        title: Some(title.to_string()),
        picture_url: None,
        users_unread_count_info: Default::default(),
        latest_message: latest,
    }
}

fn latest_at(offset_secs: i64) -> LatestMessage {
    LatestMessage {
        sender_id: UserId::from("bob"),
        sender_name: "Bob".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(offset_secs),
        text: Some("hello".to_string()),
        subtext: None,
    }
}

async fn started_directory(store: Arc<MemoryStore>, current: User) -> Arc<Directory> {
    let (events, _) = broadcast::channel(64);
    let session = SessionContext::new(
        User {
            is_current_user: true,
            ..current
        },
        "device-test",
    );
    let directory = Directory::new(session, store, events);
    directory.start().await.expect("start");
    directory
}

#[test]
fn conversations_sort_newest_first_then_titleless_by_title() {
    let me = UserId::from("alice");
    let mut conversations = vec![
        conversation_with_latest("zeta", None),
        conversation_with_latest("old", Some(latest_at(0))),
        conversation_with_latest("alpha", None),
        conversation_with_latest("new", Some(latest_at(60))),
    ];

    sort_conversations(&mut conversations, &me);

    let titles: Vec<_> = conversations
        .iter()
        .map(|c| c.title.clone().unwrap_or_default())
        .collect();
    assert_eq!(titles, vec!["new", "old", "alpha", "zeta"]);
}

#[test]
fn hydration_drops_unknown_members_and_unknown_latest_senders() {
    let all_users = vec![user("alice", "Alice"), user("bob", "Bob")];
    let record = ConversationRecord {
        id: shared::domain::ConversationId::from("c1"),
        users: vec![UserId::from("alice"), UserId::from("bob"), UserId::from("ghost")],
        is_group: false,
        title: Some("Bob".to_string()),
        picture_url: None,
        users_unread_count_info: Default::default(),
        latest_message: Some(message_record("m1", "ghost", "boo", 0)),
    };

    let conversation = hydrate_conversation(&record, &all_users);
    assert_eq!(conversation.users.len(), 2);
    assert!(conversation.latest_message.is_none());
}

#[test]
fn latest_message_line_derives_attachment_and_recording_subtexts() {
    let all_users = vec![user("bob", "Bob")];

    let mut with_photo = message_record("m1", "bob", "", 0);
    with_photo.attachments.push(AttachmentRecord {
        thumb_url: Url::parse("https://cdn.test/t.jpg").expect("url"),
        url: Url::parse("https://cdn.test/f.jpg").expect("url"),
        kind: AttachmentKind::Image,
    });
    let line = latest_message_line(&with_photo, &all_users).expect("line");
    assert_eq!(line.subtext.as_deref(), Some("Photo"));
    assert_eq!(line.text, None);

    let mut with_voice = message_record("m2", "bob", "", 0);
    with_voice.recording = Some(RecordingRecord {
        duration: 1.5,
        waveform_samples: vec![0.5],
        url: None,
    });
    let line = latest_message_line(&with_voice, &all_users).expect("line");
    assert_eq!(line.subtext.as_deref(), Some("Voice recording"));
}

#[tokio::test]
async fn directory_excludes_the_current_user_from_the_user_list() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_user(user_record("alice", "Alice"))
        .await
        .expect("user");
    store
        .upsert_user(user_record("bob", "Bob"))
        .await
        .expect("user");

    let directory = started_directory(store, user("alice", "Alice")).await;

    let users = directory.users().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "Bob");

    let all_users = directory.all_users().await;
    assert_eq!(all_users.len(), 2);
    assert!(all_users
        .iter()
        .any(|user| user.is_current_user && user.name == "Alice"));

    directory.close().await;
}

#[tokio::test]
async fn directory_reflects_store_changes_in_its_conversation_snapshots() {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_user(user_record("alice", "Alice"))
        .await
        .expect("user");
    store
        .upsert_user(user_record("bob", "Bob"))
        .await
        .expect("user");

    let directory = started_directory(store.clone(), user("alice", "Alice")).await;
    assert!(directory.conversations().is_empty());

    let conversation_id = store
        .create_conversation(NewConversation::direct(
            vec![UserId::from("alice"), UserId::from("bob")],
            "Bob",
        ))
        .await
        .expect("conversation");

    timeout(Duration::from_secs(2), async {
        loop {
            if directory.conversations().len() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("conversation never reached the directory");

    store
        .set_latest_message(&conversation_id, message_record("m1", "bob", "hey", 0))
        .await
        .expect("latest");

    timeout(Duration::from_secs(2), async {
        loop {
            let conversations = directory.conversations();
            if let Some(latest) = &conversations[0].latest_message {
                assert_eq!(latest.sender_name, "Bob");
                assert_eq!(latest.text.as_deref(), Some("hey"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("latest message never hydrated");

    assert!(directory
        .direct_conversation_with(&UserId::from("bob"))
        .is_some());

    directory.close().await;
}
