use super::*;
use chrono::{Duration, TimeZone, Utc};
use shared::{
    domain::{AttachmentKind, MessageId},
    protocol::{AttachmentRecord, RecordingRecord},
};
use url::Url;

fn user(id: &str, name: &str) -> UserRecord {
    UserRecord {
        id: UserId::from(id),
        name: name.to_string(),
        avatar_url: None,
        is_online: false,
        is_typing: false,
    }
}

fn direct_conversation(a: &str, b: &str) -> NewConversation {
    NewConversation::direct(vec![UserId::from(a), UserId::from(b)], b)
}

fn message(id: &str, sender: &str, text: &str, offset_secs: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId::from(id),
        user_id: UserId::from(sender),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(offset_secs),
        text: text.to_string(),
        attachments: Vec::new(),
        recording: None,
        reply_message: None,
    }
}

#[tokio::test]
async fn users_feed_replays_current_set_to_new_subscribers() {
    let store = MemoryStore::new();
    store.upsert_user(user("a", "alice")).await.expect("user");

    let mut feed = store.subscribe_users().await.expect("subscribe");
    let snapshot = feed.next().await.expect("snapshot");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "alice");

    store.upsert_user(user("b", "bob")).await.expect("user");
    let snapshot = feed.next().await.expect("snapshot");
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn put_message_under_same_id_replaces_instead_of_duplicating() {
    let store = MemoryStore::new();
    let conversation = store
        .create_conversation(direct_conversation("a", "b"))
        .await
        .expect("conversation");

    store
        .put_message(&conversation, message("m1", "a", "first", 0))
        .await
        .expect("put");
    store
        .put_message(&conversation, message("m1", "a", "edited", 0))
        .await
        .expect("put again");

    let messages = store
        .messages_for_conversation(&conversation)
        .await
        .expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "edited");
}

#[tokio::test]
async fn message_snapshots_are_ordered_by_created_at() {
    let store = MemoryStore::new();
    let conversation = store
        .create_conversation(direct_conversation("a", "b"))
        .await
        .expect("conversation");

    store
        .put_message(&conversation, message("m2", "a", "later", 10))
        .await
        .expect("put");
    store
        .put_message(&conversation, message("m1", "b", "earlier", 0))
        .await
        .expect("put");

    let mut feed = store
        .subscribe_messages(&conversation)
        .await
        .expect("subscribe");
    let snapshot = feed.next().await.expect("snapshot");
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].id, MessageId::from("m1"));
    assert_eq!(snapshot[1].id, MessageId::from("m2"));
}

#[tokio::test]
async fn conversation_feed_filters_by_membership() {
    let store = MemoryStore::new();
    store
        .create_conversation(direct_conversation("a", "b"))
        .await
        .expect("conversation");
    store
        .create_conversation(direct_conversation("b", "c"))
        .await
        .expect("conversation");

    let for_a = store
        .conversations_for_user(&UserId::from("a"))
        .await
        .expect("conversations");
    assert_eq!(for_a.len(), 1);

    let mut feed = store
        .subscribe_conversations(&UserId::from("b"))
        .await
        .expect("subscribe");
    let snapshot = feed.next().await.expect("snapshot");
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn unread_counters_bump_everyone_but_sender_and_reset_to_zero() {
    let store = MemoryStore::new();
    let conversation = store
        .create_conversation(NewConversation::direct(
            vec![UserId::from("a"), UserId::from("b"), UserId::from("c")],
            "trio",
        ))
        .await
        .expect("conversation");

    store
        .bump_unread_counts(&conversation, &UserId::from("a"))
        .await
        .expect("bump");
    store
        .bump_unread_counts(&conversation, &UserId::from("a"))
        .await
        .expect("bump");

    let records = store
        .conversations_for_user(&UserId::from("a"))
        .await
        .expect("conversations");
    let record = &records[0];
    assert_eq!(record.users_unread_count_info[&UserId::from("a")], 0);
    assert_eq!(record.users_unread_count_info[&UserId::from("b")], 2);
    assert_eq!(record.users_unread_count_info[&UserId::from("c")], 2);

    store
        .reset_unread_count(&conversation, &UserId::from("b"))
        .await
        .expect("reset");
    store
        .reset_unread_count(&conversation, &UserId::from("b"))
        .await
        .expect("reset again");

    let records = store
        .conversations_for_user(&UserId::from("a"))
        .await
        .expect("conversations");
    assert_eq!(records[0].users_unread_count_info[&UserId::from("b")], 0);
    assert_eq!(records[0].users_unread_count_info[&UserId::from("c")], 2);
}

#[tokio::test]
async fn presence_merge_touches_only_provided_fields() {
    let store = MemoryStore::new();
    store.upsert_user(user("a", "alice")).await.expect("user");

    store
        .update_presence(&UserId::from("a"), PresenceUpdate::online(true))
        .await
        .expect("online");
    store
        .update_presence(&UserId::from("a"), PresenceUpdate::typing(true))
        .await
        .expect("typing");

    let users = store.get_users().await.expect("users");
    assert!(users[0].is_online);
    assert!(users[0].is_typing);

    let mut doc = store
        .subscribe_user(&UserId::from("a"))
        .await
        .expect("subscribe");
    let snapshot = doc.next().await.expect("snapshot").expect("record");
    assert!(snapshot.is_online);
    assert!(snapshot.is_typing);
}

#[tokio::test]
async fn update_presence_rejects_unknown_user() {
    let store = MemoryStore::new();
    let result = store
        .update_presence(&UserId::from("ghost"), PresenceUpdate::online(true))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn sqlite_store_roundtrips_message_payloads() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.upsert_user(user("a", "alice")).await.expect("user");
    store.upsert_user(user("b", "bob")).await.expect("user");

    let conversation = store
        .create_conversation(direct_conversation("a", "b"))
        .await
        .expect("conversation");

    let mut record = message("m1", "a", "look at this", 0);
    record.attachments.push(AttachmentRecord {
        thumb_url: Url::parse("https://cdn.example.com/thumb.jpg").expect("url"),
        url: Url::parse("https://cdn.example.com/full.jpg").expect("url"),
        kind: AttachmentKind::Image,
    });
    record.recording = Some(RecordingRecord {
        duration: 2.5,
        waveform_samples: vec![0.1, 0.9, 0.4],
        url: Url::parse("https://cdn.example.com/voice.m4a").ok(),
    });

    store
        .put_message(&conversation, record.clone())
        .await
        .expect("put");
    store
        .set_latest_message(&conversation, record.clone())
        .await
        .expect("latest");

    let messages = store
        .messages_for_conversation(&conversation)
        .await
        .expect("messages");
    assert_eq!(messages, vec![record.clone()]);

    let conversations = store
        .conversations_for_user(&UserId::from("b"))
        .await
        .expect("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].latest_message, Some(record));
}

#[tokio::test]
async fn sqlite_unread_counters_bump_and_reset() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.upsert_user(user("a", "alice")).await.expect("user");
    store.upsert_user(user("b", "bob")).await.expect("user");

    let conversation = store
        .create_conversation(direct_conversation("a", "b"))
        .await
        .expect("conversation");

    store
        .bump_unread_counts(&conversation, &UserId::from("a"))
        .await
        .expect("bump");

    let records = store
        .conversations_for_user(&UserId::from("a"))
        .await
        .expect("conversations");
    assert_eq!(records[0].users_unread_count_info[&UserId::from("b")], 1);
    assert_eq!(records[0].users_unread_count_info[&UserId::from("a")], 0);

    store
        .reset_unread_count(&conversation, &UserId::from("b"))
        .await
        .expect("reset");
    let records = store
        .conversations_for_user(&UserId::from("a"))
        .await
        .expect("conversations");
    assert_eq!(records[0].users_unread_count_info[&UserId::from("b")], 0);
}

#[tokio::test]
async fn sqlite_put_message_requires_existing_conversation() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    let missing = ConversationId::from("missing");
    let result = store.put_message(&missing, message("m1", "a", "hi", 0)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn sqlite_health_check_succeeds_for_live_pool() {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn sqlite_creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = SqliteStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}
