//! SQLite archive behaviour on a real (temporary) database file.

use taskweft::message::MessageRole;
use taskweft::storage::{ArchiveStore, ArchivedMessage, SqliteArchive};
use tempfile::TempDir;

async fn archive_in(dir: &TempDir) -> SqliteArchive {
    let path = dir.path().join("archive.db");
    let url = format!("sqlite://{}", path.display());
    SqliteArchive::connect(&url).await.unwrap()
}

fn row(session: &str, role: MessageRole, content: &str, ts: i64) -> ArchivedMessage {
    ArchivedMessage {
        session_id: session.to_string(),
        role,
        content: content.to_string(),
        timestamp: ts,
        tokens: None,
    }
}

#[tokio::test]
async fn migrations_run_and_sessions_round_trip() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;

    let created = archive.ensure_session("sess_a", Some("My chat")).await.unwrap();
    assert_eq!(created.title, "My chat");
    assert_eq!(created.message_count, 0);

    // ensure_session is idempotent and keeps the original title.
    let again = archive.ensure_session("sess_a", Some("Other")).await.unwrap();
    assert_eq!(again.title, "My chat");

    let listed = archive.sessions().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].session_id, "sess_a");
}

#[tokio::test]
async fn appends_are_idempotent_and_counted() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;

    let batch = vec![
        row("sess_a", MessageRole::User, "hello", 100),
        row("sess_a", MessageRole::Model, "hi!", 200),
    ];
    assert_eq!(archive.append_messages(&batch).await.unwrap(), 2);
    // A coordinator retry re-sends the same batch; nothing doubles.
    assert_eq!(archive.append_messages(&batch).await.unwrap(), 0);

    let session = archive.session("sess_a").await.unwrap().unwrap();
    assert_eq!(session.message_count, 2);

    let messages = archive.messages("sess_a").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].content, "hi!");
}

#[tokio::test]
async fn messages_come_back_in_timestamp_order() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;
    archive
        .append_messages(&[
            row("sess_a", MessageRole::Model, "later", 900),
            row("sess_a", MessageRole::User, "earlier", 100),
        ])
        .await
        .unwrap();
    let messages = archive.messages("sess_a").await.unwrap();
    assert_eq!(messages[0].content, "earlier");
    assert_eq!(messages[1].content, "later");
}

#[tokio::test]
async fn sessions_are_partitioned() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;
    archive
        .append_messages(&[row("sess_a", MessageRole::User, "for a", 1)])
        .await
        .unwrap();
    archive
        .append_messages(&[row("sess_b", MessageRole::User, "for b", 1)])
        .await
        .unwrap();
    assert_eq!(archive.messages("sess_a").await.unwrap().len(), 1);
    assert_eq!(archive.messages("sess_b").await.unwrap().len(), 1);
    assert_eq!(archive.sessions().await.unwrap().len(), 2);
}

#[tokio::test]
async fn rename_and_delete_sessions() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;
    archive.ensure_session("sess_a", None).await.unwrap();
    archive
        .append_messages(&[row("sess_a", MessageRole::User, "content", 1)])
        .await
        .unwrap();

    assert!(archive.rename_session("sess_a", "renamed").await.unwrap());
    assert_eq!(
        archive.session("sess_a").await.unwrap().unwrap().title,
        "renamed"
    );
    assert!(!archive.rename_session("missing", "x").await.unwrap());

    assert!(archive.delete_session("sess_a").await.unwrap());
    assert!(archive.session("sess_a").await.unwrap().is_none());
    assert!(archive.messages("sess_a").await.unwrap().is_empty());
    assert!(!archive.delete_session("sess_a").await.unwrap());
}

#[tokio::test]
async fn dedup_unique_index_ignores_role() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;
    // The unique index covers (session_id, content, timestamp) only; a
    // same-content, same-timestamp pair under both roles is one row.
    archive
        .append_messages(&[
            row("sess_a", MessageRole::User, "identical", 7),
            row("sess_a", MessageRole::Model, "identical", 7),
        ])
        .await
        .unwrap();
    let messages = archive.messages("sess_a").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn identical_content_at_different_timestamps_is_kept() {
    let dir = TempDir::new().unwrap();
    let archive = archive_in(&dir).await;
    archive
        .append_messages(&[
            row("sess_a", MessageRole::User, "same words", 100),
            row("sess_a", MessageRole::User, "same words", 200),
        ])
        .await
        .unwrap();
    assert_eq!(archive.messages("sess_a").await.unwrap().len(), 2);
}
