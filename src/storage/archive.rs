//! Relational archive contract and the in-memory reference implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

use crate::message::{Message, MessageRole};

/// A session row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: i64,
}

/// A message row, flattened to the archive's storage shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Nanoseconds since the epoch; part of the dedup key.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<i64>,
}

impl From<&Message> for ArchivedMessage {
    fn from(message: &Message) -> Self {
        Self {
            session_id: message.session_id.clone(),
            role: message.role,
            content: message.content(),
            timestamp: message.timestamp_nanos(),
            tokens: None,
        }
    }
}

/// Errors from archive operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ArchiveError {
    #[error("archive backend error: {message}")]
    #[diagnostic(
        code(taskweft::archive::backend),
        help("Check database connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    #[error("archive serialization error: {0}")]
    #[diagnostic(code(taskweft::archive::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Long-term relational store of sessions and messages.
///
/// Shared across sessions, partitioned by `session_id`. Appends are
/// idempotent on (session, content, timestamp), the same key the SQLite
/// unique index enforces, so coordinator retries after a priority-1
/// pushback never create doubles. Every batch append advances
/// `last_activity_at` and `message_count`.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Create the session row if it does not exist yet.
    async fn ensure_session(&self, session_id: &str, title: Option<&str>)
    -> Result<SessionRecord>;

    /// Idempotent batch append; returns how many rows were newly inserted.
    async fn append_messages(&self, batch: &[ArchivedMessage]) -> Result<usize>;

    /// All messages of a session in timestamp order.
    async fn messages(&self, session_id: &str) -> Result<Vec<ArchivedMessage>>;

    async fn sessions(&self) -> Result<Vec<SessionRecord>>;

    async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Returns false when the session does not exist.
    async fn rename_session(&self, session_id: &str, title: &str) -> Result<bool>;

    /// Deletes the session and its messages; false when absent.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;
}

#[derive(Default)]
struct ArchiveShard {
    session: Option<SessionRecord>,
    messages: Vec<ArchivedMessage>,
    /// Dedup index mirroring the SQLite unique key: (content, timestamp)
    /// within the session shard. Role is deliberately not part of it.
    seen: FxHashSet<(String, i64)>,
}

/// Reference archive used by tests and DB-less deployments.
#[derive(Default)]
pub struct InMemoryArchive {
    inner: RwLock<FxHashMap<String, ArchiveShard>>,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn backend_err<E: std::fmt::Display>(e: E) -> ArchiveError {
        ArchiveError::Backend {
            message: format!("lock poisoned: {e}"),
        }
    }
}

#[async_trait]
impl ArchiveStore for InMemoryArchive {
    async fn ensure_session(
        &self,
        session_id: &str,
        title: Option<&str>,
    ) -> Result<SessionRecord> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        let shard = map.entry(session_id.to_string()).or_default();
        let record = match &shard.session {
            Some(existing) => existing.clone(),
            None => {
                let now = Utc::now();
                let record = SessionRecord {
                    session_id: session_id.to_string(),
                    title: title.unwrap_or("Untitled session").to_string(),
                    created_at: now,
                    last_activity_at: now,
                    message_count: 0,
                };
                shard.session = Some(record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn append_messages(&self, batch: &[ArchivedMessage]) -> Result<usize> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        let mut inserted = 0usize;
        for message in batch {
            let shard = map.entry(message.session_id.clone()).or_default();
            let key = (message.content.clone(), message.timestamp);
            if shard.seen.insert(key) {
                shard.messages.push(message.clone());
                inserted += 1;
            }
            let count = shard.messages.len() as i64;
            if let Some(session) = shard.session.as_mut() {
                session.message_count = count;
                session.last_activity_at = Utc::now();
            } else {
                let now = Utc::now();
                shard.session = Some(SessionRecord {
                    session_id: message.session_id.clone(),
                    title: "Untitled session".to_string(),
                    created_at: now,
                    last_activity_at: now,
                    message_count: count,
                });
            }
        }
        Ok(inserted)
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ArchivedMessage>> {
        let map = self.inner.read().map_err(Self::backend_err)?;
        let mut messages = map
            .get(session_id)
            .map(|shard| shard.messages.clone())
            .unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    async fn sessions(&self) -> Result<Vec<SessionRecord>> {
        let map = self.inner.read().map_err(Self::backend_err)?;
        let mut sessions: Vec<SessionRecord> = map
            .values()
            .filter_map(|shard| shard.session.clone())
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    async fn session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let map = self.inner.read().map_err(Self::backend_err)?;
        Ok(map.get(session_id).and_then(|shard| shard.session.clone()))
    }

    async fn rename_session(&self, session_id: &str, title: &str) -> Result<bool> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        match map.get_mut(session_id).and_then(|s| s.session.as_mut()) {
            Some(session) => {
                session.title = title.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        Ok(map.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archived(session: &str, content: &str, ts: i64) -> ArchivedMessage {
        ArchivedMessage {
            session_id: session.to_string(),
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: ts,
            tokens: None,
        }
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let archive = InMemoryArchive::new();
        let batch = vec![archived("s1", "hi", 1), archived("s1", "hi", 1)];
        assert_eq!(archive.append_messages(&batch).await.unwrap(), 1);
        assert_eq!(archive.append_messages(&batch).await.unwrap(), 0);
        let session = archive.session("s1").await.unwrap().unwrap();
        assert_eq!(session.message_count, 1);
    }

    #[tokio::test]
    async fn dedup_key_ignores_role() {
        let archive = InMemoryArchive::new();
        // Same content and timestamp under both roles collapses to one row,
        // exactly as the SQLite unique index would have it.
        let user = archived("s1", "identical", 7);
        let model = ArchivedMessage {
            role: MessageRole::Model,
            ..archived("s1", "identical", 7)
        };
        assert_eq!(archive.append_messages(&[user, model]).await.unwrap(), 1);
        let messages = archive.messages("s1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn message_count_matches_distinct_rows() {
        let archive = InMemoryArchive::new();
        archive.ensure_session("s1", Some("titled")).await.unwrap();
        archive
            .append_messages(&[archived("s1", "a", 1), archived("s1", "b", 2)])
            .await
            .unwrap();
        let session = archive.session("s1").await.unwrap().unwrap();
        assert_eq!(session.message_count, 2);
        assert_eq!(session.title, "titled");
    }

    #[tokio::test]
    async fn messages_come_back_in_timestamp_order() {
        let archive = InMemoryArchive::new();
        archive
            .append_messages(&[archived("s1", "later", 5), archived("s1", "earlier", 2)])
            .await
            .unwrap();
        let messages = archive.messages("s1").await.unwrap();
        assert_eq!(messages[0].content, "earlier");
        assert_eq!(messages[1].content, "later");
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let archive = InMemoryArchive::new();
        archive.ensure_session("s1", None).await.unwrap();
        assert!(archive.rename_session("s1", "renamed").await.unwrap());
        assert!(!archive.rename_session("missing", "x").await.unwrap());
        assert!(archive.delete_session("s1").await.unwrap());
        assert!(archive.session("s1").await.unwrap().is_none());
    }
}
