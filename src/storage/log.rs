//! Durable per-session log: the critical (priority 1) storage tier.
//!
//! Models the host-provided local store: an append-only message log with
//! deduplication and bounded replay, plus arbitrary key/value state used
//! for the task-board snapshot. The in-memory implementation is the
//! default for tests and single-process deployments; a host-backed
//! implementation substitutes behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

use crate::message::MessageRole;

/// Records retained per session before the oldest are dropped on append.
const MAX_RETAINED_RECORDS: usize = 512;

/// One appended message record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    fn dedup_key(&self) -> (MessageRole, String, i64) {
        (
            self.role,
            self.content.clone(),
            self.timestamp
                .timestamp_nanos_opt()
                .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000)),
        )
    }
}

/// Errors from durable-log operations.
#[derive(Debug, Error, Diagnostic)]
pub enum LogError {
    #[error("durable log backend error: {message}")]
    #[diagnostic(code(taskweft::log::backend))]
    Backend { message: String },

    #[error("durable log serialization error: {0}")]
    #[diagnostic(code(taskweft::log::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Append-only per-session message log with KV state.
///
/// Implementations must be idempotent on append: a record whose
/// (role, content, timestamp) was already written is silently skipped, so
/// coordinator retries never duplicate.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append records; returns how many were newly written.
    async fn append(&self, session_id: &str, records: &[LogRecord]) -> Result<usize>;

    /// The most recent `limit` records in insertion order.
    async fn replay(&self, session_id: &str, limit: usize) -> Result<Vec<LogRecord>>;

    /// Store a state value under `key` for this session.
    async fn put_state(&self, session_id: &str, key: &str, value: serde_json::Value) -> Result<()>;

    async fn get_state(&self, session_id: &str, key: &str) -> Result<Option<serde_json::Value>>;

    async fn delete_state(&self, session_id: &str, key: &str) -> Result<()>;

    /// Drop everything the session owns: records, dedup index, state.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

#[derive(Default)]
struct SessionLog {
    records: Vec<LogRecord>,
    seen: FxHashSet<(MessageRole, String, i64)>,
    state: FxHashMap<String, serde_json::Value>,
}

/// Process-local durable log.
#[derive(Default)]
pub struct InMemoryDurableLog {
    inner: RwLock<FxHashMap<String, SessionLog>>,
}

impl InMemoryDurableLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn backend_err<E: std::fmt::Display>(e: E) -> LogError {
        LogError::Backend {
            message: format!("lock poisoned: {e}"),
        }
    }
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn append(&self, session_id: &str, records: &[LogRecord]) -> Result<usize> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        let log = map.entry(session_id.to_string()).or_default();
        let mut written = 0usize;
        for record in records {
            let key = record.dedup_key();
            if log.seen.insert(key) {
                log.records.push(record.clone());
                written += 1;
            }
        }
        if log.records.len() > MAX_RETAINED_RECORDS {
            let overflow = log.records.len() - MAX_RETAINED_RECORDS;
            for old in log.records.drain(..overflow) {
                log.seen.remove(&old.dedup_key());
            }
        }
        Ok(written)
    }

    async fn replay(&self, session_id: &str, limit: usize) -> Result<Vec<LogRecord>> {
        let map = self.inner.read().map_err(Self::backend_err)?;
        Ok(map
            .get(session_id)
            .map(|log| {
                let skip = log.records.len().saturating_sub(limit);
                log.records[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn put_state(&self, session_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        let log = map.entry(session_id.to_string()).or_default();
        log.state.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_state(&self, session_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let map = self.inner.read().map_err(Self::backend_err)?;
        Ok(map
            .get(session_id)
            .and_then(|log| log.state.get(key).cloned()))
    }

    async fn delete_state(&self, session_id: &str, key: &str) -> Result<()> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        if let Some(log) = map.get_mut(session_id) {
            log.state.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        let mut map = self.inner.write().map_err(Self::backend_err)?;
        map.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &str) -> LogRecord {
        LogRecord {
            role: MessageRole::User,
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_deduplicates_identical_records() {
        let log = InMemoryDurableLog::new();
        let r = record("hello");
        assert_eq!(log.append("s1", &[r.clone()]).await.unwrap(), 1);
        assert_eq!(log.append("s1", &[r]).await.unwrap(), 0);
        assert_eq!(log.replay("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replay_returns_the_most_recent_records() {
        let log = InMemoryDurableLog::new();
        for i in 0..5 {
            log.append("s1", &[record(&format!("m{i}"))]).await.unwrap();
        }
        let tail = log.replay("s1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }

    #[tokio::test]
    async fn state_round_trip_and_clear() {
        let log = InMemoryDurableLog::new();
        log.put_state("s1", "taskBoard", serde_json::json!({"id": "b1"}))
            .await
            .unwrap();
        let loaded = log.get_state("s1", "taskBoard").await.unwrap().unwrap();
        assert_eq!(loaded["id"], "b1");
        log.clear("s1").await.unwrap();
        assert!(log.get_state("s1", "taskBoard").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let log = InMemoryDurableLog::new();
        log.append("a", &[record("for a")]).await.unwrap();
        assert!(log.replay("b", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_drops_the_oldest() {
        let log = InMemoryDurableLog::new();
        for i in 0..(MAX_RETAINED_RECORDS + 10) {
            log.append("s1", &[record(&format!("m{i}"))]).await.unwrap();
        }
        let all = log.replay("s1", usize::MAX).await.unwrap();
        assert_eq!(all.len(), MAX_RETAINED_RECORDS);
        assert_eq!(all[0].content, "m10");
    }
}
