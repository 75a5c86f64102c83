//! Recall index: the vector store behind both memory tiers.
//!
//! Shared across sessions but partitioned by `(session, tier)` in every
//! filter; no cross-session read or write is possible through this API.
//! The in-memory implementation scores by cosine similarity and carries
//! the original text in metadata so search results need no second lookup.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::cosine_similarity;

/// Memory tier a record belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    ShortTerm,
    LongTerm,
}

impl MemoryTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryTier::ShortTerm => "short_term",
            MemoryTier::LongTerm => "long_term",
        }
    }
}

/// One indexed record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecallEntry {
    /// Composite id, e.g. `stm_<session>_<ts>_<role>` or `ltm_<session>_<ts>`.
    pub id: String,
    pub vector: Vec<f32>,
    pub session_id: String,
    pub tier: MemoryTier,
    /// Tier-specific payload; always carries the original content.
    pub metadata: serde_json::Value,
}

/// Scope every query and delete runs under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecallFilter {
    pub session_id: String,
    pub tier: MemoryTier,
}

impl RecallFilter {
    #[must_use]
    pub fn new(session_id: &str, tier: MemoryTier) -> Self {
        Self {
            session_id: session_id.to_string(),
            tier,
        }
    }
}

/// A scored query hit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RecallHit {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Errors from recall-index operations.
#[derive(Debug, Error, Diagnostic)]
pub enum RecallError {
    #[error("recall index backend error: {message}")]
    #[diagnostic(code(taskweft::recall::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, RecallError>;

/// Vector upsert/query/delete scoped by session and tier.
#[async_trait]
pub trait RecallIndex: Send + Sync {
    async fn upsert(&self, entries: Vec<RecallEntry>) -> Result<()>;

    /// Top-`top_k` entries within `filter`, best score first.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &RecallFilter,
    ) -> Result<Vec<RecallHit>>;

    /// Shallow-merge `patch` into the entry's metadata; false when absent.
    async fn update_metadata(&self, id: &str, patch: serde_json::Value) -> Result<bool>;

    /// Remove everything within `filter`; returns how many were removed.
    async fn delete_scope(&self, filter: &RecallFilter) -> Result<usize>;

    async fn count(&self, filter: &RecallFilter) -> Result<usize>;
}

/// Process-local recall index.
#[derive(Default)]
pub struct InMemoryRecallIndex {
    entries: RwLock<FxHashMap<String, RecallEntry>>,
}

impl InMemoryRecallIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(entry: &RecallEntry, filter: &RecallFilter) -> bool {
        entry.session_id == filter.session_id && entry.tier == filter.tier
    }
}

#[async_trait]
impl RecallIndex for InMemoryRecallIndex {
    async fn upsert(&self, new_entries: Vec<RecallEntry>) -> Result<()> {
        let mut entries = self.entries.write();
        for entry in new_entries {
            entries.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &RecallFilter,
    ) -> Result<Vec<RecallHit>> {
        let entries = self.entries.read();
        let mut hits: Vec<RecallHit> = entries
            .values()
            .filter(|entry| Self::matches(entry, filter))
            .map(|entry| RecallHit {
                id: entry.id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn update_metadata(&self, id: &str, patch: serde_json::Value) -> Result<bool> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(id) else {
            return Ok(false);
        };
        if let (Some(target), Some(source)) = (entry.metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        } else {
            entry.metadata = patch;
        }
        Ok(true)
    }

    async fn delete_scope(&self, filter: &RecallFilter) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !Self::matches(entry, filter));
        Ok(before - entries.len())
    }

    async fn count(&self, filter: &RecallFilter) -> Result<usize> {
        let entries = self.entries.read();
        Ok(entries
            .values()
            .filter(|entry| Self::matches(entry, filter))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, session: &str, tier: MemoryTier, vector: Vec<f32>) -> RecallEntry {
        RecallEntry {
            id: id.to_string(),
            vector,
            session_id: session.to_string(),
            tier,
            metadata: json!({"content": id}),
        }
    }

    #[tokio::test]
    async fn query_scores_and_orders() {
        let index = InMemoryRecallIndex::new();
        index
            .upsert(vec![
                entry("close", "s1", MemoryTier::ShortTerm, vec![1.0, 0.0]),
                entry("far", "s1", MemoryTier::ShortTerm, vec![0.0, 1.0]),
                entry("mid", "s1", MemoryTier::ShortTerm, vec![0.7, 0.7]),
            ])
            .await
            .unwrap();
        let hits = index
            .query(
                &[1.0, 0.0],
                2,
                &RecallFilter::new("s1", MemoryTier::ShortTerm),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "close");
        assert!(hits[0].score > 0.99);
        assert_eq!(hits[1].id, "mid");
    }

    #[tokio::test]
    async fn filters_partition_by_session_and_tier() {
        let index = InMemoryRecallIndex::new();
        index
            .upsert(vec![
                entry("a", "s1", MemoryTier::ShortTerm, vec![1.0]),
                entry("b", "s1", MemoryTier::LongTerm, vec![1.0]),
                entry("c", "s2", MemoryTier::ShortTerm, vec![1.0]),
            ])
            .await
            .unwrap();
        let stm_s1 = RecallFilter::new("s1", MemoryTier::ShortTerm);
        assert_eq!(index.count(&stm_s1).await.unwrap(), 1);
        let hits = index.query(&[1.0], 10, &stm_s1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let index = InMemoryRecallIndex::new();
        index
            .upsert(vec![entry("a", "s1", MemoryTier::ShortTerm, vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(vec![entry("a", "s1", MemoryTier::ShortTerm, vec![0.0, 1.0])])
            .await
            .unwrap();
        let filter = RecallFilter::new("s1", MemoryTier::ShortTerm);
        assert_eq!(index.count(&filter).await.unwrap(), 1);
        let hits = index.query(&[0.0, 1.0], 1, &filter).await.unwrap();
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn metadata_patch_is_a_shallow_merge() {
        let index = InMemoryRecallIndex::new();
        index
            .upsert(vec![entry("a", "s1", MemoryTier::LongTerm, vec![1.0])])
            .await
            .unwrap();
        assert!(
            index
                .update_metadata("a", json!({"interactions": 3}))
                .await
                .unwrap()
        );
        let hits = index
            .query(&[1.0], 1, &RecallFilter::new("s1", MemoryTier::LongTerm))
            .await
            .unwrap();
        assert_eq!(hits[0].metadata["interactions"], 3);
        assert_eq!(hits[0].metadata["content"], "a");
        assert!(!index.update_metadata("ghost", json!({})).await.unwrap());
    }

    #[tokio::test]
    async fn delete_scope_clears_only_the_partition() {
        let index = InMemoryRecallIndex::new();
        index
            .upsert(vec![
                entry("a", "s1", MemoryTier::ShortTerm, vec![1.0]),
                entry("b", "s1", MemoryTier::LongTerm, vec![1.0]),
            ])
            .await
            .unwrap();
        let removed = index
            .delete_scope(&RecallFilter::new("s1", MemoryTier::ShortTerm))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            index
                .count(&RecallFilter::new("s1", MemoryTier::LongTerm))
                .await
                .unwrap(),
            1
        );
    }
}
