//! Memory Manager: tiered vector memory scoped to one session.
//!
//! Short-term records mirror individual messages; long-term rollups hold
//! summarised windows with a reusable answer. Both live in the shared
//! [`RecallIndex`], partitioned by `(session, tier)`. Embeddings flow
//! through a bounded cache and an order-preserving batcher, both fed by
//! the session's [`ModelGateway`] so they inherit its resilience budget.

mod batcher;
mod cache;
mod recall;
mod rollup;

pub use batcher::EmbeddingBatcher;
pub use cache::EmbeddingCache;
pub use recall::{
    InMemoryRecallIndex, MemoryTier, RecallEntry, RecallError, RecallFilter, RecallHit,
    RecallIndex,
};
pub use rollup::{MemoryRollup, importance_score};

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::MemoryConfig;
use crate::gateway::{ChatMessage, GatewayError, GenerateOptions, ModelGateway};
use crate::message::{Message, MessageRole};
use crate::storage::{LayerError, StorageLayer};

/// Verbatim prefix on answers served from a long-term rollup.
pub const CACHED_ANSWER_PREFIX: &str = "[Based on similar past query]\n\n";

/// Returned when neither tier has anything relevant.
pub const NO_CONTEXT_SENTINEL: &str = "No relevant past context found.";

/// Importance assigned to plain message records.
const DEFAULT_STM_IMPORTANCE: f32 = 0.7;

/// Errors from the memory pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum MemoryError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Recall(#[from] RecallError),

    #[error("memory serialization error: {0}")]
    #[diagnostic(code(taskweft::memory::serde))]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// A search result with the original text pulled out of metadata.
#[derive(Clone, Debug, Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// Assembled context for one query.
#[derive(Clone, Debug, PartialEq)]
pub struct BuiltContext {
    pub context: String,
    pub stm_count: usize,
    pub ltm_count: usize,
}

/// Counts for the memory stats endpoint.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub session_memories: usize,
    pub long_term_memories: usize,
    pub total_memories: usize,
}

/// Outcome of the cached-answer gate.
#[derive(Clone, Debug, PartialEq)]
pub enum CachedAnswer {
    Hit { answer: String },
    Miss,
}

pub struct MemoryManager {
    session_id: String,
    gateway: Arc<ModelGateway>,
    index: Arc<dyn RecallIndex>,
    cache: ParkingMutex<EmbeddingCache>,
    batcher: Arc<EmbeddingBatcher>,
    config: MemoryConfig,
}

impl MemoryManager {
    #[must_use]
    pub fn new(
        session_id: &str,
        gateway: Arc<ModelGateway>,
        index: Arc<dyn RecallIndex>,
        config: MemoryConfig,
    ) -> Arc<Self> {
        let cache = EmbeddingCache::new(config.embedding_cache_size, config.embedding_cache_ttl);
        let batcher = EmbeddingBatcher::new(Arc::clone(&gateway), &config);
        Arc::new(Self {
            session_id: session_id.to_string(),
            gateway,
            index,
            cache: ParkingMutex::new(cache),
            batcher,
            config,
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Embed through the cache, falling back to the batcher on a miss.
    pub async fn embed_cached(&self, text: &str, priority: u8) -> Result<Vec<f32>> {
        if let Some(vector) = self.cache.lock().get(text) {
            return Ok(vector);
        }
        let vector = self.batcher.embed(text.to_string(), priority).await?;
        self.cache.lock().insert(text, vector.clone());
        Ok(vector)
    }

    fn stm_filter(&self) -> RecallFilter {
        RecallFilter::new(&self.session_id, MemoryTier::ShortTerm)
    }

    fn ltm_filter(&self) -> RecallFilter {
        RecallFilter::new(&self.session_id, MemoryTier::LongTerm)
    }

    // -- short-term ---------------------------------------------------------

    /// Index one message as a short-term record.
    #[instrument(skip(self, message), fields(session = %self.session_id))]
    pub async fn save_message(&self, message: &Message) -> Result<()> {
        let content = message.content();
        if content.trim().is_empty() {
            return Ok(());
        }
        let vector = self.embed_cached(&content, 0).await?;
        let timestamp = message.timestamp_nanos();
        let entry = RecallEntry {
            id: format!(
                "stm_{}_{}_{}",
                self.session_id,
                timestamp,
                message.role.as_str()
            ),
            vector,
            session_id: self.session_id.clone(),
            tier: MemoryTier::ShortTerm,
            metadata: json!({
                "type": MemoryTier::ShortTerm.as_str(),
                "sessionId": self.session_id,
                "timestamp": timestamp,
                "role": message.role.as_str(),
                "importance": DEFAULT_STM_IMPORTANCE,
                "content": content,
            }),
        };
        self.index.upsert(vec![entry]).await?;
        Ok(())
    }

    /// Semantic search over this session's short-term tier.
    pub async fn search_short_term(&self, query: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        self.search_short_term_filtered(query, top_k, None).await
    }

    /// Short-term search with an extra metadata filter merged onto the
    /// session scope: every key/value pair in `extra` must match the
    /// record's metadata exactly.
    pub async fn search_short_term_filtered(
        &self,
        query: &str,
        top_k: usize,
        extra: Option<&serde_json::Value>,
    ) -> Result<Vec<MemoryHit>> {
        let vector = self.embed_cached(query, 0).await?;
        let hits = self.index.query(&vector, top_k, &self.stm_filter()).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| metadata_matches(&hit.metadata, extra))
            .map(hit_from_recall)
            .collect())
    }

    // -- long-term ----------------------------------------------------------

    /// Index a rollup into the long-term tier.
    pub async fn add_long_term(&self, rollup: &MemoryRollup) -> Result<String> {
        let vector = self.embed_cached(&rollup.embeddable_text(), 0).await?;
        let id = format!(
            "ltm_{}_{}",
            self.session_id,
            rollup
                .created_at
                .timestamp_nanos_opt()
                .unwrap_or_else(|| rollup.created_at.timestamp_micros())
        );
        let mut metadata = serde_json::to_value(rollup)?;
        if let Some(object) = metadata.as_object_mut() {
            object.insert("type".into(), json!(MemoryTier::LongTerm.as_str()));
            object.insert("sessionId".into(), json!(self.session_id));
            object.insert("content".into(), json!(rollup.summary));
        }
        let entry = RecallEntry {
            id: id.clone(),
            vector,
            session_id: self.session_id.clone(),
            tier: MemoryTier::LongTerm,
            metadata,
        };
        self.index.upsert(vec![entry]).await?;
        Ok(id)
    }

    /// Long-term search; only hits at or above the tier threshold return.
    pub async fn search_long_term(&self, query: &str, top_k: usize) -> Result<Vec<MemoryHit>> {
        let vector = self.embed_cached(query, 0).await?;
        let hits = self.index.query(&vector, top_k, &self.ltm_filter()).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= self.config.ltm_threshold)
            .map(hit_from_recall)
            .collect())
    }

    /// The similarity-gated answer cache: a 1-nearest long-term lookup that
    /// serves the stored answer verbatim (prefixed) on a strong match, and
    /// updates the rollup's access statistics.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn lookup_cached_answer(&self, query: &str) -> Result<CachedAnswer> {
        let vector = self.embed_cached(query, 0).await?;
        let hits = self.index.query(&vector, 1, &self.ltm_filter()).await?;
        let Some(best) = hits.into_iter().next() else {
            return Ok(CachedAnswer::Miss);
        };
        if best.score < self.config.cached_answer_threshold {
            return Ok(CachedAnswer::Miss);
        }
        let answer = best
            .metadata
            .get("answer")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if answer.is_empty() {
            return Ok(CachedAnswer::Miss);
        }
        let interactions = best
            .metadata
            .get("interactions")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        self.index
            .update_metadata(
                &best.id,
                json!({
                    "interactions": interactions + 1,
                    "lastAccessed": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        debug!(score = best.score, id = %best.id, "cached answer hit");
        Ok(CachedAnswer::Hit {
            answer: format!("{CACHED_ANSWER_PREFIX}{answer}"),
        })
    }

    // -- context assembly ---------------------------------------------------

    /// Render relevant memory into the fixed context layout: long-term
    /// first, then recent short-term snippets, each numbered with a
    /// relevance percentage.
    pub async fn build_context(&self, query: &str) -> Result<BuiltContext> {
        let ltm = self
            .search_long_term(query, self.config.max_ltm_results)
            .await?;
        let stm = self
            .search_short_term(query, self.config.max_stm_results)
            .await?;
        if ltm.is_empty() && stm.is_empty() {
            return Ok(BuiltContext {
                context: NO_CONTEXT_SENTINEL.to_string(),
                stm_count: 0,
                ltm_count: 0,
            });
        }

        let mut sections: Vec<String> = Vec::new();
        if !ltm.is_empty() {
            let mut lines = vec!["## Relevant Long-Term Memory".to_string()];
            for (i, hit) in ltm.iter().enumerate() {
                let topics = hit
                    .metadata
                    .get("topics")
                    .and_then(|v| v.as_array())
                    .map(|topics| {
                        topics
                            .iter()
                            .filter_map(|t| t.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                let mut line = format!(
                    "{}. [{:.0}% relevant] {}",
                    i + 1,
                    hit.score * 100.0,
                    hit.content
                );
                if !topics.is_empty() {
                    line.push_str(&format!(" (topics: {topics})"));
                }
                lines.push(line);
            }
            sections.push(lines.join("\n"));
        }
        if !stm.is_empty() {
            let mut lines = vec!["## Recent Conversation Context".to_string()];
            for (i, hit) in stm.iter().enumerate() {
                let role = hit
                    .metadata
                    .get("role")
                    .and_then(|v| v.as_str())
                    .unwrap_or("user");
                lines.push(format!(
                    "{}. [{:.0}% relevant] ({role}) {}",
                    i + 1,
                    hit.score * 100.0,
                    truncate_chars(&hit.content, self.config.stm_snippet_chars)
                ));
            }
            sections.push(lines.join("\n"));
        }

        Ok(BuiltContext {
            context: sections.join("\n\n"),
            stm_count: stm.len(),
            ltm_count: ltm.len(),
        })
    }

    // -- summarisation ------------------------------------------------------

    /// Ask the model for a 2–3 sentence summary of the last 10 messages.
    pub async fn summarize_conversation(&self, messages: &[Message]) -> Result<String> {
        let window = last_n(messages, 10);
        let transcript = window
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content()))
            .collect::<Vec<_>>()
            .join("\n");
        let generated = self
            .gateway
            .generate_with_tools(
                vec![
                    ChatMessage::system(
                        "Summarize the conversation in 2-3 sentences. \
                         Capture the user's goals and any conclusions reached.",
                    ),
                    ChatMessage::user(transcript),
                ],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await?;
        Ok(generated.text.trim().to_string())
    }

    /// Ask the model for 3–5 comma-separated topics; returns at most 5.
    pub async fn extract_topics(&self, text: &str) -> Result<Vec<String>> {
        let generated = self
            .gateway
            .generate_with_tools(
                vec![
                    ChatMessage::system(
                        "List 3-5 topics covered by the text, as a single \
                         comma-separated line. Reply with the topics only.",
                    ),
                    ChatMessage::user(text.to_string()),
                ],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await?;
        Ok(generated
            .text
            .split(',')
            .map(|topic| topic.trim().trim_matches('.').to_string())
            .filter(|topic| !topic.is_empty())
            .take(5)
            .collect())
    }

    /// Summarise a message window into a long-term rollup and index it.
    #[instrument(skip(self, messages), fields(session = %self.session_id, window = messages.len()))]
    pub async fn rollup_window(&self, messages: &[Message]) -> Result<Option<MemoryRollup>> {
        if messages.is_empty() {
            return Ok(None);
        }
        let queries: Vec<String> = messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(Message::content)
            .collect();
        let answer = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Model)
            .map(Message::content)
            .unwrap_or_default();
        let summary = self.summarize_conversation(messages).await?;
        let topics = match self.extract_topics(&summary).await {
            Ok(topics) => topics,
            Err(err) => {
                warn!(error = %err, "topic extraction failed; rolling up without topics");
                Vec::new()
            }
        };
        let rollup = MemoryRollup::new(queries.join(" | "), summary, answer, topics);
        self.add_long_term(&rollup).await?;
        Ok(Some(rollup))
    }

    // -- maintenance --------------------------------------------------------

    pub async fn stats(&self) -> Result<MemoryStats> {
        let session_memories = self.index.count(&self.stm_filter()).await?;
        let long_term_memories = self.index.count(&self.ltm_filter()).await?;
        Ok(MemoryStats {
            session_memories,
            long_term_memories,
            total_memories: session_memories + long_term_memories,
        })
    }

    /// Drop both tiers for this session.
    pub async fn clear_session(&self) -> Result<usize> {
        let stm = self.index.delete_scope(&self.stm_filter()).await?;
        let ltm = self.index.delete_scope(&self.ltm_filter()).await?;
        Ok(stm + ltm)
    }
}

/// The memory manager is also the priority-3 storage layer.
#[async_trait]
impl StorageLayer for MemoryManager {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn priority(&self) -> u8 {
        3
    }

    async fn write(&self, batch: &[Message]) -> std::result::Result<(), LayerError> {
        for message in batch {
            self.save_message(message)
                .await
                .map_err(|e| LayerError::new(e.to_string()))?;
        }
        Ok(())
    }
}

fn metadata_matches(metadata: &serde_json::Value, extra: Option<&serde_json::Value>) -> bool {
    let Some(required) = extra.and_then(|value| value.as_object()) else {
        return true;
    };
    required
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

fn hit_from_recall(hit: RecallHit) -> MemoryHit {
    let content = hit
        .metadata
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    MemoryHit {
        id: hit.id,
        score: hit.score,
        content,
        metadata: hit.metadata,
    }
}

fn last_n<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{truncated}...")
}
