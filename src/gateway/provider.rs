//! The provider seam: a model backend the gateway wraps with resilience.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use super::options::{ChatMessage, GenerateOptions, Generated, ToolDef};

/// One generation request as the provider receives it.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub history: Vec<ChatMessage>,
    pub tools: Vec<ToolDef>,
    pub options: GenerateOptions,
}

/// Errors a provider can report. The gateway classifies these into its own
/// retry policy; providers should pick the closest variant rather than
/// collapsing everything into `Upstream`.
#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    /// The provider asked us to slow down; retryable.
    #[error("provider rate limited: {message}")]
    #[diagnostic(code(taskweft::provider::rate_limited))]
    RateLimited { message: String },

    /// Transient unavailability (5xx, connection refused); retryable.
    #[error("provider unavailable: {message}")]
    #[diagnostic(code(taskweft::provider::unavailable))]
    Unavailable { message: String },

    /// The response shape was not recognised; not retryable.
    #[error("provider protocol error: {message}")]
    #[diagnostic(
        code(taskweft::provider::protocol),
        help("The provider API may have changed; check the response payload.")
    )]
    Protocol { message: String },

    /// Definitive upstream rejection (4xx other than 429); not retryable.
    #[error("provider error: {message}")]
    #[diagnostic(code(taskweft::provider::upstream))]
    Upstream { message: String },
}

/// A language model backend: text generation (optionally streamed through
/// `chunk_tx`) and batch embedding.
///
/// Variants substitute freely: the bundled HTTP implementation for
/// production, [`StaticModel`] for tests.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one generation. When `chunk_tx` is `Some` and the request asks
    /// for streaming, implementations send each textual delta as it
    /// arrives; the returned [`Generated`] always carries the full text.
    async fn generate(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError>;

    /// Embed each text, one vector per input, input order preserved.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Scripted in-process model for tests and offline runs.
///
/// Generation replies are served in order and the last one repeats;
/// embeddings are deterministic hashes of the text, so identical inputs
/// embed identically (the property the memory round-trip tests rely on).
pub struct StaticModel {
    replies: Mutex<Vec<Generated>>,
    /// Embedding dimensionality; defaults to 64.
    dimension: usize,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl Default for StaticModel {
    fn default() -> Self {
        Self::new(vec![Generated {
            text: "ok".to_string(),
            tool_calls: Vec::new(),
        }])
    }
}

impl StaticModel {
    #[must_use]
    pub fn new(replies: Vec<Generated>) -> Self {
        Self {
            replies: Mutex::new(replies),
            dimension: 64,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a model that always answers with `text`.
    #[must_use]
    pub fn always(text: &str) -> Self {
        Self::new(vec![Generated {
            text: text.to_string(),
            tool_calls: Vec::new(),
        }])
    }

    /// Requests observed so far, for assertions.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.calls.lock().clone()
    }

    /// Deterministic bag-of-words pseudo-embedding of `text`.
    ///
    /// Each word contributes a hash-seeded direction, so identical texts
    /// embed identically and word overlap yields high cosine similarity,
    /// close enough to a real embedder for the memory tests to be
    /// meaningful.
    #[must_use]
    pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
        let mut vector = vec![0.0f32; dimension];
        for word in text.split_whitespace() {
            let mut seed: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in word.to_lowercase().bytes() {
                seed = seed.wrapping_mul(0x100_0000_01b3) ^ u64::from(byte);
            }
            for slot in vector.iter_mut() {
                // Cheap LCG step per dimension.
                seed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                *slot += ((seed >> 33) % 1000) as f32 / 1000.0 - 0.5;
            }
        }
        vector
    }
}

#[async_trait]
impl LanguageModel for StaticModel {
    async fn generate(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError> {
        self.calls.lock().push(request.clone());
        let reply = {
            let mut replies = self.replies.lock();
            if replies.len() > 1 {
                replies.remove(0)
            } else {
                replies
                    .first()
                    .cloned()
                    .ok_or_else(|| ProviderError::Upstream {
                        message: "static model has no replies".to_string(),
                    })?
            }
        };
        if request.options.stream {
            if let Some(tx) = chunk_tx {
                if !reply.text.is_empty() {
                    let _ = tx.send(reply.text.clone()).await;
                }
            }
        }
        Ok(reply)
    }

    async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|text| Self::hash_embedding(text, self.dimension))
            .collect())
    }
}
