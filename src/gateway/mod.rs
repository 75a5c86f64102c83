//! Model Gateway: the resilient front door to a language model.
//!
//! Wraps a [`LanguageModel`] provider with bounded retry, a circuit
//! breaker, and a per-call deadline. Generation and embedding share the
//! same envelope, so the planner, the workers, and the memory pipeline
//! all inherit one resilience budget.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskweft::config::GatewayConfig;
//! use taskweft::gateway::{ChatMessage, GenerateOptions, ModelGateway, StaticModel};
//!
//! # async fn example() -> Result<(), taskweft::gateway::GatewayError> {
//! let gateway = ModelGateway::new(
//!     Arc::new(StaticModel::always("hello")),
//!     GatewayConfig::default(),
//!     "gemini-2.0-flash",
//!     "text-embedding-004",
//! );
//! let reply = gateway
//!     .generate_with_tools(
//!         vec![ChatMessage::user("say hello")],
//!         vec![],
//!         GenerateOptions::plain("gemini-2.0-flash"),
//!         None,
//!     )
//!     .await?;
//! assert_eq!(reply.text, "hello");
//! # Ok(())
//! # }
//! ```

mod breaker;
mod http;
mod options;
mod provider;

pub use breaker::{BreakerState, CircuitBreaker};
pub use http::HttpLanguageModel;
pub use options::{
    ChatMessage, ChatRole, EmbedOptions, FileRef, GenerateOptions, Generated, NativeTools, ToolDef,
};
pub use provider::{GenerateRequest, LanguageModel, ProviderError, StaticModel};

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::config::GatewayConfig;

/// Gateway failure modes, as the rest of the system sees them.
///
/// `Clone` because the embedding batcher fans one failure out to every
/// waiting caller.
#[derive(Clone, Debug, Error, Diagnostic)]
pub enum GatewayError {
    /// A call exceeded its deadline.
    #[error("model call timed out after {seconds}s")]
    #[diagnostic(code(taskweft::gateway::timeout))]
    Timeout { seconds: u64 },

    /// The circuit breaker is open; the call was never attempted.
    #[error("model gateway unavailable (circuit open)")]
    #[diagnostic(
        code(taskweft::gateway::unavailable),
        help("The provider failed repeatedly; calls resume after the cooldown.")
    )]
    Unavailable,

    /// Provider throttled us and the retry budget ran out.
    #[error("model provider rate limited: {message}")]
    #[diagnostic(code(taskweft::gateway::rate_limited))]
    RateLimited { message: String },

    /// Non-retryable upstream failure.
    #[error("model provider error: {message}")]
    #[diagnostic(code(taskweft::gateway::provider))]
    Provider { message: String },

    /// The response shape was unrecognised.
    #[error("model protocol error: {message}")]
    #[diagnostic(code(taskweft::gateway::protocol))]
    Protocol { message: String },
}

impl GatewayError {
    fn from_provider(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { message } => GatewayError::RateLimited { message },
            ProviderError::Unavailable { message } => GatewayError::Provider { message },
            ProviderError::Protocol { message } => GatewayError::Protocol { message },
            ProviderError::Upstream { message } => GatewayError::Provider { message },
        }
    }

    /// Whether the retry loop may try again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout { .. } | GatewayError::RateLimited { .. }
        )
    }
}

/// The resilient model front door; one per session.
pub struct ModelGateway {
    provider: Arc<dyn LanguageModel>,
    breaker: CircuitBreaker,
    config: GatewayConfig,
    generation_model: String,
    embedding_model: String,
}

impl ModelGateway {
    #[must_use]
    pub fn new(
        provider: Arc<dyn LanguageModel>,
        config: GatewayConfig,
        generation_model: &str,
        embedding_model: &str,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            provider,
            breaker,
            config,
            generation_model: generation_model.to_string(),
            embedding_model: embedding_model.to_string(),
        }
    }

    /// Default model id used when callers build [`GenerateOptions`].
    #[must_use]
    pub fn generation_model(&self) -> &str {
        &self.generation_model
    }

    /// Breaker state for the diagnostics endpoint.
    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Generate text with optional external tool definitions.
    ///
    /// When `options.stream` is set and `chunk_tx` is provided, textual
    /// deltas are forwarded as they arrive; the returned [`Generated`]
    /// always holds the fully concatenated text and tool calls in
    /// extraction order. Chunks are best-effort: the return value is
    /// authoritative.
    #[instrument(skip_all, fields(model = %options.model, tools = tools.len()))]
    pub async fn generate_with_tools(
        &self,
        history: Vec<ChatMessage>,
        tools: Vec<ToolDef>,
        options: GenerateOptions,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Generated, GatewayError> {
        let request = GenerateRequest {
            history,
            tools,
            options,
        };
        self.call_with_retry(|| {
            let request = request.clone();
            let chunk_tx = chunk_tx.clone();
            let provider = Arc::clone(&self.provider);
            async move { provider.generate(&request, chunk_tx).await }
        })
        .await
    }

    /// Embed a single text.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let options = EmbedOptions::new(self.embedding_model.clone());
        let mut vectors = self.embed_batch_with(&[text.to_string()], &options).await?;
        vectors.pop().ok_or_else(|| GatewayError::Protocol {
            message: "provider returned no embedding".to_string(),
        })
    }

    /// Embed many texts, chunking into provider batches of at most
    /// `embed_batch_size`, preserving input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let options = EmbedOptions::new(self.embedding_model.clone());
        self.embed_batch_with(texts, &options).await
    }

    /// Embedding with explicit options.
    pub async fn embed_batch_with(
        &self,
        texts: &[String],
        options: &EmbedOptions,
    ) -> Result<Vec<Vec<f32>>, GatewayError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let chunk_size = self.config.embed_batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(chunk_size) {
            let model = options.model.clone();
            let chunk_owned: Vec<String> = chunk.to_vec();
            let mut vectors = self
                .call_with_retry(|| {
                    let provider = Arc::clone(&self.provider);
                    let model = model.clone();
                    let chunk = chunk_owned.clone();
                    async move { provider.embed(&model, &chunk).await }
                })
                .await?;
            if vectors.len() != chunk.len() {
                return Err(GatewayError::Protocol {
                    message: format!(
                        "embedding count mismatch: sent {}, got {}",
                        chunk.len(),
                        vectors.len()
                    ),
                });
            }
            if options.normalize {
                for vector in &mut vectors {
                    normalize_in_place(vector);
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Shared retry/deadline/breaker envelope.
    async fn call_with_retry<T, F, Fut>(&self, mut attempt: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.breaker.allow() {
            return Err(GatewayError::Unavailable);
        }

        let deadline = self.config.deadline;
        let mut backoff = self.config.initial_backoff;
        let mut last_error = GatewayError::Provider {
            message: "no attempts made".to_string(),
        };

        for round in 1..=self.config.max_attempts.max(1) {
            let outcome = tokio::time::timeout(deadline, attempt()).await;
            let error = match outcome {
                Ok(Ok(value)) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    // Provider-level unavailability is worth retrying even
                    // though the mapped error is terminal for callers.
                    let retryable_unavailable = matches!(err, ProviderError::Unavailable { .. });
                    let mapped = GatewayError::from_provider(err);
                    self.breaker.record_failure();
                    if !mapped.is_retryable() && !retryable_unavailable {
                        return Err(mapped);
                    }
                    mapped
                }
                Err(_) => {
                    self.breaker.record_failure();
                    GatewayError::Timeout {
                        seconds: deadline.as_secs(),
                    }
                }
            };

            warn!(round, error = %error, "model call failed");
            last_error = error;
            if round < self.config.max_attempts {
                let jitter = backoff.mul_f64(0.5 + rand::random::<f64>() * 0.5);
                debug!(backoff_ms = jitter.as_millis() as u64, "backing off");
                tokio::time::sleep(jitter).await;
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(last_error)
    }
}

/// Scale `vector` to unit Euclidean norm; zero vectors pass through.
pub fn normalize_in_place(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0.0 when either side has zero magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct FlakyModel {
        failures_before_success: Mutex<u32>,
        kind: fn(String) -> ProviderError,
    }

    #[async_trait]
    impl LanguageModel for FlakyModel {
        async fn generate(
            &self,
            _request: &GenerateRequest,
            _chunk_tx: Option<mpsc::Sender<String>>,
        ) -> Result<Generated, ProviderError> {
            let mut remaining = self.failures_before_success.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err((self.kind)("induced failure".to_string()));
            }
            Ok(Generated {
                text: "recovered".to_string(),
                tool_calls: vec![],
            })
        }

        async fn embed(
            &self,
            _model: &str,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![3.0, 4.0]).collect())
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            deadline: Duration::from_secs(5),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            embed_batch_size: 2,
        }
    }

    fn gateway(provider: Arc<dyn LanguageModel>) -> ModelGateway {
        ModelGateway::new(provider, fast_config(), "gen-model", "embed-model")
    }

    #[tokio::test]
    async fn retries_rate_limits_until_success() {
        let provider = Arc::new(FlakyModel {
            failures_before_success: Mutex::new(2),
            kind: |message| ProviderError::RateLimited { message },
        });
        let gateway = gateway(provider);
        let generated = gateway
            .generate_with_tools(
                vec![ChatMessage::user("hi")],
                vec![],
                GenerateOptions::plain("gen-model"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(generated.text, "recovered");
    }

    #[tokio::test]
    async fn protocol_errors_are_not_retried() {
        let provider = Arc::new(FlakyModel {
            failures_before_success: Mutex::new(10),
            kind: |message| ProviderError::Protocol { message },
        });
        let gateway = gateway(Arc::clone(&provider) as Arc<dyn LanguageModel>);
        let err = gateway
            .generate_with_tools(
                vec![ChatMessage::user("hi")],
                vec![],
                GenerateOptions::plain("gen-model"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Protocol { .. }));
        // Only one attempt was burned.
        assert_eq!(*provider.failures_before_success.lock(), 9);
    }

    #[tokio::test]
    async fn breaker_opens_and_fails_fast() {
        let provider = Arc::new(FlakyModel {
            failures_before_success: Mutex::new(100),
            kind: |message| ProviderError::RateLimited { message },
        });
        let mut config = fast_config();
        config.breaker_threshold = 3;
        let gateway = ModelGateway::new(provider, config, "g", "e");
        let _ = gateway
            .generate_with_tools(
                vec![ChatMessage::user("hi")],
                vec![],
                GenerateOptions::plain("g"),
                None,
            )
            .await;
        assert_eq!(gateway.breaker_state(), BreakerState::Open);
        let err = gateway
            .generate_with_tools(
                vec![ChatMessage::user("hi")],
                vec![],
                GenerateOptions::plain("g"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable));
    }

    #[tokio::test]
    async fn embeddings_are_normalized_by_default() {
        let provider = Arc::new(FlakyModel {
            failures_before_success: Mutex::new(0),
            kind: |message| ProviderError::Upstream { message },
        });
        let gateway = gateway(provider);
        let vector = gateway.embed_text("anything").await.unwrap();
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn batch_order_is_preserved_across_chunks() {
        let provider = Arc::new(StaticModel::default());
        let gateway = gateway(provider);
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let batched = gateway.embed_batch(&texts).await.unwrap();
        for (i, text) in texts.iter().enumerate() {
            let single = gateway.embed_text(text).await.unwrap();
            assert_eq!(batched[i], single, "order broken at {i}");
        }
    }

    #[test]
    fn zero_vector_survives_normalization() {
        let mut zeros = vec![0.0f32; 4];
        normalize_in_place(&mut zeros);
        assert_eq!(zeros, vec![0.0; 4]);
    }
}
