//! Runtime configuration for a taskweft server.
//!
//! Every tunable has a compiled-in default; `RuntimeConfig::from_env()`
//! overlays environment variables (loaded through `dotenvy`) on top of
//! those defaults. Per-session components receive the sub-structs they
//! need at construction time: there is no global registry.

use std::time::Duration;

/// Top-level configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Address the transport binds to.
    pub bind_addr: String,
    /// SQLite URL for the relational archive; `None` selects the in-memory
    /// archive (tests, ephemeral runs).
    pub sqlite_url: Option<String>,
    /// Bearer token for the admin surface; `None` disables auth.
    pub api_key: Option<String>,
    pub provider: ProviderConfig,
    pub gateway: GatewayConfig,
    pub coordinator: CoordinatorConfig,
    pub memory: MemoryConfig,
    pub executor: ExecutorConfig,
    pub worker: WorkerConfig,
    pub planner: PlannerConfig,
    /// Replan automatically when a task fails after its retries.
    pub auto_replan_on_failure: bool,
}

/// Settings for the bundled HTTP language-model provider.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub generation_model: String,
    pub embedding_model: String,
}

/// Resilience envelope around every model call.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// First backoff; doubles per attempt, with jitter.
    pub initial_backoff: Duration,
    /// Per-call deadline.
    pub deadline: Duration,
    /// Consecutive failures before the breaker opens.
    pub breaker_threshold: u32,
    /// Quiet period before an open breaker half-opens.
    pub breaker_cooldown: Duration,
    /// Chunk size for batch embedding.
    pub embed_batch_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            embed_batch_size: 16,
        }
    }
}

/// Storage coordinator batching and retry knobs.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,
    /// Timer armed on enqueue when the batch threshold is not met.
    pub flush_interval: Duration,
    /// Retry budget for the critical (priority 1) layer.
    pub max_retries: u32,
    /// First retry backoff for the critical layer; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: Duration::from_secs(2),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Memory manager thresholds and cache sizing.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// Minimum similarity for a long-term hit to count at all.
    pub ltm_threshold: f32,
    /// Similarity gate for serving a cached answer verbatim.
    pub cached_answer_threshold: f32,
    pub max_stm_results: usize,
    pub max_ltm_results: usize,
    /// Short-term snippets are truncated to this many characters when
    /// rendered into context.
    pub stm_snippet_chars: usize,
    pub embedding_cache_size: usize,
    pub embedding_cache_ttl: Duration,
    /// Linger before a partial embedding batch is flushed.
    pub batch_linger: Duration,
    pub batch_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ltm_threshold: 0.65,
            cached_answer_threshold: 0.90,
            max_stm_results: 5,
            max_ltm_results: 3,
            stm_snippet_chars: 300,
            embedding_cache_size: 200,
            embedding_cache_ttl: Duration::from_secs(3600),
            batch_linger: Duration::from_millis(100),
            batch_size: 16,
        }
    }
}

/// Session executor knobs.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Reason-act turns in the direct path.
    pub max_turns: usize,
    /// Most recent history messages formatted for the model.
    pub max_history_messages: usize,
    /// Model responses between long-term rollups; clamped to 5..=15.
    pub rollup_interval: u32,
    /// Per-tool execution deadline.
    pub tool_deadline: Duration,
    /// Pause between words when replaying a cached answer.
    pub cached_word_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_history_messages: 30,
            rollup_interval: 10,
            tool_deadline: Duration::from_secs(30),
            cached_word_delay: Duration::from_millis(10),
        }
    }
}

/// Worker loop bounds.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Reason-act turns per task attempt.
    pub max_turns: usize,
    /// Extra turns granted on the first retry.
    pub retry_extra_turns: usize,
    /// Candidate outputs shorter than this skip self-assessment.
    pub assess_min_chars: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_turns: 5,
            retry_extra_turns: 2,
            assess_min_chars: 50,
        }
    }
}

/// Planner normalisation limits.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Hard clamp on tasks per plan.
    pub max_tasks: usize,
    /// Default retry budget per task.
    pub default_max_retries: u32,
    /// Soft limit on consecutive work tasks before a checkpoint.
    pub max_consecutive_work: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 15,
            default_max_retries: 2,
            max_consecutive_work: 4,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            sqlite_url: None,
            api_key: None,
            provider: ProviderConfig {
                api_key: None,
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                generation_model: "gemini-2.0-flash".to_string(),
                embedding_model: "text-embedding-004".to_string(),
            },
            gateway: GatewayConfig::default(),
            coordinator: CoordinatorConfig::default(),
            memory: MemoryConfig::default(),
            executor: ExecutorConfig::default(),
            worker: WorkerConfig::default(),
            planner: PlannerConfig::default(),
            auto_replan_on_failure: true,
        }
    }
}

impl RuntimeConfig {
    /// Resolves configuration from the environment on top of defaults.
    ///
    /// Recognised variables: `TASKWEFT_BIND_ADDR`, `TASKWEFT_SQLITE_URL`,
    /// `TASKWEFT_API_KEY`, `TASKWEFT_ROLLUP_INTERVAL`, `GEMINI_API_KEY`,
    /// `TASKWEFT_PROVIDER_URL`, `TASKWEFT_GENERATION_MODEL`,
    /// `TASKWEFT_EMBEDDING_MODEL`.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TASKWEFT_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.sqlite_url = std::env::var("TASKWEFT_SQLITE_URL").ok();
        config.api_key = std::env::var("TASKWEFT_API_KEY").ok();
        config.provider.api_key = std::env::var("GEMINI_API_KEY").ok();
        if let Ok(url) = std::env::var("TASKWEFT_PROVIDER_URL") {
            config.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("TASKWEFT_GENERATION_MODEL") {
            config.provider.generation_model = model;
        }
        if let Ok(model) = std::env::var("TASKWEFT_EMBEDDING_MODEL") {
            config.provider.embedding_model = model;
        }
        if let Ok(raw) = std::env::var("TASKWEFT_ROLLUP_INTERVAL") {
            if let Ok(interval) = raw.parse::<u32>() {
                config.executor.rollup_interval = interval;
            }
        }
        config.executor.rollup_interval = config.executor.rollup_interval.clamp(5, 15);
        config
    }
}
