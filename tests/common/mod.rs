//! Shared fixtures: a registry over in-memory stores and a scripted model.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskweft::config::RuntimeConfig;
use taskweft::events::MemorySink;
use taskweft::gateway::{Generated, LanguageModel, StaticModel};
use taskweft::memory::InMemoryRecallIndex;
use taskweft::storage::{InMemoryArchive, InMemoryDurableLog};
use taskweft::transport::{SessionRegistry, SessionRuntime, SharedServices};

/// Config with timers shrunk so tests do not wait on production intervals.
pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.coordinator.flush_interval = Duration::from_millis(50);
    config.coordinator.retry_backoff = Duration::from_millis(1);
    config.gateway.initial_backoff = Duration::from_millis(1);
    config.gateway.deadline = Duration::from_secs(5);
    config.memory.batch_linger = Duration::from_millis(5);
    config.executor.cached_word_delay = Duration::from_millis(1);
    config
}

pub fn registry_with_provider(provider: Arc<dyn LanguageModel>) -> Arc<SessionRegistry> {
    SessionRegistry::new(SharedServices {
        config: test_config(),
        provider,
        archive: Arc::new(InMemoryArchive::new()),
        log: Arc::new(InMemoryDurableLog::new()),
        index: Arc::new(InMemoryRecallIndex::new()),
    })
}

/// Registry whose model serves `replies` to generation calls in order
/// (the last reply repeats).
pub fn registry_with_replies(replies: &[&str]) -> Arc<SessionRegistry> {
    let generated = replies
        .iter()
        .map(|text| Generated {
            text: (*text).to_string(),
            tool_calls: vec![],
        })
        .collect();
    registry_with_provider(Arc::new(StaticModel::new(generated)))
}

/// Attach a capture sink to the runtime's bus.
pub fn capture_events(runtime: &SessionRuntime) -> MemorySink {
    let sink = MemorySink::new();
    runtime.bus.attach(sink.clone());
    sink
}

/// Give the bus workers a beat to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub const ASSESS_SIMPLE: &str =
    r#"{"isComplex": false, "reason": "single-step", "suggestedApproach": "direct"}"#;

pub const ASSESS_COMPLEX: &str = r#"{"isComplex": true, "reason": "multi-step", "suggestedApproach": "planned", "estimatedTasks": 3}"#;
