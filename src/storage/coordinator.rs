//! Storage coordinator: priority-ordered fan-out of persisted messages.
//!
//! Every accepted message is queued and flushed (by size, by timer, or on
//! demand) to the storage layers in ascending priority order:
//!
//! 1. durable log (critical; failures fail the flush after bounded retry)
//! 2. relational archive
//! 3. memory pipeline (embedding + recall upsert)
//!
//! Only priority-1 failures propagate; lower tiers log and continue. On a
//! priority-1 failure the drained batch is pushed back to the head of the
//! queue in order, so a later flush (or retry) sees the same prefix and
//! the archive's dedup key absorbs any partial overlap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex as ParkingMutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::archive::{ArchiveStore, ArchivedMessage};
use super::log::{DurableLog, LogRecord};
use crate::config::CoordinatorConfig;
use crate::message::Message;

/// A single storage tier in the fan-out.
#[async_trait]
pub trait StorageLayer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ascending number = higher priority; 1 is critical.
    fn priority(&self) -> u8;

    async fn write(&self, batch: &[Message]) -> Result<(), LayerError>;
}

/// Uniform error carried across the layer seam.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LayerError {
    pub message: String,
}

impl LayerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Coordinator failures visible to callers.
#[derive(Debug, Error, Diagnostic)]
pub enum CoordinatorError {
    /// The critical layer failed after its retry budget; the batch was
    /// returned to the head of the queue.
    #[error("critical storage layer '{layer}' failed after {attempts} attempts: {message}")]
    #[diagnostic(
        code(taskweft::coordinator::persistence),
        help("The batch was requeued; a later flush will retry it.")
    )]
    Persistence {
        layer: &'static str,
        attempts: u32,
        message: String,
    },
}

/// Per-layer counters for the diagnostics endpoint.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LayerMetrics {
    pub priority: u8,
    pub writes: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Snapshot of coordinator health.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorMetrics {
    pub queued: usize,
    pub flushes: u64,
    pub layers: Vec<(String, LayerMetrics)>,
}

pub struct StorageCoordinator {
    layers: Vec<Arc<dyn StorageLayer>>,
    queue: ParkingMutex<VecDeque<Message>>,
    timer: ParkingMutex<Option<JoinHandle<()>>>,
    flush_gate: tokio::sync::Mutex<()>,
    metrics: ParkingMutex<rustc_hash::FxHashMap<&'static str, LayerMetrics>>,
    flushes: ParkingMutex<u64>,
    priority_mode: AtomicBool,
    config: CoordinatorConfig,
}

impl StorageCoordinator {
    /// Builds a coordinator over the given layers; they are sorted by
    /// priority here so construction order does not matter.
    #[must_use]
    pub fn new(mut layers: Vec<Arc<dyn StorageLayer>>, config: CoordinatorConfig) -> Arc<Self> {
        layers.sort_by_key(|layer| layer.priority());
        let mut metrics = rustc_hash::FxHashMap::default();
        for layer in &layers {
            metrics.insert(
                layer.name(),
                LayerMetrics {
                    priority: layer.priority(),
                    ..Default::default()
                },
            );
        }
        Arc::new(Self {
            layers,
            queue: ParkingMutex::new(VecDeque::new()),
            timer: ParkingMutex::new(None),
            flush_gate: tokio::sync::Mutex::new(()),
            metrics: ParkingMutex::new(metrics),
            flushes: ParkingMutex::new(0),
            priority_mode: AtomicBool::new(false),
            config,
        })
    }

    /// Enqueue one message. Flushes inline when the batch threshold is met
    /// or priority-write mode is on; otherwise arms the flush timer.
    pub async fn save_message(self: &Arc<Self>, message: Message) -> Result<(), CoordinatorError> {
        let queued = {
            let mut queue = self.queue.lock();
            queue.push_back(message);
            queue.len()
        };
        if queued >= self.config.batch_size || self.priority_mode.load(Ordering::Relaxed) {
            self.flush().await
        } else {
            self.arm_timer();
            Ok(())
        }
    }

    /// Force a flush of everything queued (the `/api/sync` path).
    pub async fn sync(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        self.flush().await
    }

    /// While on, every enqueue flushes immediately.
    pub fn set_priority_mode(&self, on: bool) {
        self.priority_mode.store(on, Ordering::Relaxed);
    }

    #[must_use]
    pub fn metrics(&self) -> CoordinatorMetrics {
        let mut layers: Vec<(String, LayerMetrics)> = self
            .metrics
            .lock()
            .iter()
            .map(|(name, metrics)| ((*name).to_string(), metrics.clone()))
            .collect();
        layers.sort_by_key(|(_, m)| m.priority);
        CoordinatorMetrics {
            queued: self.queue.lock().len(),
            flushes: *self.flushes.lock(),
            layers,
        }
    }

    fn arm_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let coordinator = Arc::clone(self);
        let interval = self.config.flush_interval;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            // Release our own handle before flushing so the flush path does
            // not abort the task that is running it.
            coordinator.timer.lock().take();
            if let Err(err) = coordinator.flush().await {
                warn!(error = %err, "timed flush failed");
            }
        }));
    }

    /// Drain the queue and write the batch through the layers in priority
    /// order. Only one flush runs at a time; enqueues during a flush land
    /// in the next one.
    #[instrument(skip(self), err)]
    pub async fn flush(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        let _gate = self.flush_gate.lock().await;

        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }

        let batch: Vec<Message> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }
        *self.flushes.lock() += 1;
        debug!(batch = batch.len(), "flushing");

        for layer in &self.layers {
            if layer.priority() == 1 {
                self.write_critical(layer, &batch).await?;
            } else if let Err(err) = layer.write(&batch).await {
                warn!(layer = layer.name(), error = %err, "non-critical layer failed; continuing");
                self.record_failure(layer.name(), &err);
            } else {
                self.record_success(layer.name(), batch.len());
            }
        }
        Ok(())
    }

    async fn write_critical(
        self: &Arc<Self>,
        layer: &Arc<dyn StorageLayer>,
        batch: &[Message],
    ) -> Result<(), CoordinatorError> {
        let mut backoff = self.config.retry_backoff;
        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            match layer.write(batch).await {
                Ok(()) => {
                    self.record_success(layer.name(), batch.len());
                    return Ok(());
                }
                Err(err) => {
                    self.record_failure(layer.name(), &err);
                    warn!(layer = layer.name(), attempt, error = %err, "critical layer write failed");
                    if attempt == attempts {
                        // Requeue ahead of anything enqueued meanwhile.
                        let mut queue = self.queue.lock();
                        for message in batch.iter().rev() {
                            queue.push_front(message.clone());
                        }
                        return Err(CoordinatorError::Persistence {
                            layer: layer.name(),
                            attempts,
                            message: err.message,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.checked_mul(2).unwrap_or(backoff);
                }
            }
        }
        unreachable!("retry loop always returns");
    }

    fn record_success(&self, name: &'static str, count: usize) {
        let mut metrics = self.metrics.lock();
        if let Some(entry) = metrics.get_mut(name) {
            entry.writes += count as u64;
        }
    }

    fn record_failure(&self, name: &'static str, err: &LayerError) {
        let mut metrics = self.metrics.lock();
        if let Some(entry) = metrics.get_mut(name) {
            entry.failures += 1;
            entry.last_error = Some(err.message.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in layers
// ---------------------------------------------------------------------------

/// Priority 1: the durable per-session log.
pub struct DurableLogLayer {
    log: Arc<dyn DurableLog>,
}

impl DurableLogLayer {
    #[must_use]
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl StorageLayer for DurableLogLayer {
    fn name(&self) -> &'static str {
        "durable_log"
    }

    fn priority(&self) -> u8 {
        1
    }

    async fn write(&self, batch: &[Message]) -> Result<(), LayerError> {
        // Group per session to keep the trait call-shape simple.
        for message in batch {
            let record = LogRecord {
                role: message.role,
                content: message.content(),
                timestamp: message.timestamp,
            };
            self.log
                .append(&message.session_id, &[record])
                .await
                .map_err(|e| LayerError::new(e.to_string()))?;
        }
        Ok(())
    }
}

/// Priority 2: the relational archive.
pub struct ArchiveLayer {
    archive: Arc<dyn ArchiveStore>,
}

impl ArchiveLayer {
    #[must_use]
    pub fn new(archive: Arc<dyn ArchiveStore>) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl StorageLayer for ArchiveLayer {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn priority(&self) -> u8 {
        2
    }

    async fn write(&self, batch: &[Message]) -> Result<(), LayerError> {
        let rows: Vec<ArchivedMessage> = batch.iter().map(ArchivedMessage::from).collect();
        self.archive
            .append_messages(&rows)
            .await
            .map(|_| ())
            .map_err(|e| LayerError::new(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::archive::InMemoryArchive;
    use crate::storage::log::InMemoryDurableLog;
    use std::sync::atomic::AtomicU32;

    struct FlakyLayer {
        name: &'static str,
        priority: u8,
        failures_left: AtomicU32,
        written: ParkingMutex<Vec<String>>,
    }

    impl FlakyLayer {
        fn new(name: &'static str, priority: u8, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                priority,
                failures_left: AtomicU32::new(failures),
                written: ParkingMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StorageLayer for FlakyLayer {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        async fn write(&self, batch: &[Message]) -> Result<(), LayerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(LayerError::new("induced failure"));
            }
            let mut written = self.written.lock();
            for message in batch {
                written.push(message.content());
            }
            Ok(())
        }
    }

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            batch_size: 3,
            flush_interval: std::time::Duration::from_millis(20),
            max_retries: 3,
            retry_backoff: std::time::Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn batch_threshold_triggers_flush() {
        let layer = FlakyLayer::new("p1", 1, 0);
        let coordinator =
            StorageCoordinator::new(vec![layer.clone() as Arc<dyn StorageLayer>], fast_config());
        for i in 0..3 {
            coordinator
                .save_message(Message::user("s1", &format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(layer.written.lock().len(), 3);
    }

    #[tokio::test]
    async fn timer_flushes_a_partial_batch() {
        let layer = FlakyLayer::new("p1", 1, 0);
        let coordinator =
            StorageCoordinator::new(vec![layer.clone() as Arc<dyn StorageLayer>], fast_config());
        coordinator
            .save_message(Message::user("s1", "lonely"))
            .await
            .unwrap();
        assert!(layer.written.lock().is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(layer.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn critical_layer_retries_then_succeeds() {
        let layer = FlakyLayer::new("p1", 1, 2);
        let coordinator =
            StorageCoordinator::new(vec![layer.clone() as Arc<dyn StorageLayer>], fast_config());
        for i in 0..3 {
            coordinator
                .save_message(Message::user("s1", &format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(layer.written.lock().len(), 3);
        let metrics = coordinator.metrics();
        let (_, p1) = &metrics.layers[0];
        assert_eq!(p1.failures, 2);
    }

    #[tokio::test]
    async fn critical_exhaustion_requeues_in_order() {
        let layer = FlakyLayer::new("p1", 1, 10);
        let coordinator =
            StorageCoordinator::new(vec![layer.clone() as Arc<dyn StorageLayer>], fast_config());
        coordinator
            .save_message(Message::user("s1", "first"))
            .await
            .unwrap();
        coordinator
            .save_message(Message::user("s1", "second"))
            .await
            .unwrap();
        let err = coordinator
            .save_message(Message::user("s1", "third"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Persistence { .. }));
        // Queue preserved the original order for the next flush.
        let queued: Vec<String> = coordinator
            .queue
            .lock()
            .iter()
            .map(|m| m.content())
            .collect();
        assert_eq!(queued, vec!["first", "second", "third"]);
        // Let the layer recover; the requeued batch lands intact.
        layer.failures_left.store(0, Ordering::SeqCst);
        coordinator.sync().await.unwrap();
        assert_eq!(
            *layer.written.lock(),
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn non_critical_failures_do_not_propagate() {
        let p1 = FlakyLayer::new("p1", 1, 0);
        let p3 = FlakyLayer::new("p3", 3, 100);
        let coordinator = StorageCoordinator::new(
            vec![
                p3.clone() as Arc<dyn StorageLayer>,
                p1.clone() as Arc<dyn StorageLayer>,
            ],
            fast_config(),
        );
        for i in 0..3 {
            coordinator
                .save_message(Message::user("s1", &format!("m{i}")))
                .await
                .unwrap();
        }
        assert_eq!(p1.written.lock().len(), 3);
        let metrics = coordinator.metrics();
        let memory_metrics = metrics
            .layers
            .iter()
            .find(|(name, _)| name == "p3")
            .map(|(_, m)| m.clone())
            .unwrap();
        assert_eq!(memory_metrics.failures, 1);
        assert!(memory_metrics.last_error.is_some());
    }

    #[tokio::test]
    async fn built_in_layers_write_through() {
        let log = Arc::new(InMemoryDurableLog::new());
        let archive = Arc::new(InMemoryArchive::new());
        let coordinator = StorageCoordinator::new(
            vec![
                Arc::new(DurableLogLayer::new(log.clone())) as Arc<dyn StorageLayer>,
                Arc::new(ArchiveLayer::new(archive.clone())) as Arc<dyn StorageLayer>,
            ],
            fast_config(),
        );
        coordinator
            .save_message(Message::user("s1", "hello"))
            .await
            .unwrap();
        coordinator.sync().await.unwrap();
        assert_eq!(log.replay("s1", 10).await.unwrap().len(), 1);
        assert_eq!(archive.messages("s1").await.unwrap().len(), 1);
    }
}
