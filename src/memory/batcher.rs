//! Embedding batcher: coalesces embedding requests into provider batches.
//!
//! Requests with priority > 5 bypass batching and hit the gateway
//! directly. Everything else lands in one shared queue; a 100 ms linger
//! timer or reaching the batch size triggers a single `embed_batch` call
//! whose results resolve all queued callers in input order.

use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::MemoryConfig;
use crate::gateway::{GatewayError, ModelGateway};

struct Pending {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>, GatewayError>>,
}

pub struct EmbeddingBatcher {
    gateway: Arc<ModelGateway>,
    queue: ParkingMutex<Vec<Pending>>,
    timer: ParkingMutex<Option<JoinHandle<()>>>,
    batch_size: usize,
    linger: std::time::Duration,
}

impl EmbeddingBatcher {
    #[must_use]
    pub fn new(gateway: Arc<ModelGateway>, config: &MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            queue: ParkingMutex::new(Vec::new()),
            timer: ParkingMutex::new(None),
            batch_size: config.batch_size.max(1),
            linger: config.batch_linger,
        })
    }

    /// Embed one text. Priority > 5 bypasses the queue.
    pub async fn embed(self: &Arc<Self>, text: String, priority: u8) -> Result<Vec<f32>, GatewayError> {
        if priority > 5 {
            return self.gateway.embed_text(&text).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let flush_now = {
            let mut queue = self.queue.lock();
            queue.push(Pending {
                text,
                reply: reply_tx,
            });
            queue.len() >= self.batch_size
        };

        if flush_now {
            self.drain().await;
        } else {
            self.arm_timer();
        }

        reply_rx.await.unwrap_or_else(|_| {
            Err(GatewayError::Provider {
                message: "embedding batch dropped".to_string(),
            })
        })
    }

    fn arm_timer(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let batcher = Arc::clone(self);
        let linger = self.linger;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            batcher.timer.lock().take();
            batcher.drain().await;
        }));
    }

    /// Run one batch call and distribute results in input order.
    async fn drain(self: &Arc<Self>) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
        let pending: Vec<Pending> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if pending.is_empty() {
            return;
        }
        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        match self.gateway.embed_batch(&texts).await {
            Ok(vectors) if vectors.len() == pending.len() => {
                for (entry, vector) in pending.into_iter().zip(vectors) {
                    let _ = entry.reply.send(Ok(vector));
                }
            }
            Ok(vectors) => {
                warn!(
                    sent = texts.len(),
                    received = vectors.len(),
                    "embedding batch count mismatch"
                );
                for entry in pending {
                    let _ = entry.reply.send(Err(GatewayError::Protocol {
                        message: "embedding batch count mismatch".to_string(),
                    }));
                }
            }
            Err(err) => {
                for entry in pending {
                    let _ = entry.reply.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::StaticModel;

    fn setup(batch_size: usize, linger_ms: u64) -> Arc<EmbeddingBatcher> {
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(StaticModel::default()),
            GatewayConfig::default(),
            "gen",
            "embed",
        ));
        let config = MemoryConfig {
            batch_size,
            batch_linger: std::time::Duration::from_millis(linger_ms),
            ..Default::default()
        };
        EmbeddingBatcher::new(gateway, &config)
    }

    #[tokio::test]
    async fn full_batch_resolves_everyone_in_order() {
        let batcher = setup(3, 10_000);
        let (a, b, c) = tokio::join!(
            batcher.embed("alpha".into(), 0),
            batcher.embed("beta".into(), 0),
            batcher.embed("gamma".into(), 0),
        );
        let direct = batcher.gateway.embed_text("alpha").await.unwrap();
        assert_eq!(a.unwrap(), direct);
        assert!(b.is_ok());
        assert!(c.is_ok());
    }

    #[tokio::test]
    async fn linger_timer_flushes_a_partial_batch() {
        let batcher = setup(16, 20);
        let vector = batcher.embed("solo".into(), 0).await.unwrap();
        assert!(!vector.is_empty());
    }

    #[tokio::test]
    async fn high_priority_bypasses_the_queue() {
        let batcher = setup(16, 60_000);
        // Would hang until the (very long) linger if it were queued.
        let vector = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            batcher.embed("urgent".into(), 9),
        )
        .await
        .expect("bypass must not wait for the linger timer")
        .unwrap();
        assert!(!vector.is_empty());
    }

    #[tokio::test]
    async fn batched_result_matches_single_call() {
        let batcher = setup(2, 10_000);
        let (a, b) = tokio::join!(
            batcher.embed("one".into(), 0),
            batcher.embed("two".into(), 0),
        );
        assert_eq!(a.unwrap(), batcher.gateway.embed_text("one").await.unwrap());
        assert_eq!(b.unwrap(), batcher.gateway.embed_text("two").await.unwrap());
    }
}
