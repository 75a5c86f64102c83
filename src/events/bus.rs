use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::emitter::EventEmitter;
use super::event::AgentEvent;
use super::hub::{EventHub, EventHubMetrics, EventStream};
use super::sink::{EventSink, StdOutSink};

const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Central broadcaster for everything observable about a session.
///
/// The orchestrator, executor, and worker publish through handles obtained
/// from [`EventBus::emitter`]; each attached [`EventSink`] is consumed by
/// its own drain task, so a slow sink never stalls emitters, other sinks,
/// or direct subscribers. One bus is built per session so a connected
/// client only ever sees its own traffic.
///
/// ```text
/// executor / orchestrator / worker
///     │ emitter.emit()
///     ▼
/// EventBus ── broadcast ──┬───────────┬───────────┐
///                         ▼           ▼           ▼
///                    StdOutSink  ChannelSink  MemorySink
/// ```
///
/// Attaching a sink starts draining immediately; there is no separate
/// start phase. Sink errors are logged and swallowed; event delivery must
/// never abort a turn.
pub struct EventBus {
    hub: Arc<EventHub>,
    drains: ParkingMutex<Vec<SinkDrain>>,
}

/// One running drain task pumping the hub into a sink it owns.
struct SinkDrain {
    label: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::stdout()
    }
}

impl EventBus {
    /// A bus with no sinks; subscribers can still stream directly.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(DEFAULT_BUFFER_CAPACITY),
            drains: ParkingMutex::new(Vec::new()),
        }
    }

    /// A bus draining to stdout, the server default.
    #[must_use]
    pub fn stdout() -> Self {
        let bus = Self::new();
        bus.attach(StdOutSink::default());
        bus
    }

    /// Attach a sink and start draining into it.
    pub fn attach<T: EventSink + 'static>(&self, sink: T) {
        self.attach_boxed(Box::new(sink));
    }

    /// `attach` for an already-boxed sink.
    ///
    /// The sink moves into its drain task; on shutdown the task flushes
    /// whatever the hub already buffered before it exits.
    pub fn attach_boxed(&self, mut sink: Box<dyn EventSink>) {
        let label = sink.name();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut events = self.hub.subscribe();
        let task_label = label.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            flush_buffered(sink.as_mut(), &task_label, &mut events);
                            break;
                        }
                    }
                    received = events.recv() => match received {
                        Ok(event) => deliver(sink.as_mut(), &task_label, &event),
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
        self.drains.lock().push(SinkDrain {
            label,
            stop_tx,
            task,
        });
    }

    /// Publisher handle; cheap to clone into components.
    pub fn emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    /// Stream events directly, bypassing sinks.
    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    pub fn metrics(&self) -> EventHubMetrics {
        self.hub.metrics()
    }

    /// Detach every sink, letting each flush buffered events first.
    pub async fn shutdown(&self) {
        let drains: Vec<SinkDrain> = self.drains.lock().drain(..).collect();
        for drain in drains {
            let _ = drain.stop_tx.send(true);
            if let Err(err) = drain.task.await {
                tracing::debug!(
                    target: "taskweft::events",
                    sink = %drain.label,
                    error = %err,
                    "drain task ended abnormally"
                );
            }
        }
    }

    /// Close the broadcast channel; subscribers and drains observe
    /// end-of-stream.
    pub fn close(&self) {
        self.hub.close();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        // Signal rather than abort, so a sink mid-write finishes its event.
        for drain in self.drains.lock().iter() {
            let _ = drain.stop_tx.send(true);
        }
    }
}

fn deliver(sink: &mut dyn EventSink, label: &str, event: &AgentEvent) {
    if let Err(err) = sink.handle(event) {
        tracing::warn!(
            target: "taskweft::events",
            sink = label,
            error = %err,
            "event sink error"
        );
    }
}

/// Hand any already-buffered events to the sink before it goes away.
fn flush_buffered(sink: &mut dyn EventSink, label: &str, events: &mut EventStream) {
    loop {
        match events.try_recv() {
            Ok(event) => deliver(sink, label, &event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Emit through an emitter, logging (never propagating) a closed-bus error.
///
/// Event delivery must not abort a turn; this is the one place that policy
/// is encoded.
pub fn emit_or_log(emitter: &dyn EventEmitter, event: AgentEvent) {
    if let Err(err) = emitter.emit(event) {
        tracing::debug!(target: "taskweft::events", error = %err, "event dropped");
    }
}
