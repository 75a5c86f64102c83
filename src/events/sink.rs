use std::any::type_name;
use std::io::{self, Result as IoResult, Stdout, Write};
use std::sync::Arc;

use parking_lot::Mutex as ParkingMutex;

use super::event::AgentEvent;
use crate::telemetry::{PlainFormatter, TelemetryFormatter};

/// Output target that consumes full [`AgentEvent`]s.
///
/// Sinks may block; the bus moves each one into its own drain task so a
/// slow sink never stalls emitters or other sinks. A sink error is logged
/// by the bus and otherwise swallowed.
pub trait EventSink: Send + Sync {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()>;

    /// Stable, human-friendly identifier for this sink instance.
    fn name(&self) -> String {
        type_name::<Self>().to_string()
    }
}

/// Stdout sink with pluggable formatting.
pub struct StdOutSink<F: TelemetryFormatter = PlainFormatter> {
    handle: Stdout,
    formatter: F,
}

impl Default for StdOutSink {
    fn default() -> Self {
        Self {
            handle: io::stdout(),
            formatter: PlainFormatter,
        }
    }
}

impl<F: TelemetryFormatter> StdOutSink<F> {
    pub fn with_formatter(formatter: F) -> Self {
        Self {
            handle: io::stdout(),
            formatter,
        }
    }
}

impl<F: TelemetryFormatter> EventSink for StdOutSink<F> {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        let rendered = self.formatter.render_event(event);
        self.handle.write_all(rendered.as_bytes())?;
        self.handle.flush()
    }
}

/// In-memory sink for tests and snapshots.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<ParkingMutex<Vec<AgentEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of everything captured so far.
    pub fn snapshot(&self) -> Vec<AgentEvent> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        self.entries.lock().push(event.clone());
        Ok(())
    }
}

/// Forwards events into a flume channel, typically one per connected client.
///
/// Send failures mean the receiver is gone; they are reported as errors so
/// the bus logs them, but the bus keeps the sink alive in case the channel
/// is rebuilt.
pub struct ChannelSink {
    sender: flume::Sender<AgentEvent>,
}

impl ChannelSink {
    pub fn new(sender: flume::Sender<AgentEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event channel disconnected"))
    }
}

/// JSON Lines sink for machine-readable structured logs.
pub struct JsonLinesSink {
    handle: Box<dyn Write + Send + Sync>,
}

impl JsonLinesSink {
    pub fn new(handle: Box<dyn Write + Send + Sync>) -> Self {
        Self { handle }
    }

    pub fn to_stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl EventSink for JsonLinesSink {
    fn handle(&mut self, event: &AgentEvent) -> IoResult<()> {
        let line = serde_json::to_string(&event.to_json_value())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.handle.write_all(line.as_bytes())?;
        self.handle.write_all(b"\n")?;
        self.handle.flush()
    }
}
