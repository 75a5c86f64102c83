//! Typed event model and broadcast bus.
//!
//! Everything observable about a session (task-board transitions, the
//! chunk/complete stream a chat client renders, and operational
//! diagnostics) flows through one [`EventBus`] per session. Producers
//! hold [`EventEmitter`] handles; consumers either subscribe directly
//! ([`EventBus::subscribe`]) or attach an [`EventSink`], which the bus
//! moves into its own drain task.

mod bus;
mod emitter;
mod event;
mod hub;
mod sink;

pub use bus::{EventBus, emit_or_log};
pub use emitter::{EmitterError, EventEmitter, NullEmitter};
pub use event::{
    AgentEvent, BoardEvent, BoardEventKind, DiagnosticEvent, StreamEvent, StreamEventKind,
};
pub use hub::{EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
