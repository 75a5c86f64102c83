use std::fmt;
use thiserror::Error;

use super::event::AgentEvent;

/// Cloneable handle components hold to publish events without owning the bus.
pub trait EventEmitter: Send + Sync + fmt::Debug {
    /// Emit an event synchronously without blocking.
    fn emit(&self, event: AgentEvent) -> Result<(), EmitterError>;
}

/// Errors that can occur when emitting an event.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub closed")]
    Closed,
    #[error("event lag exceeded buffer; dropped {0} messages")]
    Lagged(usize),
    #[error("event emission failed: {0}")]
    Other(String),
}

impl EmitterError {
    pub fn other(error: impl Into<String>) -> Self {
        Self::Other(error.into())
    }
}

/// Emitter that discards everything; the default for components constructed
/// outside a server (tests, one-shot tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: AgentEvent) -> Result<(), EmitterError> {
        Ok(())
    }
}
