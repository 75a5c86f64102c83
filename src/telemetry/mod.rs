//! Tracing initialisation and event rendering for human-facing sinks.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::events::AgentEvent;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta
pub const RESET_COLOR: &str = "\x1b[0m";

/// Install the global tracing subscriber.
///
/// Filter defaults to `taskweft=info` and is overridable through `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskweft=info,tower_http=warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(ErrorLayer::default())
        .try_init();
}

/// Renders events into terminal lines for a stdout sink.
pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &AgentEvent) -> String;
}

/// Single-line coloured rendering; the default formatter.
pub struct PlainFormatter;

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &AgentEvent) -> String {
        match event.session_id() {
            Some(session) => format!(
                "{CONTEXT_COLOR}{session}{RESET_COLOR} {LINE_COLOR}{event}{RESET_COLOR}\n"
            ),
            None => format!("{LINE_COLOR}{event}{RESET_COLOR}\n"),
        }
    }
}
