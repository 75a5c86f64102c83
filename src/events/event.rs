use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

/// An observable event produced while serving a session.
///
/// Three families share one bus so a single subscriber (for example a
/// WebSocket connection) sees everything about its session in emission
/// order:
///
/// - [`BoardEvent`]: task-board state machine progress.
/// - [`StreamEvent`]: the chunk/complete/error surface a chat client renders.
/// - [`DiagnosticEvent`]: free-form operational telemetry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum AgentEvent {
    Board(BoardEvent),
    Stream(StreamEvent),
    Diagnostic(DiagnosticEvent),
}

impl AgentEvent {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        AgentEvent::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// The session this event belongs to, when it has one.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentEvent::Board(event) => Some(&event.session_id),
            AgentEvent::Stream(event) => Some(&event.session_id),
            AgentEvent::Diagnostic(_) => None,
        }
    }

    /// Normalised JSON form used by the JSONL sink and the admin surface.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        match self {
            AgentEvent::Board(event) => json!({
                "family": "board",
                "sessionId": event.session_id,
                "boardId": event.board_id,
                "timestamp": event.timestamp.to_rfc3339(),
                "event": event.kind,
            }),
            AgentEvent::Stream(event) => json!({
                "family": "stream",
                "sessionId": event.session_id,
                "timestamp": event.timestamp.to_rfc3339(),
                "event": event.kind,
            }),
            AgentEvent::Diagnostic(event) => json!({
                "family": "diagnostic",
                "scope": event.scope,
                "message": event.message,
            }),
        }
    }
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::Board(event) => {
                write!(f, "[{}] {}", event.session_id, event.kind.label())
            }
            AgentEvent::Stream(event) => {
                write!(f, "[{}] {}", event.session_id, event.kind.label())
            }
            AgentEvent::Diagnostic(event) => write!(f, "{}: {}", event.scope, event.message),
        }
    }
}

/// Progress of one task board.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoardEvent {
    pub session_id: String,
    pub board_id: String,
    pub kind: BoardEventKind,
    pub timestamp: DateTime<Utc>,
}

impl BoardEvent {
    #[must_use]
    pub fn new(session_id: &str, board_id: &str, kind: BoardEventKind) -> Self {
        Self {
            session_id: session_id.to_string(),
            board_id: board_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// The closed set of board transitions worth announcing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEventKind {
    PlanCreated {
        task_count: usize,
        checkpoint_count: usize,
        summary: String,
    },
    TaskStarted {
        task_id: String,
        name: String,
    },
    TaskProgress {
        task_id: String,
        message: String,
    },
    TaskCompleted {
        task_id: String,
        name: String,
        preview: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
        will_retry: bool,
    },
    CheckpointReached {
        task_id: String,
        message: String,
    },
    CheckpointResumed {
        task_id: String,
        approved: bool,
    },
    ReplanTriggered {
        reason: String,
    },
    BoardCompleted {
        final_output: String,
    },
    BoardFailed {
        error: String,
    },
}

impl BoardEventKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            BoardEventKind::PlanCreated { .. } => "plan_created",
            BoardEventKind::TaskStarted { .. } => "task_started",
            BoardEventKind::TaskProgress { .. } => "task_progress",
            BoardEventKind::TaskCompleted { .. } => "task_completed",
            BoardEventKind::TaskFailed { .. } => "task_failed",
            BoardEventKind::CheckpointReached { .. } => "checkpoint_reached",
            BoardEventKind::CheckpointResumed { .. } => "checkpoint_resumed",
            BoardEventKind::ReplanTriggered { .. } => "replan_triggered",
            BoardEventKind::BoardCompleted { .. } => "board_completed",
            BoardEventKind::BoardFailed { .. } => "board_failed",
        }
    }
}

/// Client-facing stream of one turn.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub session_id: String,
    pub kind: StreamEventKind,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    #[must_use]
    pub fn new(session_id: &str, kind: StreamEventKind) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn chunk(session_id: &str, content: impl Into<String>) -> Self {
        Self::new(
            session_id,
            StreamEventKind::Chunk {
                content: content.into(),
            },
        )
    }

    pub fn status(session_id: &str, message: impl Into<String>) -> Self {
        Self::new(
            session_id,
            StreamEventKind::Status {
                message: message.into(),
            },
        )
    }

    pub fn complete(session_id: &str, response: impl Into<String>) -> Self {
        Self::new(
            session_id,
            StreamEventKind::Complete {
                response: response.into(),
            },
        )
    }

    pub fn error(session_id: &str, error: impl Into<String>) -> Self {
        Self::new(
            session_id,
            StreamEventKind::Error {
                error: error.into(),
            },
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    Status { message: String },
    Chunk { content: String },
    ToolUse { tools: Vec<String> },
    Complete { response: String },
    Error { error: String },
}

impl StreamEventKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            StreamEventKind::Status { .. } => "status",
            StreamEventKind::Chunk { .. } => "chunk",
            StreamEventKind::ToolUse { .. } => "tool_use",
            StreamEventKind::Complete { .. } => "complete",
            StreamEventKind::Error { .. } => "error",
        }
    }
}

/// Operational telemetry with no client contract.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}
