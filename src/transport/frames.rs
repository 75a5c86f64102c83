//! Wire frames for the client ⇄ server streaming channel.
//!
//! One JSON object per frame, discriminated by `type`. Unknown types and
//! malformed payloads fail serde and are answered with an `error` frame;
//! the channel stays open.

use serde::{Deserialize, Serialize};

use crate::board::Task;
use crate::events::{AgentEvent, BoardEventKind, StreamEventKind};
use crate::gateway::FileRef;
use crate::orchestrator::SessionContext;

/// Client → server frames.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage {
        content: String,
        #[serde(default)]
        files: Vec<FileRef>,
    },
    CheckpointResponse {
        feedback: String,
        #[serde(default = "default_true")]
        approved: bool,
    },
    AbandonTask,
    GetStatus,
}

fn default_true() -> bool {
    true
}

/// Server → client frames.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Status {
        message: String,
    },
    Chunk {
        content: String,
    },
    ToolUse {
        tools: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    PlanCreated {
        task_count: usize,
        checkpoints: usize,
        summary: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskProgress {
        message: String,
        task_id: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        task_name: String,
        preview: String,
    },
    #[serde(rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        error: String,
        will_retry: bool,
    },
    Checkpoint {
        message: String,
        task: Box<Task>,
    },
    Complete {
        response: String,
    },
    Error {
        error: String,
    },
    SessionContext {
        context: SessionContext,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
        }
    }

    pub fn checkpoint(task: Task) -> Self {
        ServerFrame::Checkpoint {
            message: task.checkpoint_message.clone().unwrap_or_default(),
            task: Box::new(task),
        }
    }

    /// Map a bus event to the frame a connected client should see.
    ///
    /// Terminal frames (`complete`, `checkpoint`, `error`) are produced by
    /// the request handler from the turn outcome, not from events, so each
    /// turn ends in exactly one of them.
    #[must_use]
    pub fn from_event(event: &AgentEvent) -> Option<Self> {
        match event {
            AgentEvent::Stream(stream) => match &stream.kind {
                StreamEventKind::Status { message } => Some(ServerFrame::Status {
                    message: message.clone(),
                }),
                StreamEventKind::Chunk { content } => Some(ServerFrame::Chunk {
                    content: content.clone(),
                }),
                StreamEventKind::ToolUse { tools } => Some(ServerFrame::ToolUse {
                    tools: tools.clone(),
                }),
                StreamEventKind::Complete { .. } | StreamEventKind::Error { .. } => None,
            },
            AgentEvent::Board(board) => match &board.kind {
                BoardEventKind::PlanCreated {
                    task_count,
                    checkpoint_count,
                    summary,
                } => Some(ServerFrame::PlanCreated {
                    task_count: *task_count,
                    checkpoints: *checkpoint_count,
                    summary: summary.clone(),
                }),
                BoardEventKind::TaskStarted { task_id, name } => Some(ServerFrame::TaskProgress {
                    message: format!("Starting: {name}"),
                    task_id: task_id.clone(),
                }),
                BoardEventKind::TaskProgress { task_id, message } => {
                    Some(ServerFrame::TaskProgress {
                        message: message.clone(),
                        task_id: task_id.clone(),
                    })
                }
                BoardEventKind::TaskCompleted {
                    task_id,
                    name,
                    preview,
                } => Some(ServerFrame::TaskCompleted {
                    task_id: task_id.clone(),
                    task_name: name.clone(),
                    preview: preview.clone(),
                }),
                BoardEventKind::TaskFailed {
                    task_id,
                    error,
                    will_retry,
                } => Some(ServerFrame::TaskFailed {
                    task_id: task_id.clone(),
                    error: error.clone(),
                    will_retry: *will_retry,
                }),
                BoardEventKind::ReplanTriggered { reason } => Some(ServerFrame::Status {
                    message: format!("Revising the plan: {reason}"),
                }),
                BoardEventKind::CheckpointReached { .. }
                | BoardEventKind::CheckpointResumed { .. }
                | BoardEventKind::BoardCompleted { .. }
                | BoardEventKind::BoardFailed { .. } => None,
            },
            AgentEvent::Diagnostic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::WorkerRole;
    use crate::events::{BoardEvent, StreamEvent};
    use serde_json::json;

    #[test]
    fn user_message_parses_with_and_without_files() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "user_message", "content": "hi"})).unwrap();
        assert_eq!(
            frame,
            ClientFrame::UserMessage {
                content: "hi".into(),
                files: vec![]
            }
        );
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "user_message",
            "content": "see attachment",
            "files": [{"data": "QUJD", "mimeType": "text/plain", "name": "a.txt"}]
        }))
        .unwrap();
        let ClientFrame::UserMessage { files, .. } = frame else {
            panic!("wrong variant");
        };
        assert_eq!(files[0].name, "a.txt");
    }

    #[test]
    fn checkpoint_response_defaults_to_approved() {
        let frame: ClientFrame = serde_json::from_value(
            json!({"type": "checkpoint_response", "feedback": "looks good"}),
        )
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::CheckpointResponse {
                feedback: "looks good".into(),
                approved: true
            }
        );
    }

    #[test]
    fn unknown_type_is_a_serde_error() {
        let result: Result<ClientFrame, _> =
            serde_json::from_value(json!({"type": "mystery", "content": "?"}));
        assert!(result.is_err());
    }

    #[test]
    fn server_frames_use_camel_case_fields() {
        let frame = ServerFrame::TaskCompleted {
            task_id: "t1".into(),
            task_name: "research".into(),
            preview: "done".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "task_completed");
        assert!(value.get("taskId").is_some());
        assert!(value.get("taskName").is_some());

        let frame = ServerFrame::PlanCreated {
            task_count: 3,
            checkpoints: 1,
            summary: "s".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["taskCount"], 3);
        assert_eq!(value["checkpoints"], 1);
    }

    #[test]
    fn stream_events_map_to_frames() {
        let chunk = AgentEvent::Stream(StreamEvent::chunk("s1", "hel"));
        assert_eq!(
            ServerFrame::from_event(&chunk),
            Some(ServerFrame::Chunk {
                content: "hel".into()
            })
        );
        // Terminal stream events stay with the request handler.
        let complete = AgentEvent::Stream(StreamEvent::complete("s1", "done"));
        assert_eq!(ServerFrame::from_event(&complete), None);
    }

    #[test]
    fn board_events_map_to_progress_frames() {
        let event = AgentEvent::Board(BoardEvent::new(
            "s1",
            "b1",
            BoardEventKind::TaskFailed {
                task_id: "t2".into(),
                error: "boom".into(),
                will_retry: true,
            },
        ));
        let value = serde_json::to_value(ServerFrame::from_event(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "task_failed");
        assert_eq!(value["willRetry"], true);
    }

    #[test]
    fn checkpoint_frame_carries_message_and_task() {
        let mut task = Task::new("c1", "review", WorkerRole::Synthesizer);
        task.checkpoint_message = Some("Look at the draft?".into());
        let value = serde_json::to_value(ServerFrame::checkpoint(task)).unwrap();
        assert_eq!(value["type"], "checkpoint");
        assert_eq!(value["message"], "Look at the draft?");
        assert_eq!(value["task"]["id"], "c1");
    }
}
