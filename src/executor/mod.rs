//! Session Executor: the single entry point for a user turn.
//!
//! One executor serves one session, and a per-session turn mutex makes it
//! the session's single writer: a second message arriving mid-turn is
//! rejected with [`ExecutorError::Busy`]. The turn pipeline persists the
//! user message, consults the cached-answer gate, builds memory context,
//! routes checkpoint feedback when a board is live, and otherwise decides
//! between orchestration and the direct reason-act loop.

mod history;
mod tools;

pub use history::format_history;
pub use tools::{
    MemorySearchTool, Tool, ToolError, ToolRegistry, ToolRun, WebFetchTool, format_observations,
    run_tool_calls,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::board::Task;
use crate::config::ExecutorConfig;
use crate::events::{AgentEvent, EventEmitter, StreamEvent, StreamEventKind, emit_or_log};
use crate::gateway::{ChatMessage, FileRef, GatewayError, GenerateOptions, ModelGateway};
use crate::memory::{CachedAnswer, MemoryError, MemoryManager};
use crate::message::Message;
use crate::orchestrator::{ExecutionOutcome, Orchestrator, OrchestratorError};
use crate::planner::{Approach, Planner};
use crate::storage::{ArchiveError, ArchiveStore, CoordinatorError, StorageCoordinator};

/// Checkpoint-approval keywords, matched case-insensitively.
const CONTINUE_WORDS: [&str; 6] = ["continue", "yes", "proceed", "go ahead", "keep going", "resume"];

/// Checkpoint-abandon keywords.
const CANCEL_WORDS: [&str; 5] = ["cancel", "stop", "abort", "abandon", "no thanks"];

/// What a turn produced.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    /// A full response was produced and persisted.
    Complete { response: String },
    /// The board suspended; nothing was persisted for the model side.
    Checkpoint { task: Task },
}

/// Executor failures, as surfaced to the transport.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    /// Another turn is in flight for this session.
    #[error("busy")]
    #[diagnostic(
        code(taskweft::executor::busy),
        help("The session processes one turn at a time; retry after the current turn.")
    )]
    Busy,

    /// The board failed definitively this turn.
    #[error("task execution failed: {message}")]
    #[diagnostic(code(taskweft::executor::board_failed))]
    BoardFailed { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Archive(#[from] ArchiveError),
}

pub struct SessionExecutor {
    session_id: String,
    gateway: Arc<ModelGateway>,
    memory: Arc<MemoryManager>,
    coordinator: Arc<StorageCoordinator>,
    archive: Arc<dyn ArchiveStore>,
    orchestrator: Arc<Orchestrator>,
    planner: Arc<Planner>,
    tools: Arc<ToolRegistry>,
    emitter: Arc<dyn EventEmitter>,
    config: ExecutorConfig,
    turn_gate: tokio::sync::Mutex<()>,
    responses_since_rollup: AtomicU32,
}

impl SessionExecutor {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session_id: &str,
        gateway: Arc<ModelGateway>,
        memory: Arc<MemoryManager>,
        coordinator: Arc<StorageCoordinator>,
        archive: Arc<dyn ArchiveStore>,
        orchestrator: Arc<Orchestrator>,
        planner: Arc<Planner>,
        tools: Arc<ToolRegistry>,
        emitter: Arc<dyn EventEmitter>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.to_string(),
            gateway,
            memory,
            coordinator,
            archive,
            orchestrator,
            planner,
            tools,
            emitter,
            config,
            turn_gate: tokio::sync::Mutex::new(()),
            responses_since_rollup: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    fn stream(&self, kind: StreamEventKind) {
        emit_or_log(
            self.emitter.as_ref(),
            AgentEvent::Stream(StreamEvent::new(&self.session_id, kind)),
        );
    }

    /// Process one user turn end to end.
    ///
    /// Exactly one of three things reaches the client: a chunk stream
    /// ending in `complete`, a `checkpoint`, or an `error` (via the Err
    /// path). A `Complete` return guarantees the model message was handed
    /// to the coordinator.
    #[instrument(skip_all, fields(session = %self.session_id))]
    pub async fn process_message(
        &self,
        content: &str,
        files: Vec<FileRef>,
    ) -> Result<TurnOutcome, ExecutorError> {
        let _turn = self.turn_gate.try_lock().map_err(|_| ExecutorError::Busy)?;
        self.stream(StreamEventKind::Status {
            message: "Thinking...".to_string(),
        });

        // 1. The user message is persisted before anything can fail.
        self.coordinator
            .save_message(Message::user(&self.session_id, content))
            .await?;

        // 2. Cached-answer gate.
        if files.is_empty() {
            match self.memory.lookup_cached_answer(content).await {
                Ok(CachedAnswer::Hit { answer }) => {
                    self.replay_cached(&answer).await;
                    return self.finish_turn(answer).await;
                }
                Ok(CachedAnswer::Miss) => {}
                Err(err) => warn!(error = %err, "cached-answer lookup failed; continuing"),
            }
        }

        // 3. Memory context. A memory failure degrades, never aborts.
        let context = match self.memory.build_context(content).await {
            Ok(built) => built.context,
            Err(err) => {
                warn!(error = %err, "context assembly failed");
                crate::memory::NO_CONTEXT_SENTINEL.to_string()
            }
        };

        // 4. A live board interprets the message as checkpoint feedback.
        if self.orchestrator.has_active_board().await? {
            return self.handle_board_feedback(content).await;
        }

        // 5. Complexity triage; the executor applies its own threshold.
        let assessment = self.planner.assess(content).await;
        let complex = assessment.is_complex
            && assessment.suggested_approach == Approach::Planned
            && assessment.estimated_tasks.unwrap_or(0) >= 3;
        debug!(
            complex,
            reason = %assessment.reason,
            "complexity triage"
        );

        if complex {
            // 6. Orchestrated path.
            self.stream(StreamEventKind::Status {
                message: "Breaking this into a plan...".to_string(),
            });
            self.orchestrator
                .create_plan(content, content, &context)
                .await?;
            return self.drive_board().await;
        }

        // 7. Direct reason-act loop.
        let response = self.direct_loop(content, &context, files).await?;
        self.finish_turn(response).await
    }

    /// Route checkpoint feedback by keyword; anything ambiguous gets a
    /// disambiguation reply instead of a guess.
    async fn handle_board_feedback(&self, content: &str) -> Result<TurnOutcome, ExecutorError> {
        if wants_continue(content) {
            let outcome = self
                .orchestrator
                .resume_from_checkpoint(content, true)
                .await;
            return match outcome {
                Ok(outcome) => self.conclude_board_outcome(outcome).await,
                // Not paused at a checkpoint: the board was mid-flight
                // (e.g. reconnect); just keep executing.
                Err(_) => self.drive_board().await,
            };
        }
        if wants_cancel(content) {
            self.orchestrator.abandon().await?;
            return self
                .finish_turn("Task abandoned. What would you like to do next?".to_string())
                .await;
        }
        let reply = "There's a task in progress. Say \"continue\" to keep going, \
                     \"cancel\" to abandon it, or cancel first if you want to start something new."
            .to_string();
        self.stream(StreamEventKind::Chunk {
            content: reply.clone(),
        });
        self.finish_turn(reply).await
    }

    async fn drive_board(&self) -> Result<TurnOutcome, ExecutorError> {
        let outcome = self.orchestrator.execute_until_checkpoint().await?;
        self.conclude_board_outcome(outcome).await
    }

    async fn conclude_board_outcome(
        &self,
        outcome: ExecutionOutcome,
    ) -> Result<TurnOutcome, ExecutorError> {
        match outcome {
            ExecutionOutcome::Checkpoint { task } => {
                // No partial model message is persisted at a checkpoint.
                Ok(TurnOutcome::Checkpoint { task })
            }
            ExecutionOutcome::Completed { final_output } => self.finish_turn(final_output).await,
            ExecutionOutcome::Failed { message } => {
                self.stream(StreamEventKind::Error {
                    error: message.clone(),
                });
                Err(ExecutorError::BoardFailed { message })
            }
        }
    }

    /// Replay a cached answer as artificial word-by-word chunks.
    async fn replay_cached(&self, answer: &str) {
        let words: Vec<&str> = answer.split(' ').collect();
        let last = words.len().saturating_sub(1);
        for (i, word) in words.iter().enumerate() {
            let chunk = if i == last {
                (*word).to_string()
            } else {
                format!("{word} ")
            };
            self.stream(StreamEventKind::Chunk { content: chunk });
            tokio::time::sleep(self.config.cached_word_delay).await;
        }
    }

    /// The direct reason-act loop: stream a reply, execute any tool calls
    /// in parallel, feed observations back, repeat within the turn budget.
    async fn direct_loop(
        &self,
        content: &str,
        context: &str,
        files: Vec<FileRef>,
    ) -> Result<String, ExecutorError> {
        let system = self.system_prompt(context, !files.is_empty());
        let mut transcript = vec![ChatMessage::system(system)];
        transcript.extend(self.recent_history(content).await);

        let mut last_text = String::new();
        for turn in 1..=self.config.max_turns {
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
            let emitter = Arc::clone(&self.emitter);
            let session_id = self.session_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    emit_or_log(
                        emitter.as_ref(),
                        AgentEvent::Stream(StreamEvent::chunk(&session_id, chunk)),
                    );
                }
            });

            let mut options = GenerateOptions::streaming(self.gateway.generation_model());
            options.attachments = if turn == 1 { files.clone() } else { Vec::new() };
            let generated = self
                .gateway
                .generate_with_tools(
                    transcript.clone(),
                    self.tools.definitions(),
                    options,
                    Some(chunk_tx),
                )
                .await;
            let _ = forwarder.await;
            let generated = generated?;
            last_text = generated.text.clone();

            if generated.tool_calls.is_empty() {
                return Ok(generated.text);
            }

            let names: Vec<String> = generated
                .tool_calls
                .iter()
                .map(|call| call.name.clone())
                .collect();
            self.stream(StreamEventKind::ToolUse { tools: names });
            let runs = run_tool_calls(
                &self.tools,
                &generated.tool_calls,
                self.config.tool_deadline,
            )
            .await;

            let mut assistant = ChatMessage::assistant(generated.text.clone());
            assistant.tool_calls = generated.tool_calls.clone();
            transcript.push(assistant);
            transcript.push(ChatMessage::user(format_observations(&runs)));
        }
        warn!("direct loop exhausted its turn budget");
        Ok(if last_text.is_empty() {
            "I wasn't able to finish that within the allotted steps.".to_string()
        } else {
            last_text
        })
    }

    fn system_prompt(&self, context: &str, has_files: bool) -> String {
        let mut prompt = String::from(
            "You are a capable assistant with persistent memory of this session.\n",
        );
        prompt.push_str("\n## Relevant memory\n");
        prompt.push_str(context);
        prompt.push('\n');
        if !self.tools.is_empty() {
            prompt.push_str("\n## Tools\nYou may call these tools when they genuinely help:\n");
            for name in self.tools.names() {
                prompt.push_str(&format!("- {name}\n"));
            }
        }
        if has_files {
            prompt.push_str("\nThe user attached files to this message; use them.\n");
        }
        prompt
    }

    /// History from the archive, with the in-flight user message appended
    /// when the batched fan-out has not landed it yet.
    async fn recent_history(&self, current: &str) -> Vec<ChatMessage> {
        let archived = match self.archive.messages(&self.session_id).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "history read failed; starting from the current message");
                Vec::new()
            }
        };
        let mut history = format_history(&archived, self.config.max_history_messages);
        let already_last = history
            .last()
            .is_some_and(|m| m.role == crate::gateway::ChatRole::User && m.content.ends_with(current));
        if !already_last {
            history.push(ChatMessage::user(current.to_string()));
        }
        history
    }

    /// Persist the model reply, emit `complete`, and advance the rollup
    /// cadence.
    async fn finish_turn(&self, response: String) -> Result<TurnOutcome, ExecutorError> {
        let response = self.persist_reply(response).await?;
        Ok(TurnOutcome::Complete { response })
    }

    /// Persist and announce a response produced outside a normal message
    /// turn: the `checkpoint_response` resume path.
    pub async fn complete_resumed_board(
        &self,
        final_output: String,
    ) -> Result<String, ExecutorError> {
        self.persist_reply(final_output).await
    }

    async fn persist_reply(&self, response: String) -> Result<String, ExecutorError> {
        self.coordinator
            .save_message(Message::model(&self.session_id, &response))
            .await?;
        self.stream(StreamEventKind::Complete {
            response: response.clone(),
        });
        self.bump_rollup_counter().await;
        Ok(response)
    }

    /// Every `rollup_interval` model responses, summarise the recent
    /// window into a long-term rollup. Failures log and move on.
    async fn bump_rollup_counter(&self) {
        let count = self.responses_since_rollup.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.config.rollup_interval {
            return;
        }
        self.responses_since_rollup.store(0, Ordering::SeqCst);
        if let Err(err) = self.coordinator.sync().await {
            warn!(error = %err, "pre-rollup flush failed");
            return;
        }
        let messages = match self.archive.messages(&self.session_id).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "rollup read failed");
                return;
            }
        };
        let window: Vec<Message> = messages
            .iter()
            .rev()
            .take(self.config.rollup_interval as usize)
            .rev()
            .map(|row| Message::text(&row.session_id, row.role, &row.content))
            .collect();
        match self.memory.rollup_window(&window).await {
            Ok(Some(_)) => debug!("long-term rollup written"),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "rollup failed"),
        }
    }
}

/// Case-insensitive approval match on the checkpoint keyword set.
fn wants_continue(content: &str) -> bool {
    let lowered = content.trim().to_lowercase();
    CONTINUE_WORDS.iter().any(|word| lowered.contains(word))
}

/// Case-insensitive abandon match.
fn wants_cancel(content: &str) -> bool {
    let lowered = content.trim().to_lowercase();
    CANCEL_WORDS.iter().any(|word| lowered.contains(word))
}
