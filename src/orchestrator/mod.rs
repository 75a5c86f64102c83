//! Orchestrator: the task-board state machine.
//!
//! Owns at most one non-terminal [`TaskBoard`] per session. Drives the
//! planner and workers, persists the board after every transition, emits
//! progress events, suspends at checkpoints, and replans on definitive
//! task failure while preserving completed work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use miette::Diagnostic;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::board::{
    BoardError, BoardStatus, BoardStorage, Task, TaskBoard, TaskStatus, TaskType,
};
use crate::events::{AgentEvent, BoardEvent, BoardEventKind, EventEmitter, emit_or_log};
use crate::planner::{Plan, Planner, PlannerError, ReplanRequest};
use crate::storage::LogError;
use crate::worker::{Worker, WorkerContext};

/// How far a task-completion preview travels in events.
const PREVIEW_CHARS: usize = 200;

/// Result of driving the board.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    /// Suspended at a checkpoint; the client must respond to proceed.
    Checkpoint { task: Task },
    /// Every task finished; carries the synthesised final output.
    Completed { final_output: String },
    /// The board cannot make progress.
    Failed { message: String },
}

/// What the session looks like to a (re)connecting client.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub has_active_board: bool,
    pub suggested_action: SuggestedAction,
    pub greeting_message: String,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board: Option<BoardSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Resume,
    New,
    ReviewCompleted,
}

/// Compact board view for status payloads.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSummary {
    pub id: String,
    pub objective: String,
    pub status: BoardStatus,
    pub task_count: usize,
    pub completed_tasks: usize,
    pub current_task: Option<String>,
    pub total_checkpoints: usize,
    pub completed_checkpoints: usize,
}

impl BoardSummary {
    fn of(board: &TaskBoard) -> Self {
        Self {
            id: board.id.clone(),
            objective: board.objective.clone(),
            status: board.status,
            task_count: board.tasks.len(),
            completed_tasks: board.completed_count(),
            current_task: board.current_task().map(|t| t.name.clone()),
            total_checkpoints: board.total_checkpoints,
            completed_checkpoints: board.completed_checkpoints,
        }
    }
}

/// Orchestrator failures.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] LogError),
}

pub struct Orchestrator {
    session_id: String,
    planner: Arc<Planner>,
    worker: Arc<Worker>,
    storage: Arc<dyn BoardStorage>,
    emitter: Arc<dyn EventEmitter>,
    /// Working copy, held across a whole execution drive.
    board: tokio::sync::Mutex<Option<TaskBoard>>,
    /// Read-only mirror refreshed on every save, so status queries never
    /// wait behind a running worker.
    snapshot: RwLock<Option<TaskBoard>>,
    loaded: AtomicBool,
    auto_replan: bool,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        session_id: &str,
        planner: Arc<Planner>,
        worker: Arc<Worker>,
        storage: Arc<dyn BoardStorage>,
        emitter: Arc<dyn EventEmitter>,
        auto_replan: bool,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            planner,
            worker,
            storage,
            emitter,
            board: tokio::sync::Mutex::new(None),
            snapshot: RwLock::new(None),
            loaded: AtomicBool::new(false),
            auto_replan,
        }
    }

    fn emit(&self, board_id: &str, kind: BoardEventKind) {
        emit_or_log(
            self.emitter.as_ref(),
            AgentEvent::Board(BoardEvent::new(&self.session_id, board_id, kind)),
        );
    }

    async fn save_board(&self, board: &TaskBoard) -> Result<(), OrchestratorError> {
        self.storage.save(board).await?;
        *self.snapshot.write() = Some(board.clone());
        Ok(())
    }

    /// Load the board from storage on first access.
    async fn ensure_loaded(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<TaskBoard>>,
    ) -> Result<(), OrchestratorError> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if guard.is_none() {
            if let Some(board) = self.storage.load(&self.session_id).await? {
                board.validate_cursor()?;
                *self.snapshot.write() = Some(board.clone());
                **guard = Some(board);
            }
        }
        Ok(())
    }

    /// The latest persisted view of the board, if any.
    pub async fn board_snapshot(&self) -> Result<Option<TaskBoard>, OrchestratorError> {
        if !self.loaded.load(Ordering::SeqCst) {
            let mut guard = self.board.lock().await;
            self.ensure_loaded(&mut guard).await?;
        }
        Ok(self.snapshot.read().clone())
    }

    /// Whether a non-terminal board exists.
    pub async fn has_active_board(&self) -> Result<bool, OrchestratorError> {
        Ok(self
            .board_snapshot()
            .await?
            .is_some_and(|board| !board.status.is_terminal()))
    }

    /// Greeting and suggested action for a (re)connecting client.
    pub async fn session_context(&self) -> Result<SessionContext, OrchestratorError> {
        let Some(board) = self.board_snapshot().await? else {
            return Ok(SessionContext {
                has_active_board: false,
                suggested_action: SuggestedAction::New,
                greeting_message: "Hi! What would you like to work on?".to_string(),
                progress_percent: 0,
                board: None,
            });
        };
        let progress = board.progress_percent();
        let context = match board.status {
            BoardStatus::Paused => {
                let message = board
                    .current_task()
                    .and_then(|t| t.checkpoint_message.clone())
                    .unwrap_or_else(|| "A checkpoint is waiting for your review.".to_string());
                SessionContext {
                    has_active_board: true,
                    suggested_action: SuggestedAction::Resume,
                    greeting_message: format!(
                        "Welcome back — your task is {progress}% done and paused at a checkpoint: {message}"
                    ),
                    progress_percent: progress,
                    board: Some(BoardSummary::of(&board)),
                }
            }
            BoardStatus::Completed => SessionContext {
                has_active_board: false,
                suggested_action: SuggestedAction::ReviewCompleted,
                greeting_message: format!(
                    "Your last objective (\"{}\") is complete. Want to review it or start something new?",
                    board.objective
                ),
                progress_percent: 100,
                board: Some(BoardSummary::of(&board)),
            },
            BoardStatus::Executing | BoardStatus::Replanning | BoardStatus::Planning => {
                let current = board
                    .current_task()
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| "the final step".to_string());
                SessionContext {
                    has_active_board: true,
                    suggested_action: SuggestedAction::Resume,
                    greeting_message: format!(
                        "Welcome back — {progress}% done, currently on \"{current}\"."
                    ),
                    progress_percent: progress,
                    board: Some(BoardSummary::of(&board)),
                }
            }
            BoardStatus::Abandoned => SessionContext {
                has_active_board: false,
                suggested_action: SuggestedAction::New,
                greeting_message: "Your previous task was abandoned. What next?".to_string(),
                progress_percent: progress,
                board: Some(BoardSummary::of(&board)),
            },
        };
        Ok(context)
    }

    /// Plan `objective` into a fresh executing board.
    ///
    /// Enforces the one-non-terminal-board invariant before calling the
    /// planner.
    #[instrument(skip(self, context), fields(session = %self.session_id))]
    pub async fn create_plan(
        &self,
        objective: &str,
        user_query: &str,
        context: &str,
    ) -> Result<(), OrchestratorError> {
        let mut guard = self.board.lock().await;
        self.ensure_loaded(&mut guard).await?;
        if let Some(existing) = guard.as_ref() {
            if !existing.status.is_terminal() {
                return Err(BoardError::AlreadyActive {
                    board_id: existing.id.clone(),
                }
                .into());
            }
        }
        let plan = self.planner.create_plan(objective, user_query, context).await?;
        let board = self
            .planner
            .create_board(&self.session_id, objective, context, plan);
        board.validate_dependencies()?;
        self.save_board(&board).await?;
        self.emit(
            &board.id,
            BoardEventKind::PlanCreated {
                task_count: board.tasks.len(),
                checkpoint_count: board.total_checkpoints,
                summary: board.objective.clone(),
            },
        );
        *guard = Some(board);
        Ok(())
    }

    /// Drive the board until a checkpoint, completion, or failure.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn execute_until_checkpoint(&self) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut guard = self.board.lock().await;
        self.ensure_loaded(&mut guard).await?;
        self.drive(&mut guard).await
    }

    /// Resolve the pending checkpoint with user feedback and continue.
    #[instrument(skip(self, feedback), fields(session = %self.session_id, approved))]
    pub async fn resume_from_checkpoint(
        &self,
        feedback: &str,
        approved: bool,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut guard = self.board.lock().await;
        self.ensure_loaded(&mut guard).await?;
        {
            let board = guard.as_mut().ok_or(BoardError::NoActiveBoard)?;
            let valid = board.status == BoardStatus::Paused
                && board
                    .current_task()
                    .is_some_and(|t| t.task_type == TaskType::Checkpoint
                        && t.status == TaskStatus::Checkpoint);
            if !valid {
                return Err(BoardError::NoPendingCheckpoint.into());
            }
            let board_id = board.id.clone();
            let task_id;
            {
                let task = board
                    .current_task_mut()
                    .ok_or(BoardError::NoPendingCheckpoint)?;
                task.user_feedback = Some(feedback.to_string());
                task.complete(feedback.to_string())?;
                task_id = task.id.clone();
            }
            board.completed_checkpoints += 1;
            self.emit(
                &board_id,
                BoardEventKind::CheckpointResumed {
                    task_id: task_id.clone(),
                    approved,
                },
            );
            if approved {
                board.record_completion(&task_id, feedback);
                board.status = BoardStatus::Executing;
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
            } else {
                // Checkpoint counts as completed work; everything after it
                // is replanned around the user's objection.
                board.record_completion(&task_id, feedback);
                if let Err(err) = self.replan_in_place(board, feedback, Some(feedback)).await {
                    warn!(error = %err, "replanning after rejection failed");
                    board.status = BoardStatus::Paused;
                    let snapshot = board.clone();
                    self.save_board(&snapshot).await?;
                    return Ok(ExecutionOutcome::Failed {
                        message: "Replanning failed".to_string(),
                    });
                }
            }
        }
        self.drive(&mut guard).await
    }

    /// Abandon the current board; terminal, but kept for review.
    pub async fn abandon(&self) -> Result<bool, OrchestratorError> {
        let mut guard = self.board.lock().await;
        self.ensure_loaded(&mut guard).await?;
        let Some(board) = guard.as_mut() else {
            return Ok(false);
        };
        if board.status.is_terminal() {
            return Ok(false);
        }
        board.status = BoardStatus::Abandoned;
        board.touch();
        let board_id = board.id.clone();
        let snapshot = board.clone();
        self.save_board(&snapshot).await?;
        self.emit(
            &board_id,
            BoardEventKind::BoardFailed {
                error: "abandoned by user".to_string(),
            },
        );
        Ok(true)
    }

    /// The execution loop. Holds the board guard throughout; the session's
    /// single-writer contract means nothing else mutates meanwhile.
    async fn drive(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<TaskBoard>>,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let board = guard.as_mut().ok_or(BoardError::NoActiveBoard)?;
        loop {
            if board.current_idx >= board.tasks.len() {
                board.status = BoardStatus::Completed;
                board.completed_at = Some(chrono::Utc::now());
                board.touch();
                let final_output = synthesize_final_output(board);
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
                self.emit(
                    &board.id,
                    BoardEventKind::BoardCompleted {
                        final_output: final_output.clone(),
                    },
                );
                return Ok(ExecutionOutcome::Completed { final_output });
            }

            let board_id = board.id.clone();
            let (task_id, task_type) = {
                let task = &board.tasks[board.current_idx];
                (task.id.clone(), task.task_type)
            };

            if task_type == TaskType::Checkpoint {
                let checkpoint_task = {
                    let task = board
                        .current_task_mut()
                        .ok_or(BoardError::NoPendingCheckpoint)?;
                    task.reach_checkpoint()?;
                    task.clone()
                };
                board.status = BoardStatus::Paused;
                board.touch();
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
                self.emit(
                    &board_id,
                    BoardEventKind::CheckpointReached {
                        task_id: checkpoint_task.id.clone(),
                        message: checkpoint_task
                            .checkpoint_message
                            .clone()
                            .unwrap_or_default(),
                    },
                );
                return Ok(ExecutionOutcome::Checkpoint {
                    task: checkpoint_task,
                });
            }

            // Work or synthesis task.
            let task_name = board.tasks[board.current_idx].name.clone();
            self.emit(
                &board_id,
                BoardEventKind::TaskStarted {
                    task_id: task_id.clone(),
                    name: task_name.clone(),
                },
            );
            board
                .current_task_mut()
                .ok_or(BoardError::NoActiveBoard)?
                .begin()?;
            board.touch();
            let snapshot = board.clone();
            self.save_board(&snapshot).await?;

            let ctx = WorkerContext {
                session_id: self.session_id.clone(),
                board_id: board_id.clone(),
                emitter: Arc::clone(&self.emitter),
            };
            let task_clone = board.tasks[board.current_idx].clone();
            let globals = board.globals.clone();
            let mut outcome = self.worker.run(&task_clone, &globals, &ctx).await;

            // Retry-with-feedback until success or the budget runs out.
            while !outcome.success {
                let reason = outcome
                    .retry_reason
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string());
                let can_retry = outcome.needs_retry
                    && board.tasks[board.current_idx].can_retry();
                if !can_retry {
                    break;
                }
                board.current_task_mut().ok_or(BoardError::NoActiveBoard)?.mark_retry()?;
                self.emit(
                    &board_id,
                    BoardEventKind::TaskFailed {
                        task_id: task_id.clone(),
                        error: reason.clone(),
                        will_retry: true,
                    },
                );
                board.current_task_mut().ok_or(BoardError::NoActiveBoard)?.begin()?;
                board.touch();
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
                let retry_task = board.tasks[board.current_idx].clone();
                outcome = self
                    .worker
                    .retry_with_feedback(&retry_task, &outcome, &reason, &globals, &ctx)
                    .await;
            }

            if outcome.success {
                let output = outcome.output.clone().unwrap_or_default();
                board
                    .current_task_mut()
                    .ok_or(BoardError::NoActiveBoard)?
                    .complete(output.clone())?;
                board.record_completion(&task_id, &output);
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
                self.emit(
                    &board_id,
                    BoardEventKind::TaskCompleted {
                        task_id: task_id.clone(),
                        name: task_name,
                        preview: preview_of(&output),
                    },
                );
                continue;
            }

            // Definitive failure.
            let reason = outcome
                .retry_reason
                .clone()
                .unwrap_or_else(|| "task failed".to_string());
            board.current_task_mut().ok_or(BoardError::NoActiveBoard)?.fail()?;
            board.touch();
            let snapshot = board.clone();
            self.save_board(&snapshot).await?;
            self.emit(
                &board_id,
                BoardEventKind::TaskFailed {
                    task_id: task_id.clone(),
                    error: reason.clone(),
                    will_retry: false,
                },
            );

            if !self.auto_replan {
                self.emit(&board_id, BoardEventKind::BoardFailed { error: reason.clone() });
                return Ok(ExecutionOutcome::Failed { message: reason });
            }
            if let Err(err) = self.replan_in_place(board, &reason, None).await {
                warn!(error = %err, "replanning failed");
                board.status = BoardStatus::Paused;
                board.touch();
                let snapshot = board.clone();
                self.save_board(&snapshot).await?;
                return Ok(ExecutionOutcome::Failed {
                    message: "Replanning failed".to_string(),
                });
            }
            // Board now carries the new plan; keep driving.
        }
    }

    /// Replace the unfinished suffix of `board` with a fresh plan,
    /// preserving the completed prefix and its outputs.
    async fn replan_in_place(
        &self,
        board: &mut TaskBoard,
        failure_reason: &str,
        user_feedback: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        board.status = BoardStatus::Replanning;
        board.touch();
        let snapshot = board.clone();
        self.save_board(&snapshot).await?;
        self.emit(
            &board.id,
            BoardEventKind::ReplanTriggered {
                reason: failure_reason.to_string(),
            },
        );

        let plan: Plan = self
            .planner
            .replan(ReplanRequest {
                objective: &board.objective,
                previous_board: board,
                failure_reason,
                user_feedback,
            })
            .await?;

        let preserved: Vec<Task> = board
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .cloned()
            .collect();
        let preserved_len = preserved.len();
        let checkpoint_count = plan.checkpoint_count;

        // New-plan ids must not collide with preserved ones; rewrite the
        // collisions (and intra-plan references to them).
        let taken: rustc_hash::FxHashSet<String> =
            preserved.iter().map(|t| t.id.clone()).collect();
        let mut appended = plan.tasks;
        for (index, task) in appended.iter_mut().enumerate() {
            if taken.contains(&task.id) {
                // A dependency on the old id still resolves to the
                // preserved task's output, which is what a replan means by
                // referencing completed work.
                let fresh = format!("{}_r{}", task.id, index);
                debug!(old = %task.id, new = %fresh, "rewriting replanned task id");
                task.id = fresh;
            }
        }

        board.tasks = preserved;
        board.tasks.extend(appended);
        board.current_idx = preserved_len;
        board.status = BoardStatus::Executing;
        board.total_checkpoints = board.completed_checkpoints + checkpoint_count;
        board.touch();
        let snapshot = board.clone();
        self.save_board(&snapshot).await?;
        Ok(())
    }
}

/// Prefer the last synthesis task's result; otherwise stitch the completed
/// work tasks together under `##` headings.
#[must_use]
pub fn synthesize_final_output(board: &TaskBoard) -> String {
    let synthesis = board
        .tasks
        .iter()
        .rev()
        .find(|t| t.task_type == TaskType::Synthesis && t.status == TaskStatus::Complete)
        .and_then(|t| t.result.clone());
    if let Some(output) = synthesis {
        return output;
    }
    board
        .tasks
        .iter()
        .filter(|t| t.task_type == TaskType::Work && t.status == TaskStatus::Complete)
        .filter_map(|t| {
            t.result
                .as_ref()
                .map(|result| format!("## {}\n{}", t.name, result))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn preview_of(output: &str) -> String {
    if output.chars().count() <= PREVIEW_CHARS {
        return output.to_string();
    }
    let preview: String = output.chars().take(PREVIEW_CHARS).collect();
    format!("{preview}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::WorkerRole;

    fn completed(id: &str, name: &str, task_type: TaskType, output: &str) -> Task {
        let mut task = Task::new(id, name, WorkerRole::Writer);
        task.task_type = task_type;
        if task_type == TaskType::Checkpoint {
            task.checkpoint_message = Some("ok?".into());
            task.reach_checkpoint().unwrap();
        } else {
            task.begin().unwrap();
        }
        task.complete(output.into()).unwrap();
        task
    }

    #[test]
    fn synthesis_result_wins_when_present() {
        let mut board = TaskBoard::new("b1", "s1", "obj", "ctx");
        board.tasks = vec![
            completed("t1", "Research", TaskType::Work, "notes"),
            completed("t2", "Deliver", TaskType::Synthesis, "the final article"),
        ];
        assert_eq!(synthesize_final_output(&board), "the final article");
    }

    #[test]
    fn work_outputs_are_stitched_under_headings() {
        let mut board = TaskBoard::new("b1", "s1", "obj", "ctx");
        board.tasks = vec![
            completed("t1", "Research", TaskType::Work, "notes"),
            completed("t2", "Confirm", TaskType::Checkpoint, "yes"),
            completed("t3", "Write", TaskType::Work, "draft"),
        ];
        let output = synthesize_final_output(&board);
        assert_eq!(output, "## Research\nnotes\n\n## Write\ndraft");
    }

    #[test]
    fn incomplete_tasks_contribute_nothing() {
        let mut board = TaskBoard::new("b1", "s1", "obj", "ctx");
        board.tasks = vec![Task::new("t1", "Pending", WorkerRole::Writer)];
        assert_eq!(synthesize_final_output(&board), "");
    }

    #[test]
    fn previews_are_bounded_with_ellipsis() {
        let short = preview_of("tiny");
        assert_eq!(short, "tiny");
        let long = preview_of(&"x".repeat(300));
        assert_eq!(long.chars().count(), PREVIEW_CHARS + 3);
        assert!(long.ends_with("..."));
    }
}
