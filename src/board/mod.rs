//! Task and task-board data model.
//!
//! A [`TaskBoard`] is the execution plan for one user objective: an ordered
//! list of typed [`Task`]s, a cursor, and the outputs completed so far.
//! Transitions are guarded here so the orchestrator cannot drive a task or
//! board into an illegal state; violations surface as [`BoardError`]s and
//! leave the structure untouched.

mod storage;

pub use storage::{BoardStorage, InMemoryBoardStorage, LogBoardStorage};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of work a task is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Work,
    /// "Ask the user": execution suspends until feedback arrives.
    Checkpoint,
    /// Produces the final deliverable from prior outputs.
    Synthesis,
}

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Checkpoint,
    Retry,
    Failed,
    Complete,
}

/// The closed set of worker roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Researcher,
    Writer,
    Coder,
    Analyst,
    Editor,
    SeoSpecialist,
    DataProcessor,
    Synthesizer,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 8] = [
        WorkerRole::Researcher,
        WorkerRole::Writer,
        WorkerRole::Coder,
        WorkerRole::Analyst,
        WorkerRole::Editor,
        WorkerRole::SeoSpecialist,
        WorkerRole::DataProcessor,
        WorkerRole::Synthesizer,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerRole::Researcher => "researcher",
            WorkerRole::Writer => "writer",
            WorkerRole::Coder => "coder",
            WorkerRole::Analyst => "analyst",
            WorkerRole::Editor => "editor",
            WorkerRole::SeoSpecialist => "seo_specialist",
            WorkerRole::DataProcessor => "data_processor",
            WorkerRole::Synthesizer => "synthesizer",
        }
    }

    /// Lenient parse used when normalising model output; unknown names map
    /// to `None` so the planner can default.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "researcher" => Some(WorkerRole::Researcher),
            "writer" => Some(WorkerRole::Writer),
            "coder" => Some(WorkerRole::Coder),
            "analyst" => Some(WorkerRole::Analyst),
            "editor" => Some(WorkerRole::Editor),
            "seo_specialist" | "seo" => Some(WorkerRole::SeoSpecialist),
            "data_processor" => Some(WorkerRole::DataProcessor),
            "synthesizer" => Some(WorkerRole::Synthesizer),
            _ => None,
        }
    }
}

/// Actions a task is allowed to lean on while executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedAction {
    WebSearch,
    CodeExecution,
    MemorySearch,
    WebFetch,
}

/// Planner's effort estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// The atomic unit of planned work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub worker_role: WorkerRole,
    /// Free-form instruction handed verbatim to the worker.
    pub instruction: String,
    #[serde(default)]
    pub supported_actions: Vec<SupportedAction>,
    /// Ids of prior tasks whose outputs must be available first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
    /// Required iff `task_type == Checkpoint`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_message: Option<String>,
    #[serde(default)]
    pub estimated_complexity: Complexity,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh pending work-type task; planner normalisation adjusts fields.
    #[must_use]
    pub fn new(id: &str, name: &str, role: WorkerRole) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            task_type: TaskType::Work,
            worker_role: role,
            instruction: String::new(),
            supported_actions: Vec::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            result: None,
            retry_count: 0,
            max_retries: 2,
            user_feedback: None,
            checkpoint_message: None,
            estimated_complexity: Complexity::Medium,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// pending|retry → running.
    pub fn begin(&mut self) -> Result<(), BoardError> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Retry => {
                self.status = TaskStatus::Running;
                Ok(())
            }
            other => Err(BoardError::IllegalTaskTransition {
                task_id: self.id.clone(),
                from: other,
                to: TaskStatus::Running,
            }),
        }
    }

    /// running → complete. Completion freezes the task.
    pub fn complete(&mut self, output: String) -> Result<(), BoardError> {
        match self.status {
            TaskStatus::Running | TaskStatus::Checkpoint => {
                self.status = TaskStatus::Complete;
                self.result = Some(output);
                self.completed_at = Some(Utc::now());
                Ok(())
            }
            other => Err(BoardError::IllegalTaskTransition {
                task_id: self.id.clone(),
                from: other,
                to: TaskStatus::Complete,
            }),
        }
    }

    /// running → retry, consuming one retry credit.
    pub fn mark_retry(&mut self) -> Result<(), BoardError> {
        match self.status {
            TaskStatus::Running => {
                self.retry_count += 1;
                self.status = TaskStatus::Retry;
                Ok(())
            }
            other => Err(BoardError::IllegalTaskTransition {
                task_id: self.id.clone(),
                from: other,
                to: TaskStatus::Retry,
            }),
        }
    }

    /// running|retry → failed.
    pub fn fail(&mut self) -> Result<(), BoardError> {
        match self.status {
            TaskStatus::Running | TaskStatus::Retry => {
                self.status = TaskStatus::Failed;
                Ok(())
            }
            other => Err(BoardError::IllegalTaskTransition {
                task_id: self.id.clone(),
                from: other,
                to: TaskStatus::Failed,
            }),
        }
    }

    /// pending → checkpoint; only checkpoint-typed tasks suspend.
    pub fn reach_checkpoint(&mut self) -> Result<(), BoardError> {
        if self.task_type != TaskType::Checkpoint {
            return Err(BoardError::NotACheckpoint {
                task_id: self.id.clone(),
            });
        }
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Checkpoint;
                Ok(())
            }
            other => Err(BoardError::IllegalTaskTransition {
                task_id: self.id.clone(),
                from: other,
                to: TaskStatus::Checkpoint,
            }),
        }
    }

    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Board lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardStatus {
    Planning,
    Executing,
    Paused,
    Replanning,
    Completed,
    Abandoned,
}

impl BoardStatus {
    /// Terminal boards never execute again; at most one non-terminal board
    /// exists per session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BoardStatus::Completed | BoardStatus::Abandoned)
    }
}

/// The execution plan for one user objective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBoard {
    pub id: String,
    pub session_id: String,
    /// The original user utterance.
    pub objective: String,
    /// Memory snapshot used to plan.
    pub context: String,
    pub tasks: Vec<Task>,
    /// Index of the next task to execute; `tasks.len()` means done.
    pub current_idx: usize,
    /// Completed outputs keyed by task id.
    pub globals: FxHashMap<String, String>,
    pub status: BoardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_checkpoints: usize,
    pub completed_checkpoints: usize,
}

/// Board/task invariant violations.
#[derive(Debug, Error, Diagnostic)]
pub enum BoardError {
    #[error("task {task_id}: illegal transition {from:?} -> {to:?}")]
    #[diagnostic(code(taskweft::board::illegal_transition))]
    IllegalTaskTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {task_id} is not a checkpoint")]
    #[diagnostic(code(taskweft::board::not_a_checkpoint))]
    NotACheckpoint { task_id: String },

    #[error("no checkpoint is awaiting feedback")]
    #[diagnostic(
        code(taskweft::board::no_pending_checkpoint),
        help("Resume is only valid while the board is paused at a checkpoint task.")
    )]
    NoPendingCheckpoint,

    #[error("session already has an active board ({board_id})")]
    #[diagnostic(code(taskweft::board::already_active))]
    AlreadyActive { board_id: String },

    #[error("no active board for this session")]
    #[diagnostic(code(taskweft::board::no_active_board))]
    NoActiveBoard,

    #[error("task dependencies are not a DAG: {detail}")]
    #[diagnostic(code(taskweft::board::dependency_cycle))]
    DependencyCycle { detail: String },

    #[error("board cursor out of range: {current_idx} > {len}")]
    #[diagnostic(code(taskweft::board::cursor))]
    CursorOutOfRange { current_idx: usize, len: usize },
}

impl TaskBoard {
    #[must_use]
    pub fn new(id: &str, session_id: &str, objective: &str, context: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            session_id: session_id.to_string(),
            objective: objective.to_string(),
            context: context.to_string(),
            tasks: Vec::new(),
            current_idx: 0,
            globals: FxHashMap::default(),
            status: BoardStatus::Planning,
            created_at: now,
            updated_at: now,
            completed_at: None,
            total_checkpoints: 0,
            completed_checkpoints: 0,
        }
    }

    /// The task the cursor points at, when any remain.
    #[must_use]
    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(self.current_idx)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        self.tasks.get_mut(self.current_idx)
    }

    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .count()
    }

    /// ⌊100 · completed / total⌋, or 0 for an empty board.
    #[must_use]
    pub fn progress_percent(&self) -> u8 {
        if self.tasks.is_empty() {
            return 0;
        }
        ((self.completed_count() * 100) / self.tasks.len()) as u8
    }

    /// Outputs of `task`'s dependencies, projected out of `globals`.
    #[must_use]
    pub fn dependency_outputs(&self, task: &Task) -> FxHashMap<String, String> {
        task.dependencies
            .iter()
            .filter_map(|dep| self.globals.get(dep).map(|out| (dep.clone(), out.clone())))
            .collect()
    }

    /// Record a completed task's output and advance the cursor.
    pub fn record_completion(&mut self, task_id: &str, output: &str) {
        self.globals.insert(task_id.to_string(), output.to_string());
        self.current_idx += 1;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Validate that dependencies reference known tasks and form a DAG.
    pub fn validate_dependencies(&self) -> Result<(), BoardError> {
        let ids: FxHashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(BoardError::DependencyCycle {
                        detail: format!("task {} depends on unknown task {}", task.id, dep),
                    });
                }
            }
        }
        // Iterative DFS with colouring.
        let index: FxHashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }
        let mut colors = vec![Color::White; self.tasks.len()];
        for start in 0..self.tasks.len() {
            if colors[start] != Color::White {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            colors[start] = Color::Grey;
            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                let (node, edge) = (frame.0, frame.1);
                frame.1 += 1;
                let deps = &self.tasks[node].dependencies;
                if edge < deps.len() {
                    let next = index[deps[edge].as_str()];
                    match colors[next] {
                        Color::White => {
                            colors[next] = Color::Grey;
                            stack.push((next, 0));
                        }
                        Color::Grey => {
                            return Err(BoardError::DependencyCycle {
                                detail: format!(
                                    "cycle through {} and {}",
                                    self.tasks[node].id, self.tasks[next].id
                                ),
                            });
                        }
                        Color::Black => {}
                    }
                } else {
                    colors[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Cursor sanity, checked after deserialisation.
    pub fn validate_cursor(&self) -> Result<(), BoardError> {
        if self.current_idx > self.tasks.len() {
            return Err(BoardError::CursorOutOfRange {
                current_idx: self.current_idx,
                len: self.tasks.len(),
            });
        }
        Ok(())
    }

    /// Count of checkpoint-typed tasks.
    #[must_use]
    pub fn checkpoint_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.task_type == TaskType::Checkpoint)
            .count()
    }
}
