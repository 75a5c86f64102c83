//! Planner: complexity triage, plan generation, and failure-driven
//! replanning.
//!
//! Both model-driven operations are wrapped in schema validation: the raw
//! output goes through the relaxed JSON extractor, then through serde
//! structs whose fields all default, then through normalisation that fills
//! ids, clamps lengths, and enforces role fallbacks. The planner warns on
//! soft violations (checkpoint cadence) but only rejects on unusable
//! output.

mod prompts;

pub use prompts::{plan_system_prompt, role_actions};

use std::sync::Arc;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::board::{
    BoardStatus, Complexity, Task, TaskBoard, TaskStatus, TaskType, WorkerRole,
};
use crate::config::PlannerConfig;
use crate::gateway::{ChatMessage, GatewayError, GenerateOptions, ModelGateway};
use crate::utils::id_generator::IdGenerator;
use crate::utils::json_relaxed::extract_json;

/// Outcome of complexity triage. Advisory: the session executor applies
/// its own threshold on top.
#[derive(Clone, Debug, PartialEq)]
pub struct Assessment {
    pub is_complex: bool,
    pub reason: String,
    pub suggested_approach: Approach,
    pub estimated_tasks: Option<u32>,
}

impl Assessment {
    /// The "when in doubt, answer directly" fallback.
    #[must_use]
    pub fn direct_fallback(reason: &str) -> Self {
        Self {
            is_complex: false,
            reason: reason.to_string(),
            suggested_approach: Approach::Direct,
            estimated_tasks: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Approach {
    Direct,
    Planned,
}

/// A normalised plan ready to become (or extend) a board.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub summary: String,
    pub estimated_time: String,
    pub checkpoint_count: usize,
}

/// Inputs to a replan.
pub struct ReplanRequest<'a> {
    pub objective: &'a str,
    pub previous_board: &'a TaskBoard,
    pub failure_reason: &'a str,
    pub user_feedback: Option<&'a str>,
}

/// Planner failures.
#[derive(Debug, Error, Diagnostic)]
pub enum PlannerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error("planner output had no usable JSON: {detail}")]
    #[diagnostic(
        code(taskweft::planner::unparseable),
        help("The model ignored the strict-JSON instruction; a retry may help.")
    )]
    Unparseable { detail: String },

    #[error("planner produced an empty task list")]
    #[diagnostic(code(taskweft::planner::empty_plan))]
    EmptyPlan,
}

// Loose wire shapes; every field defaults so partial model output survives.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireAssessment {
    is_complex: bool,
    reason: String,
    suggested_approach: String,
    estimated_tasks: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WirePlan {
    tasks: Vec<WireTask>,
    summary: String,
    estimated_time: String,
    checkpoint_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireTask {
    id: Option<String>,
    name: Option<String>,
    description: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
    worker_role: Option<String>,
    instruction: Option<String>,
    dependencies: Vec<String>,
    checkpoint_message: Option<String>,
    estimated_complexity: Option<String>,
    max_retries: Option<u32>,
}

pub struct Planner {
    gateway: Arc<ModelGateway>,
    config: PlannerConfig,
    ids: IdGenerator,
}

impl Planner {
    #[must_use]
    pub fn new(gateway: Arc<ModelGateway>, config: PlannerConfig) -> Self {
        Self {
            gateway,
            config,
            ids: IdGenerator::new(),
        }
    }

    /// Complexity triage. Never fails: any model or parse error falls back
    /// to a direct-answer recommendation.
    #[instrument(skip(self))]
    pub async fn assess(&self, user_query: &str) -> Assessment {
        let result = self
            .gateway
            .generate_with_tools(
                vec![
                    ChatMessage::system(prompts::ASSESS_SYSTEM_PROMPT),
                    ChatMessage::user(user_query.to_string()),
                ],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await;
        let generated = match result {
            Ok(generated) => generated,
            Err(err) => {
                warn!(error = %err, "assessment call failed; answering directly");
                return Assessment::direct_fallback("assessment unavailable");
            }
        };
        let Ok(value) = extract_json(&generated.text) else {
            warn!("assessment output unparseable; answering directly");
            return Assessment::direct_fallback("assessment unparseable");
        };
        let wire: WireAssessment = match serde_json::from_value(value) {
            Ok(wire) => wire,
            Err(_) => return Assessment::direct_fallback("assessment malformed"),
        };
        Assessment {
            is_complex: wire.is_complex,
            reason: wire.reason,
            suggested_approach: match wire.suggested_approach.as_str() {
                "planned" => Approach::Planned,
                _ => Approach::Direct,
            },
            estimated_tasks: wire.estimated_tasks,
        }
    }

    /// Generate a plan for `objective`.
    #[instrument(skip(self, context))]
    pub async fn create_plan(
        &self,
        objective: &str,
        user_query: &str,
        context: &str,
    ) -> Result<Plan, PlannerError> {
        let generated = self
            .gateway
            .generate_with_tools(
                vec![
                    ChatMessage::system(prompts::plan_system_prompt()),
                    ChatMessage::user(prompts::plan_user_prompt(objective, user_query, context)),
                ],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await?;
        self.parse_plan(&generated.text)
    }

    /// Replan after a failure; the result is appended after the preserved
    /// completed prefix of `previous_board`.
    #[instrument(skip(self, request), fields(board = %request.previous_board.id))]
    pub async fn replan(&self, request: ReplanRequest<'_>) -> Result<Plan, PlannerError> {
        let generated = self
            .gateway
            .generate_with_tools(
                vec![
                    ChatMessage::system(prompts::plan_system_prompt()),
                    ChatMessage::user(prompts::replan_user_prompt(
                        request.objective,
                        request.previous_board,
                        request.failure_reason,
                        request.user_feedback,
                    )),
                ],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await?;
        self.parse_plan(&generated.text)
    }

    /// Construct an executing board from a plan.
    #[must_use]
    pub fn create_board(
        &self,
        session_id: &str,
        objective: &str,
        context: &str,
        plan: Plan,
    ) -> TaskBoard {
        let mut board = TaskBoard::new(&self.ids.board_id(), session_id, objective, context);
        board.total_checkpoints = plan.checkpoint_count;
        board.tasks = plan.tasks;
        board.status = BoardStatus::Executing;
        board.current_idx = 0;
        board
    }

    fn parse_plan(&self, raw: &str) -> Result<Plan, PlannerError> {
        let value = extract_json(raw).map_err(|e| PlannerError::Unparseable {
            detail: e.to_string(),
        })?;
        let wire: WirePlan =
            serde_json::from_value(value).map_err(|e| PlannerError::Unparseable {
                detail: e.to_string(),
            })?;
        if wire.tasks.is_empty() {
            return Err(PlannerError::EmptyPlan);
        }
        Ok(self.normalize(wire))
    }

    /// Fill defaults, clamp the task count, and audit the checkpoint
    /// cadence. Soft violations warn; they never reject the plan.
    fn normalize(&self, wire: WirePlan) -> Plan {
        let mut tasks: Vec<Task> = Vec::new();
        let clamped = wire.tasks.len() > self.config.max_tasks;
        if clamped {
            warn!(
                produced = wire.tasks.len(),
                kept = self.config.max_tasks,
                "plan exceeded the task limit; clamping"
            );
        }
        for (index, wire_task) in wire.tasks.into_iter().take(self.config.max_tasks).enumerate() {
            let role = wire_task
                .worker_role
                .as_deref()
                .and_then(WorkerRole::parse)
                .unwrap_or(WorkerRole::Synthesizer);
            let task_type = match wire_task.task_type.as_deref() {
                Some("checkpoint") => TaskType::Checkpoint,
                Some("synthesis") => TaskType::Synthesis,
                _ => TaskType::Work,
            };
            let id = wire_task
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| self.ids.task_id(index));
            let name = wire_task.name.unwrap_or_else(|| format!("Task {index}"));
            let mut task = Task::new(&id, &name, role);
            task.description = wire_task.description.unwrap_or_default();
            task.task_type = task_type;
            task.instruction = wire_task.instruction.unwrap_or_default();
            task.supported_actions = role_actions(role).to_vec();
            task.dependencies = wire_task.dependencies;
            task.max_retries = wire_task.max_retries.unwrap_or(self.config.default_max_retries);
            task.checkpoint_message = wire_task.checkpoint_message.or_else(|| {
                (task_type == TaskType::Checkpoint)
                    .then(|| "Please review the progress so far. Continue?".to_string())
            });
            task.estimated_complexity = match wire_task.estimated_complexity.as_deref() {
                Some("low") => Complexity::Low,
                Some("high") => Complexity::High,
                _ => Complexity::Medium,
            };
            task.status = TaskStatus::Pending;
            tasks.push(task);
        }

        // Drop dependencies on ids the clamp removed.
        let known: rustc_hash::FxHashSet<String> =
            tasks.iter().map(|task| task.id.clone()).collect();
        for task in &mut tasks {
            task.dependencies.retain(|dep| known.contains(dep));
        }

        let mut consecutive_work = 0usize;
        for task in &tasks {
            if task.task_type == TaskType::Checkpoint {
                consecutive_work = 0;
            } else {
                consecutive_work += 1;
                if consecutive_work > self.config.max_consecutive_work {
                    warn!(
                        limit = self.config.max_consecutive_work,
                        "plan exceeds the consecutive-work-task limit"
                    );
                    break;
                }
            }
        }

        let checkpoint_count = tasks
            .iter()
            .filter(|task| task.task_type == TaskType::Checkpoint)
            .count();
        Plan {
            tasks,
            summary: wire.summary,
            estimated_time: wire.estimated_time,
            checkpoint_count,
        }
    }
}
