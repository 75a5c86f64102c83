//! Worker: executes one task to completion via a bounded reason-act loop.
//!
//! Each turn calls the gateway with the role's system prompt and the task
//! transcript, then inspects the response for a completion or blocked
//! marker. Candidate outputs above a size floor go through one
//! self-assessment call; unsatisfactory output feeds the issues back as
//! the next user turn while turns remain. Errors map to retryability by
//! when they happened: before the loop got anywhere, a retry is worth it.

mod roles;

pub use roles::role_system_prompt;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::board::{SupportedAction, Task};
use crate::config::WorkerConfig;
use crate::events::{AgentEvent, BoardEvent, BoardEventKind, EventEmitter, emit_or_log};
use crate::gateway::{ChatMessage, GenerateOptions, ModelGateway, NativeTools};
use crate::utils::json_relaxed::extract_json;

/// Markers that end the loop with a candidate output.
const COMPLETION_MARKERS: [&str; 4] = [
    "TASK COMPLETE:",
    "TASK COMPLETED:",
    "FINAL OUTPUT:",
    "HERE IS THE FINAL",
];

/// Markers that end the loop asking for a retry.
const BLOCKED_MARKERS: [&str; 3] = ["TASK BLOCKED:", "CANNOT PROCEED:", "UNABLE TO COMPLETE:"];

/// What one worker run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub needs_retry: bool,
    pub retry_reason: Option<String>,
}

impl WorkerOutcome {
    fn success(output: String) -> Self {
        Self {
            success: true,
            output: Some(output),
            needs_retry: false,
            retry_reason: None,
        }
    }

    fn retryable(reason: String, output: Option<String>) -> Self {
        Self {
            success: false,
            output,
            needs_retry: true,
            retry_reason: Some(reason),
        }
    }

    fn terminal(reason: String) -> Self {
        Self {
            success: false,
            output: None,
            needs_retry: false,
            retry_reason: Some(reason),
        }
    }
}

/// Where a worker reports progress to.
#[derive(Clone)]
pub struct WorkerContext {
    pub session_id: String,
    pub board_id: String,
    pub emitter: Arc<dyn EventEmitter>,
}

impl WorkerContext {
    fn progress(&self, task_id: &str, message: String) {
        emit_or_log(
            self.emitter.as_ref(),
            AgentEvent::Board(BoardEvent::new(
                &self.session_id,
                &self.board_id,
                BoardEventKind::TaskProgress {
                    task_id: task_id.to_string(),
                    message,
                },
            )),
        );
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssessmentVerdict {
    satisfactory: bool,
    issues: Vec<String>,
    #[allow(dead_code)]
    suggestions: Vec<String>,
}

pub struct Worker {
    gateway: Arc<ModelGateway>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(gateway: Arc<ModelGateway>, config: WorkerConfig) -> Self {
        Self { gateway, config }
    }

    /// Execute `task` in isolation.
    ///
    /// `globals` is the board's full output map; the dependency subset is
    /// projected out of it here so the prompt can present both.
    #[instrument(skip_all, fields(task = %task.id, role = %task.worker_role.as_str()))]
    pub async fn run(
        &self,
        task: &Task,
        globals: &FxHashMap<String, String>,
        ctx: &WorkerContext,
    ) -> WorkerOutcome {
        let max_turns = if task.retry_count > 0 {
            self.config.max_turns + self.config.retry_extra_turns
        } else {
            self.config.max_turns
        };
        let native_tools = NativeTools {
            web_search: task.supported_actions.contains(&SupportedAction::WebSearch),
            code_execution: task
                .supported_actions
                .contains(&SupportedAction::CodeExecution),
            ..Default::default()
        };

        let mut transcript = vec![
            ChatMessage::system(role_system_prompt(task.worker_role)),
            ChatMessage::user(execution_prompt(task, globals)),
        ];

        for turn in 1..=max_turns {
            ctx.progress(&task.id, format!("{} (turn {turn})", task.name));
            let options = GenerateOptions::plain(self.gateway.generation_model())
                .with_native_tools(native_tools);
            let generated = match self
                .gateway
                .generate_with_tools(transcript.clone(), vec![], options, None)
                .await
            {
                Ok(generated) => generated,
                Err(err) => {
                    warn!(turn, error = %err, "worker turn failed");
                    // Early failures have burned nothing; later ones suggest
                    // the task itself is the problem.
                    return if turn < 2 {
                        WorkerOutcome::retryable(err.to_string(), None)
                    } else {
                        WorkerOutcome::terminal(err.to_string())
                    };
                }
            };
            let text = generated.text;
            transcript.push(ChatMessage::assistant(text.clone()));

            if let Some(candidate) = find_after_marker(&text, &COMPLETION_MARKERS) {
                let candidate = candidate.trim().to_string();
                if candidate.chars().count() <= self.config.assess_min_chars {
                    return WorkerOutcome::success(candidate);
                }
                match self.assess_output(task, &candidate).await {
                    Verdict::Satisfactory => return WorkerOutcome::success(candidate),
                    Verdict::Issues(issues) => {
                        let joined = issues.join("; ");
                        if turn < max_turns {
                            debug!(turn, issues = %joined, "self-assessment wants another pass");
                            transcript.push(ChatMessage::user(format!(
                                "Your output has issues:\n- {}\nAddress them and produce the final output again.",
                                issues.join("\n- ")
                            )));
                            continue;
                        }
                        return WorkerOutcome::retryable(joined, Some(candidate));
                    }
                }
            }

            if let Some(reason) = find_after_marker(&text, &BLOCKED_MARKERS) {
                let first_line = reason.trim().lines().next().unwrap_or_default().to_string();
                return WorkerOutcome::retryable(first_line, None);
            }

            transcript.push(ChatMessage::user("Continue with your task.".to_string()));
        }

        WorkerOutcome::retryable(
            format!("no completion marker after {max_turns} turns"),
            None,
        )
    }

    /// Re-run a task whose instruction has been augmented with feedback and
    /// the previous attempt's output.
    pub async fn retry_with_feedback(
        &self,
        task: &Task,
        last: &WorkerOutcome,
        feedback: &str,
        globals: &FxHashMap<String, String>,
        ctx: &WorkerContext,
    ) -> WorkerOutcome {
        let mut retry_task = task.clone();
        retry_task.instruction = format!(
            "{}\n\nA previous attempt was not accepted.\nPrevious output:\n{}\n\nFeedback to address:\n{}",
            task.instruction,
            last.output.as_deref().unwrap_or("(none)"),
            feedback
        );
        self.run(&retry_task, globals, ctx).await
    }

    /// One non-streaming assessment call. A failed call counts as
    /// satisfactory: assessment is advisory, not a gate on availability.
    async fn assess_output(&self, task: &Task, candidate: &str) -> Verdict {
        let prompt = format!(
            "Task: {}\nInstruction: {}\n\nProposed output:\n{}\n\nIs this output satisfactory? \
             Reply with strict JSON only: {{\"satisfactory\": bool, \"issues\": [string], \"suggestions\": [string]}}",
            task.name, task.instruction, candidate
        );
        let result = self
            .gateway
            .generate_with_tools(
                vec![ChatMessage::user(prompt)],
                vec![],
                GenerateOptions::plain(self.gateway.generation_model()),
                None,
            )
            .await;
        let Ok(generated) = result else {
            return Verdict::Satisfactory;
        };
        let Ok(value) = extract_json(&generated.text) else {
            return Verdict::Satisfactory;
        };
        let verdict: AssessmentVerdict = match serde_json::from_value(value) {
            Ok(verdict) => verdict,
            Err(_) => return Verdict::Satisfactory,
        };
        if verdict.satisfactory || verdict.issues.is_empty() {
            Verdict::Satisfactory
        } else {
            Verdict::Issues(verdict.issues)
        }
    }
}

enum Verdict {
    Satisfactory,
    Issues(Vec<String>),
}

/// Case-insensitive search for any marker; returns the text after the
/// earliest match.
fn find_after_marker<'a>(text: &'a str, markers: &[&str]) -> Option<&'a str> {
    let lower = text.to_lowercase();
    let mut best: Option<(usize, usize)> = None;
    for marker in markers {
        if let Some(pos) = lower.find(&marker.to_lowercase()) {
            let candidate = (pos, pos + marker.len());
            if best.is_none_or(|(current, _)| pos < current) {
                best = Some(candidate);
            }
        }
    }
    best.map(|(_, end)| &text[end..])
}

/// The execution prompt: task identity plus everything completed so far.
fn execution_prompt(task: &Task, globals: &FxHashMap<String, String>) -> String {
    let mut prompt = format!(
        "## Task: {}\n{}\n\n## Instruction\n{}\n",
        task.name, task.description, task.instruction
    );
    let deps: Vec<&String> = task
        .dependencies
        .iter()
        .filter(|dep| globals.contains_key(*dep))
        .collect();
    if !deps.is_empty() {
        prompt.push_str("\n## Outputs of tasks you depend on\n");
        for dep in deps {
            prompt.push_str(&format!("### {dep}\n{}\n", globals[dep]));
        }
    }
    let other: Vec<(&String, &String)> = globals
        .iter()
        .filter(|(id, _)| !task.dependencies.contains(*id))
        .collect();
    if !other.is_empty() {
        prompt.push_str("\n## Other completed work (for reference)\n");
        for (id, output) in other {
            let preview: String = output.chars().take(400).collect();
            prompt.push_str(&format!("### {id}\n{preview}\n"));
        }
    }
    prompt
}
