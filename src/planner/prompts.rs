//! Fixed prompts for complexity assessment, planning, and replanning.

use crate::board::{SupportedAction, TaskBoard, TaskStatus, WorkerRole};

/// Actions each role may lean on. Referenced by the planning prompt and by
/// the worker when enabling provider-native tools.
#[must_use]
pub fn role_actions(role: WorkerRole) -> &'static [SupportedAction] {
    match role {
        WorkerRole::Researcher => &[SupportedAction::WebSearch, SupportedAction::WebFetch],
        WorkerRole::Writer => &[SupportedAction::MemorySearch],
        WorkerRole::Coder => &[SupportedAction::CodeExecution, SupportedAction::WebSearch],
        WorkerRole::Analyst => &[SupportedAction::CodeExecution, SupportedAction::MemorySearch],
        WorkerRole::Editor => &[SupportedAction::MemorySearch],
        WorkerRole::SeoSpecialist => &[SupportedAction::WebSearch],
        WorkerRole::DataProcessor => &[SupportedAction::CodeExecution],
        WorkerRole::Synthesizer => &[SupportedAction::MemorySearch],
    }
}

fn action_name(action: SupportedAction) -> &'static str {
    match action {
        SupportedAction::WebSearch => "web_search",
        SupportedAction::CodeExecution => "code_execution",
        SupportedAction::MemorySearch => "memory_search",
        SupportedAction::WebFetch => "web_fetch",
    }
}

/// System prompt for complexity assessment.
pub const ASSESS_SYSTEM_PROMPT: &str = r#"You triage user requests for an assistant that can either answer directly or run a multi-step plan.

Reply with a strict JSON object, nothing else:
{"isComplex": bool, "reason": string, "suggestedApproach": "direct" | "planned", "estimatedTasks": number}

A request is complex only when it needs several distinct work products or research steps. Questions, chats, and single-step asks are not complex."#;

/// System prompt for plan generation. Enumerates the closed role set, each
/// role's allowed actions, the checkpoint cadence rule, and the strict-JSON
/// requirement.
#[must_use]
pub fn plan_system_prompt() -> String {
    let mut roles_block = String::new();
    for role in WorkerRole::ALL {
        let actions: Vec<&str> = role_actions(role).iter().map(|a| action_name(*a)).collect();
        roles_block.push_str(&format!(
            "- {} (actions: {})\n",
            role.as_str(),
            actions.join(", ")
        ));
    }
    format!(
        r#"You are a planning engine. Decompose the user's objective into a short list of typed tasks executed by role-specialised workers.

Available worker roles:
{roles_block}
Rules:
- Task types: "work", "checkpoint" (ask the user to review; set "checkpointMessage"), "synthesis" (produce the final deliverable; usually last).
- Never place more than 4 consecutive work tasks without a checkpoint.
- Dependencies reference earlier task ids only; no cycles.
- Keep plans short; 15 tasks maximum.

Reply with a strict JSON object, nothing else:
{{"tasks": [{{"id": string, "name": string, "description": string, "type": "work"|"checkpoint"|"synthesis", "workerRole": string, "instruction": string, "dependencies": [string], "checkpointMessage": string?, "estimatedComplexity": "low"|"medium"|"high", "maxRetries": number?}}], "summary": string, "estimatedTime": string, "checkpointCount": number}}"#
    )
}

/// User prompt for plan generation.
#[must_use]
pub fn plan_user_prompt(objective: &str, user_query: &str, context: &str) -> String {
    format!(
        "Objective: {objective}\n\nOriginal request: {user_query}\n\nRelevant context:\n{context}\n\nProduce the plan now."
    )
}

/// User prompt for replanning: carries the preserved work and the failure.
#[must_use]
pub fn replan_user_prompt(
    objective: &str,
    previous: &TaskBoard,
    failure_reason: &str,
    user_feedback: Option<&str>,
) -> String {
    let mut completed = String::new();
    for task in &previous.tasks {
        if task.status == TaskStatus::Complete {
            let preview = task.result.as_deref().unwrap_or_default();
            let preview: String = preview.chars().take(200).collect();
            completed.push_str(&format!("- {} ({}): {}\n", task.id, task.name, preview));
        }
    }
    if completed.is_empty() {
        completed.push_str("(none)\n");
    }
    let feedback_block = user_feedback
        .map(|feedback| format!("\nUser feedback:\n{feedback}\n"))
        .unwrap_or_default();
    format!(
        "Objective: {objective}\n\nAlready completed (do NOT plan these again; their outputs are available as dependencies):\n{completed}\nWhat went wrong:\n{failure_reason}\n{feedback_block}\nPlan only the remaining work."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_prompt_lists_every_role() {
        let prompt = plan_system_prompt();
        for role in WorkerRole::ALL {
            assert!(prompt.contains(role.as_str()), "missing {}", role.as_str());
        }
        assert!(prompt.contains("4 consecutive work tasks"));
        assert!(prompt.contains("strict JSON"));
    }

    #[test]
    fn replan_prompt_carries_completed_work() {
        let mut board = TaskBoard::new("b1", "s1", "write a post", "ctx");
        let mut done = crate::board::Task::new("t1", "research", WorkerRole::Researcher);
        done.begin().unwrap();
        done.complete("found three sources".into()).unwrap();
        board.tasks = vec![done, crate::board::Task::new("t2", "draft", WorkerRole::Writer)];
        let prompt = replan_user_prompt("write a post", &board, "draft was empty", Some("shorter"));
        assert!(prompt.contains("t1 (research): found three sources"));
        assert!(!prompt.contains("t2 (draft)"));
        assert!(prompt.contains("draft was empty"));
        assert!(prompt.contains("shorter"));
    }
}
