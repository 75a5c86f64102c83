//! External tools for the direct reason-act loop.
//!
//! Tools run in parallel with an individual deadline; a failure becomes an
//! observation string fed back to the model and never aborts the turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use crate::gateway::ToolDef;
use crate::memory::MemoryManager;
use crate::message::ToolCallRecord;

/// An external capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON-schema object for the arguments.
    fn parameters(&self) -> Value;

    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("invalid tool arguments: {message}")]
    #[diagnostic(code(taskweft::tool::args))]
    InvalidArgs { message: String },

    #[error("tool execution failed: {message}")]
    #[diagnostic(code(taskweft::tool::failed))]
    Failed { message: String },
}

/// Per-session registry of callable tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: FxHashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool declarations for the model, sorted by name for stable prompts.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self
            .tools
            .values()
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().map(|name| (*name).to_string()).collect();
        names.sort();
        names
    }
}

/// Outcome of one tool invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolRun {
    pub name: String,
    pub success: bool,
    pub result: String,
}

/// Run every requested call in parallel, each under `deadline`.
///
/// Results come back in request order regardless of completion order.
pub async fn run_tool_calls(
    registry: &ToolRegistry,
    calls: &[ToolCallRecord],
    deadline: Duration,
) -> Vec<ToolRun> {
    let futures = calls.iter().map(|call| {
        let tool = registry.get(&call.name);
        let name = call.name.clone();
        let args = call.arguments.clone();
        async move {
            let Some(tool) = tool else {
                return ToolRun {
                    name: name.clone(),
                    success: false,
                    result: format!("unknown tool: {name}"),
                };
            };
            match tokio::time::timeout(deadline, tool.call(args)).await {
                Ok(Ok(result)) => ToolRun {
                    name,
                    success: true,
                    result,
                },
                Ok(Err(err)) => {
                    warn!(tool = %name, error = %err, "tool failed");
                    ToolRun {
                        name,
                        success: false,
                        result: err.to_string(),
                    }
                }
                Err(_) => ToolRun {
                    name,
                    success: false,
                    result: format!("timed out after {}s", deadline.as_secs()),
                },
            }
        }
    });
    futures_util::future::join_all(futures).await
}

/// Render tool runs as the observation turn fed back to the model.
#[must_use]
pub fn format_observations(runs: &[ToolRun]) -> String {
    runs.iter()
        .map(|run| {
            let glyph = if run.success { "✅" } else { "❌" };
            format!("[Observation: {}] {glyph} {}", run.name, run.result)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

/// Searches the session's own memory tiers.
pub struct MemorySearchTool {
    memory: Arc<MemoryManager>,
}

impl MemorySearchTool {
    #[must_use]
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &'static str {
        "memory_search"
    }

    fn description(&self) -> &'static str {
        "Search earlier conversation memory for relevant context."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "topK": {"type": "integer", "description": "Max results", "default": 5}
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs {
                message: "missing 'query'".to_string(),
            })?;
        let top_k = args.get("topK").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let hits = self
            .memory
            .search_short_term(query, top_k)
            .await
            .map_err(|e| ToolError::Failed {
                message: e.to_string(),
            })?;
        if hits.is_empty() {
            return Ok("no relevant memory found".to_string());
        }
        Ok(hits
            .iter()
            .map(|hit| format!("[{:.0}%] {}", hit.score * 100.0, hit.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// Fetches a URL and returns a bounded slice of the body.
pub struct WebFetchTool {
    client: reqwest::Client,
    max_chars: usize,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebFetchTool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            max_chars: 8_000,
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &'static str {
        "web_fetch"
    }

    fn description(&self) -> &'static str {
        "Fetch a URL and return the beginning of its body as text."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"}
            },
            "required": ["url"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArgs {
                message: "missing 'url'".to_string(),
            })?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidArgs {
                message: format!("not an http(s) URL: {url}"),
            });
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Failed {
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Failed {
                message: format!("{url} returned {status}"),
            });
        }
        let body = response.text().await.map_err(|e| ToolError::Failed {
            message: e.to_string(),
        })?;
        Ok(body.chars().take(self.max_chars).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "echoes its input"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn call(&self, args: Value) -> Result<String, ToolError> {
            Ok(args.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn description(&self) -> &'static str {
            "never finishes in time"
        }

        fn parameters(&self) -> Value {
            json!({"type": "object"})
        }

        async fn call(&self, _args: Value) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("too late".to_string())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool));
        registry
    }

    fn call(name: &str, args: Value) -> ToolCallRecord {
        ToolCallRecord {
            name: name.to_string(),
            arguments: args,
            id: None,
        }
    }

    #[tokio::test]
    async fn parallel_calls_keep_request_order() {
        let registry = registry();
        let runs = run_tool_calls(
            &registry,
            &[
                call("echo", json!({"text": "first"})),
                call("echo", json!({"text": "second"})),
            ],
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(runs[0].result, "first");
        assert_eq!(runs[1].result, "second");
        assert!(runs.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn timeouts_become_failed_observations() {
        let registry = registry();
        let runs = run_tool_calls(
            &registry,
            &[call("slow", json!({}))],
            Duration::from_millis(20),
        )
        .await;
        assert!(!runs[0].success);
        assert!(runs[0].result.contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_tools_fail_softly() {
        let registry = registry();
        let runs = run_tool_calls(
            &registry,
            &[call("missing", json!({}))],
            Duration::from_secs(1),
        )
        .await;
        assert!(!runs[0].success);
        assert!(runs[0].result.contains("unknown tool"));
    }

    #[test]
    fn observation_format_matches_the_contract() {
        let runs = vec![
            ToolRun {
                name: "echo".into(),
                success: true,
                result: "hi".into(),
            },
            ToolRun {
                name: "slow".into(),
                success: false,
                result: "timed out after 30s".into(),
            },
        ];
        let text = format_observations(&runs);
        assert_eq!(
            text,
            "[Observation: echo] ✅ hi\n\n[Observation: slow] ❌ timed out after 30s"
        );
    }

    #[test]
    fn definitions_are_sorted_by_name() {
        let registry = registry();
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "slow");
    }
}
