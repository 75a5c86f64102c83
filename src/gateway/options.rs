//! Request/response shapes shared by the gateway and its providers.

use serde::{Deserialize, Serialize};

use crate::message::ToolCallRecord;

/// Role of one history entry as the model sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the conversation handed to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Declaration of an external tool the model may call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the parameters.
    pub parameters: serde_json::Value,
}

/// Provider-native capabilities toggled per call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeTools {
    pub web_search: bool,
    pub code_execution: bool,
    pub maps_grounding: bool,
    pub vision: bool,
}

/// Inline file attachment forwarded to the provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// Base64 payload.
    pub data: String,
}

/// Per-call generation options.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub model: String,
    pub temperature: f32,
    /// Reasoning token budget, where the provider supports one.
    pub reasoning_budget: Option<u32>,
    /// When true, textual deltas are forwarded through the chunk channel.
    pub stream: bool,
    pub native_tools: NativeTools,
    pub attachments: Vec<FileRef>,
}

impl GenerateOptions {
    /// Options for a plain, non-streaming call against `model`.
    #[must_use]
    pub fn plain(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            reasoning_budget: None,
            stream: false,
            native_tools: NativeTools::default(),
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn streaming(model: impl Into<String>) -> Self {
        let mut options = Self::plain(model);
        options.stream = true;
        options
    }

    #[must_use]
    pub fn with_native_tools(mut self, native_tools: NativeTools) -> Self {
        self.native_tools = native_tools;
        self
    }
}

/// What came back from a generation call: the full concatenated text and
/// any tool calls, extraction order preserved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Generated {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Options for embedding calls.
#[derive(Clone, Debug)]
pub struct EmbedOptions {
    pub model: String,
    /// Unit-normalise returned vectors (zero vectors pass through as-is).
    pub normalize: bool,
}

impl EmbedOptions {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            normalize: true,
        }
    }
}
