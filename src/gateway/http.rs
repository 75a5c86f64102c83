//! HTTP language-model provider speaking the Gemini-style REST API.
//!
//! Request and response bodies are typed serde structs; nothing is built
//! through raw `json!` so shape drift surfaces as a compile error here and
//! a `Protocol` error at runtime. Streaming uses the `alt=sse` endpoint and
//! forwards each textual delta through the caller's chunk channel.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::options::{ChatRole, Generated};
use super::provider::{GenerateRequest, LanguageModel, ProviderError};
use crate::message::ToolCallRecord;

/// Provider client; cheap to clone per session (the inner `reqwest::Client`
/// is pooled).
#[derive(Clone)]
pub struct HttpLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLanguageModel {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn generate_url(&self, model: &str, streaming: bool) -> String {
        let verb = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/v1beta/models/{}:{}", self.base_url, model, verb)
    }

    fn embed_url(&self, model: &str) -> String {
        format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.base_url, model
        )
    }

    fn build_body(request: &GenerateRequest) -> WireRequest {
        let mut system_parts: Vec<WirePart> = Vec::new();
        let mut contents: Vec<WireContent> = Vec::new();

        for message in &request.history {
            match message.role {
                ChatRole::System => system_parts.push(WirePart::text(&message.content)),
                ChatRole::User => contents.push(WireContent {
                    role: "user",
                    parts: vec![WirePart::text(&message.content)],
                }),
                ChatRole::Assistant => {
                    let mut parts = vec![WirePart::text(&message.content)];
                    for call in &message.tool_calls {
                        parts.push(WirePart::function_call(call));
                    }
                    contents.push(WireContent {
                        role: "model",
                        parts,
                    });
                }
            }
        }

        // Attachments ride on the last user content entry.
        if !request.options.attachments.is_empty() {
            if let Some(last_user) = contents.iter_mut().rev().find(|c| c.role == "user") {
                for file in &request.options.attachments {
                    last_user.parts.push(WirePart {
                        text: None,
                        inline_data: Some(WireInlineData {
                            mime_type: file.mime_type.clone(),
                            data: file.data.clone(),
                        }),
                        function_call: None,
                    });
                }
            }
        }

        let mut tools: Vec<WireTool> = Vec::new();
        if !request.tools.is_empty() {
            tools.push(WireTool {
                function_declarations: Some(
                    request
                        .tools
                        .iter()
                        .map(|def| WireFunctionDeclaration {
                            name: def.name.clone(),
                            description: def.description.clone(),
                            parameters: def.parameters.clone(),
                        })
                        .collect(),
                ),
                google_search: None,
                code_execution: None,
            });
        }
        if request.options.native_tools.web_search {
            tools.push(WireTool {
                function_declarations: None,
                google_search: Some(Value::Object(Default::default())),
                code_execution: None,
            });
        }
        if request.options.native_tools.code_execution {
            tools.push(WireTool {
                function_declarations: None,
                google_search: None,
                code_execution: Some(Value::Object(Default::default())),
            });
        }

        WireRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(WireSystemInstruction {
                    parts: system_parts,
                })
            },
            tools,
            generation_config: Some(WireGenerationConfig {
                temperature: request.options.temperature,
                thinking_config: request
                    .options
                    .reasoning_budget
                    .map(|budget| WireThinkingConfig {
                        thinking_budget: budget,
                    }),
            }),
        }
    }

    async fn classify_failure(response: reqwest::Response) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("{status}: {}", truncate(&body, 300));
        if status == StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited { message }
        } else if status.is_server_error() {
            ProviderError::Unavailable { message }
        } else {
            ProviderError::Upstream { message }
        }
    }

    fn transport_error(err: reqwest::Error) -> ProviderError {
        if err.is_connect() || err.is_timeout() {
            ProviderError::Unavailable {
                message: err.to_string(),
            }
        } else {
            ProviderError::Upstream {
                message: err.to_string(),
            }
        }
    }

    async fn generate_streaming(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError> {
        let url = self.generate_url(&request.options.model, true);
        let body = Self::build_body(request);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }

        let mut generated = Generated::default();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        while let Some(frame) = stream.next().await {
            let bytes = frame.map_err(Self::transport_error)?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            // SSE frames are newline-delimited; keep the trailing partial line.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                let wire: WireResponse =
                    serde_json::from_str(payload).map_err(|e| ProviderError::Protocol {
                        message: format!("bad stream frame: {e}"),
                    })?;
                // Usage-only frames carry no candidates; skip them.
                if wire.candidates.is_empty() {
                    continue;
                }
                let delta = extract_candidate(&wire)?;
                if !delta.text.is_empty() {
                    if let Some(tx) = &chunk_tx {
                        let _ = tx.send(delta.text.clone()).await;
                    }
                    generated.text.push_str(&delta.text);
                }
                generated.tool_calls.extend(delta.tool_calls);
            }
        }
        debug!(
            chars = generated.text.len(),
            tool_calls = generated.tool_calls.len(),
            "stream complete"
        );
        Ok(generated)
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError> {
        if request.options.stream {
            return self.generate_streaming(request, chunk_tx).await;
        }
        let url = self.generate_url(&request.options.model, false);
        let body = Self::build_body(request);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol {
                message: format!("bad response body: {e}"),
            })?;
        extract_candidate(&wire)
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self.embed_url(model);
        let body = WireEmbedRequest {
            requests: texts
                .iter()
                .map(|text| WireEmbedEntry {
                    model: format!("models/{model}"),
                    content: WireEmbedContent {
                        parts: vec![WirePart::text(text)],
                    },
                })
                .collect(),
        };
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        if !response.status().is_success() {
            return Err(Self::classify_failure(response).await);
        }
        let wire: WireEmbedResponse =
            response.json().await.map_err(|e| ProviderError::Protocol {
                message: format!("bad embedding body: {e}"),
            })?;
        Ok(wire
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

/// Pull text and ordered function calls out of the first candidate.
fn extract_candidate(wire: &WireResponse) -> Result<Generated, ProviderError> {
    let candidate = wire
        .candidates
        .first()
        .ok_or_else(|| ProviderError::Protocol {
            message: "response carried no candidates".to_string(),
        })?;
    let mut generated = Generated::default();
    if let Some(content) = &candidate.content {
        for part in &content.parts {
            if let Some(text) = &part.text {
                generated.text.push_str(text);
            }
            if let Some(call) = &part.function_call {
                generated.tool_calls.push(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: call.args.clone().unwrap_or(Value::Null),
                    id: None,
                });
            }
        }
    }
    Ok(generated)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireSystemInstruction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct WireSystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: &'static str,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
}

impl WirePart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
            function_call: None,
        }
    }

    fn function_call(record: &ToolCallRecord) -> Self {
        Self {
            text: None,
            inline_data: None,
            function_call: Some(WireFunctionCall {
                name: record.name.clone(),
                args: Some(record.arguments.clone()),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    #[serde(skip_serializing_if = "Option::is_none")]
    function_declarations: Option<Vec<WireFunctionDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    google_search: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_execution: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<WireThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireThinkingConfig {
    thinking_budget: u32,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    content: Option<WireCandidateContent>,
}

#[derive(Debug, Deserialize)]
struct WireCandidateContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WireEmbedRequest {
    requests: Vec<WireEmbedEntry>,
}

#[derive(Debug, Serialize)]
struct WireEmbedEntry {
    model: String,
    content: WireEmbedContent,
}

#[derive(Debug, Serialize)]
struct WireEmbedContent {
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedResponse {
    #[serde(default)]
    embeddings: Vec<WireEmbedding>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    values: Vec<f32>,
}
