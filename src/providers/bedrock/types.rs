//! Bedrock Converse API wire types (§4.5 request/response translation table).
//!
//! Field names and the `pub(super)` visibility follow the teacher's
//! `providers::bedrock::types` conventions; the shapes themselves are
//! narrowed to what the Anthropic-to-Converse translation in `convert.rs`
//! needs (no Titan embeddings, no OpenAI-shaped response types — the
//! public wire format here is Anthropic's, not OpenAI's).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseRequest {
    pub messages: Vec<ConverseMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<SystemContent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub(super) struct SystemContent {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub(super) struct ConverseMessage {
    pub role: String,
    pub content: Vec<ConverseContent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use: Option<ToolUse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
}

impl ConverseContent {
    pub fn text(text: String) -> Self {
        Self {
            text: Some(text),
            tool_use: None,
            tool_result: None,
        }
    }

    pub fn tool_use(tool_use_id: String, name: String, input: Value) -> Self {
        Self {
            text: None,
            tool_use: Some(ToolUse {
                tool_use_id,
                name,
                input,
            }),
            tool_result: None,
        }
    }

    pub fn tool_result(tool_use_id: String, content: String, is_error: bool) -> Self {
        Self {
            text: None,
            tool_use: None,
            tool_result: Some(ToolResult {
                tool_use_id,
                content: vec![ToolResultContent { text: content }],
                status: if is_error {
                    ToolResultStatus::Error
                } else {
                    ToolResultStatus::Success
                },
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ToolResult {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
    pub status: ToolResultStatus,
}

#[derive(Debug, Serialize)]
pub(super) struct ToolResultContent {
    pub text: String,
}

#[derive(Debug, Serialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub(super) enum ToolResultStatus {
    Success,
    Error,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InferenceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ToolConfig {
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct Tool {
    pub tool_spec: ToolSpec,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ToolSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
pub(super) struct InputSchema {
    pub json: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) enum ToolChoice {
    Auto {},
    Any {},
    Tool { name: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseResponse {
    pub output: ConverseOutput,
    pub usage: ConverseUsage,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ConverseOutput {
    pub message: ConverseOutputMessage,
}

#[derive(Debug, Deserialize)]
pub(super) struct ConverseOutputMessage {
    pub content: Vec<ConverseOutputContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseOutputContent {
    pub text: Option<String>,
    pub tool_use: Option<ToolUse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConverseUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
}

// ── Streaming event payloads (decoded from the binary event-stream frames,
//    §4.5 streaming translation table) ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub(super) struct MessageStart {
    #[allow(dead_code)]
    pub role: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContentBlockStart {
    pub content_block_index: i32,
    pub start: ContentBlockStartInner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContentBlockStartInner {
    pub tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ToolUseStart {
    pub tool_use_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContentBlockDelta {
    pub content_block_index: i32,
    pub delta: ContentBlockDeltaInner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContentBlockDeltaInner {
    pub text: Option<String>,
    pub tool_use: Option<ToolUseDelta>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ToolUseDelta {
    pub input: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContentBlockStop {
    pub content_block_index: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MessageStop {
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamMetadata {
    pub usage: ConverseUsage,
}
