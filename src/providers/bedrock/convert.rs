//! Anthropic Messages <-> Bedrock Converse translation (§4.5 translation table).
//!
//! Grounded on `original_source/backend/src/proxy/bedrock_converse.py`'s
//! `build_converse_request` / `parse_converse_response` and the family of
//! `_normalize_*` helpers feeding them. The Python original accepts whatever
//! shape a client sent (string | object | list) for `content`/`system` and
//! normalizes it before building the Converse payload; that tagged-union
//! normalization is reproduced here over `serde_json::Value` rather than
//! modeled as a typed enum, since the input is untyped client JSON, not a
//! value this crate controls.

use sha2::{Digest, Sha256};

use super::types::{
    ContentBlockDeltaInner, ContentBlockStartInner, ConverseContent, ConverseMessage,
    ConverseOutputContent, ConverseRequest, ConverseResponse, InferenceConfig, InputSchema,
    SystemContent, Tool, ToolChoice, ToolConfig, ToolSpec,
};
use crate::models::Usage;
use serde_json::{Map, Value, json};

/// §4.5: build the Converse request body from an inbound Anthropic request.
pub(super) fn build_converse_request(anthropic_req: &Value) -> ConverseRequest {
    let messages = anthropic_req
        .get("messages")
        .and_then(Value::as_array)
        .map(|msgs| msgs.iter().map(normalize_message).collect())
        .unwrap_or_default();

    let system = anthropic_req.get("system").map(normalize_system);
    let system = match system {
        Some(blocks) if !blocks.is_empty() => Some(blocks),
        _ => None,
    };

    let inference_config = build_inference_config(anthropic_req);
    let tool_config = build_tool_config(
        anthropic_req.get("tools").and_then(Value::as_array),
        anthropic_req.get("tool_choice"),
    );
    let request_metadata = anthropic_req
        .get("metadata")
        .and_then(normalize_request_metadata);

    ConverseRequest {
        messages,
        system,
        inference_config,
        tool_config,
        request_metadata,
    }
}

fn normalize_message(message: &Value) -> ConverseMessage {
    let role = message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .to_string();
    let content = normalize_content(message.get("content"));
    ConverseMessage { role, content }
}

fn normalize_content(content: Option<&Value>) -> Vec<ConverseContent> {
    match content {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![ConverseContent::text(s.clone())],
        Some(obj @ Value::Object(_)) => vec![normalize_content_block(obj)],
        Some(Value::Array(items)) => items.iter().map(normalize_content_block).collect(),
        Some(other) => vec![ConverseContent::text(other.to_string())],
    }
}

fn normalize_system(system: &Value) -> Vec<SystemContent> {
    match system {
        Value::Null => Vec::new(),
        Value::String(s) => vec![SystemContent { text: s.clone() }],
        obj @ Value::Object(_) => vec![normalize_system_block(obj)],
        Value::Array(items) => items.iter().map(normalize_system_block).collect(),
        other => vec![SystemContent {
            text: other.to_string(),
        }],
    }
}

fn normalize_system_block(block: &Value) -> SystemContent {
    match block {
        Value::String(s) => SystemContent { text: s.clone() },
        Value::Object(obj) => {
            let text = obj.get("text").and_then(Value::as_str);
            SystemContent {
                text: text.map(str::to_string).unwrap_or_else(|| block.to_string()),
            }
        }
        other => SystemContent {
            text: other.to_string(),
        },
    }
}

fn normalize_content_block(block: &Value) -> ConverseContent {
    let Value::String(s) = block else {
        let Some(obj) = block.as_object() else {
            return ConverseContent::text(block.to_string());
        };
        return normalize_content_block_object(obj, block);
    };
    ConverseContent::text(s.clone())
}

fn normalize_content_block_object(obj: &Map<String, Value>, original: &Value) -> ConverseContent {
    match obj.get("type").and_then(Value::as_str) {
        Some("text") => {
            ConverseContent::text(obj.get("text").and_then(Value::as_str).unwrap_or("").to_string())
        }
        Some("tool_use") => ConverseContent::tool_use(
            obj.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            obj.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            obj.get("input").cloned().unwrap_or_else(|| json!({})),
        ),
        Some("tool_result") => {
            let tool_use_id = obj
                .get("tool_use_id")
                .or_else(|| obj.get("toolUseId"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = obj.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let text = flatten_tool_result_content(obj.get("content"));
            ConverseContent::tool_result(tool_use_id, text, is_error)
        }
        _ => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                ConverseContent::text(text.to_string())
            } else {
                ConverseContent::text(original.to_string())
            }
        }
    }
}

/// Tool result content can itself be a string, a block, or a list of blocks;
/// the Converse wire format only carries text, so every shape is flattened
/// to a single string (concatenated text parts, matching the Python
/// original's `_normalize_tool_result_content` feeding a text-only consumer).
fn flatten_tool_result_content(content: Option<&Value>) -> String {
    match content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(obj @ Value::Object(_)) => block_text(obj),
        Some(Value::Array(items)) => items
            .iter()
            .map(block_text)
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}

fn block_text(block: &Value) -> String {
    match block {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| block.to_string()),
        other => other.to_string(),
    }
}

fn build_inference_config(req: &Value) -> Option<InferenceConfig> {
    let max_tokens = req.get("max_tokens").and_then(Value::as_u64);
    let temperature = req.get("temperature").and_then(Value::as_f64);
    let top_p = req.get("top_p").and_then(Value::as_f64);
    let top_k = req.get("top_k").and_then(Value::as_u64);
    let stop_sequences = req
        .get("stop_sequences")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty());

    if max_tokens.is_none()
        && temperature.is_none()
        && top_p.is_none()
        && top_k.is_none()
        && stop_sequences.is_none()
    {
        return None;
    }

    Some(InferenceConfig {
        max_tokens,
        temperature,
        top_p,
        top_k,
        stop_sequences,
    })
}

fn build_tool_config(tools: Option<&Vec<Value>>, tool_choice: Option<&Value>) -> Option<ToolConfig> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    let tools = tools.iter().map(normalize_tool).collect();
    let tool_choice = tool_choice.and_then(normalize_tool_choice);
    Some(ToolConfig { tools, tool_choice })
}

fn normalize_tool(tool: &Value) -> Tool {
    if tool.get("type").and_then(Value::as_str) == Some("function") {
        if let Some(func) = tool.get("function") {
            return Tool {
                tool_spec: ToolSpec {
                    name: func
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    description: func
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    input_schema: InputSchema {
                        json: func.get("parameters").cloned().unwrap_or_else(|| json!({})),
                    },
                },
            };
        }
    }
    Tool {
        tool_spec: ToolSpec {
            name: tool.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            description: tool
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: InputSchema {
                json: tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            },
        },
    }
}

fn normalize_tool_choice(choice: &Value) -> Option<ToolChoice> {
    match choice {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto {}),
            "any" | "required" => Some(ToolChoice::Any {}),
            _ => None,
        },
        Value::Object(_) => {
            let choice_type = choice.get("type").and_then(Value::as_str);
            match choice_type {
                Some("auto") => Some(ToolChoice::Auto {}),
                Some("any") | Some("required") => Some(ToolChoice::Any {}),
                Some("tool") => choice
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|name| ToolChoice::Tool { name: name.to_string() }),
                _ => choice
                    .get("tool")
                    .or_else(|| choice.get("function"))
                    .and_then(|t| t.get("name"))
                    .and_then(Value::as_str)
                    .map(|name| ToolChoice::Tool { name: name.to_string() }),
            }
        }
        _ => None,
    }
}

/// §4.5: `request_metadata` is capped to 16 string-valued entries, each key
/// 1-256 chars and value <=256 chars; everything else is silently dropped.
fn normalize_request_metadata(metadata: &Value) -> Option<Value> {
    let obj = metadata.as_object()?;
    let mut cleaned = Map::new();
    for (key, value) in obj {
        if cleaned.len() >= 16 {
            break;
        }
        let Some(value) = value.as_str() else { continue };
        if key.is_empty() || key.len() > 256 || value.len() > 256 {
            continue;
        }
        cleaned.insert(key.clone(), Value::String(value.to_string()));
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(Value::Object(cleaned))
    }
}

/// §4.5: translate a Converse response into an Anthropic-shaped message body.
/// Bedrock responses carry no `id`; one is synthesized deterministically
/// from the canonical JSON of the response so retried logging/telemetry
/// sees a stable value (the Python original hashes `json.dumps(data,
/// sort_keys=True)`, which is not reproducible across Rust; `serde_json`
/// already serializes object keys in sorted order, so hashing its own
/// compact output gives an equivalent canonical digest).
pub(super) fn parse_converse_response(response: &ConverseResponse, model: &str) -> (Value, Usage) {
    let content = normalize_output_content(&response.output.message.content);

    let usage = Usage {
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        cache_read_input_tokens: Some(response.usage.cache_read_input_tokens),
        cache_creation_input_tokens: Some(response.usage.cache_creation_input_tokens),
    };

    let mut body = json!({
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": response.stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "cache_read_input_tokens": usage.cache_read_input_tokens,
            "cache_creation_input_tokens": usage.cache_creation_input_tokens,
        },
    });
    let id = synthesize_id(&body);
    body["id"] = Value::String(id);

    (body, usage)
}

fn normalize_output_content(content: &[ConverseOutputContent]) -> Vec<Value> {
    content
        .iter()
        .filter_map(|block| {
            if let Some(text) = &block.text {
                Some(json!({"type": "text", "text": text}))
            } else {
                block.tool_use.as_ref().map(|tool_use| {
                    json!({
                        "type": "tool_use",
                        "id": tool_use.tool_use_id,
                        "name": tool_use.name,
                        "input": tool_use.input,
                    })
                })
            }
        })
        .collect()
}

/// `msg_<sha256 hex of canonical json>`, matching the `msg_` prefix of the
/// Python original's fallback id.
pub(super) fn synthesize_id(body: &Value) -> String {
    let canonical = serde_json::to_vec(body).expect("Value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("msg_{}", hex::encode(hasher.finalize()))
}

/// §4.5 streaming event-mapping table: `contentBlockStart.start` -> Anthropic
/// `content_block`.
pub(super) fn map_content_block_start(start: &ContentBlockStartInner) -> Option<Value> {
    if let Some(tool_use) = &start.tool_use {
        Some(json!({
            "type": "tool_use",
            "id": tool_use.tool_use_id,
            "name": tool_use.name,
            "input": {},
        }))
    } else {
        // The teacher types model only the tool_use variant explicitly; any
        // other start (a text block) has no extra fields to carry.
        Some(json!({"type": "text", "text": ""}))
    }
}

/// §4.5 streaming event-mapping table: `contentBlockDelta.delta` -> Anthropic delta.
pub(super) fn map_content_block_delta(delta: &ContentBlockDeltaInner) -> Option<Value> {
    if let Some(text) = &delta.text {
        Some(json!({"type": "text_delta", "text": text}))
    } else {
        delta
            .tool_use
            .as_ref()
            .map(|tool_use| json!({"type": "input_json_delta", "partial_json": tool_use.input}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_string_content() {
        let req = json!({"messages": [{"role": "user", "content": "hi"}]});
        let built = build_converse_request(&req);
        assert_eq!(built.messages.len(), 1);
        assert_eq!(built.messages[0].content.len(), 1);
        assert_eq!(built.messages[0].content[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn normalizes_block_list_content() {
        let req = json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "a"},
                    {"type": "tool_result", "tool_use_id": "t1", "content": "ok", "is_error": false}
                ]
            }]
        });
        let built = build_converse_request(&req);
        assert_eq!(built.messages[0].content.len(), 2);
        assert!(built.messages[0].content[1].tool_result.is_some());
    }

    #[test]
    fn system_string_becomes_single_block() {
        let req = json!({"messages": [], "system": "be nice"});
        let built = build_converse_request(&req);
        let system = built.system.unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].text, "be nice");
    }

    #[test]
    fn request_metadata_caps_entries_and_types() {
        let mut metadata = Map::new();
        for i in 0..20 {
            metadata.insert(format!("k{i}"), Value::String("v".to_string()));
        }
        metadata.insert("bad".to_string(), json!(123));
        let cleaned = normalize_request_metadata(&Value::Object(metadata)).unwrap();
        let obj = cleaned.as_object().unwrap();
        assert_eq!(obj.len(), 16);
        assert!(!obj.contains_key("bad"));
    }

    #[test]
    fn synthesized_id_is_deterministic() {
        let body = json!({"role": "assistant", "content": []});
        let a = synthesize_id(&body);
        let b = synthesize_id(&body);
        assert_eq!(a, b);
        assert!(a.starts_with("msg_"));
    }

    #[test]
    fn tool_choice_tool_variant_carries_name() {
        let choice = json!({"type": "tool", "name": "lookup"});
        match normalize_tool_choice(&choice) {
            Some(ToolChoice::Tool { name }) => assert_eq!(name, "lookup"),
            other => panic!("expected Tool variant, got {other:?}"),
        }
    }
}
