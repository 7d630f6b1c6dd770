//! Content-generation adapter: non-streaming tool calls, effort-level
//! reasoning, and a strict JSON-schema dialect.
//!
//! This backend differs from the chat-completions family in three ways the
//! adapter has to absorb:
//!
//! - tool calls arrive whole inside a candidate part (no fragment
//!   accumulation; ids are absent and left for the engine to synthesize);
//! - reasoning is configured by an effort enum, with the wire shape
//!   depending on the model family (integer token budget vs. level enum),
//!   and must be omitted entirely whenever tools or native search are on;
//! - the tool parameter schema accepts only a narrow JSON-schema subset,
//!   and every object must list all of its properties as `required`.
//!
//! Grounded-search source links are appended to the reply as synthesized
//! text deltas so callers need no special handling for citations.

use crate::event::Event;
use crate::provider::{Capabilities, Provider};
use crate::providers::http_error;
use crate::sse::sse_payloads;
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::types::{Message, Part, Request, Role, ToolCallPart, ToolSpec, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Reasoning effort requested for `-thinking` model variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThinkingEffort {
    Low,
    #[default]
    Medium,
    High,
}

impl ThinkingEffort {
    fn budget_tokens(self) -> u32 {
        match self {
            ThinkingEffort::Low => 1024,
            ThinkingEffort::Medium => 8192,
            ThinkingEffort::High => 24576,
        }
    }

    fn level(self) -> &'static str {
        match self {
            ThinkingEffort::Low => "low",
            ThinkingEffort::Medium => "medium",
            ThinkingEffort::High => "high",
        }
    }
}

/// Configuration for a content-generation endpoint.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub effort: ThinkingEffort,
    pub timeout: Duration,
}

impl GeminiConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            effort: ThinkingEffort::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct GeminiProvider {
    config: GeminiConfig,
    client: reqwest::Client,
}

/// Keywords this backend's schema dialect rejects.
const DROPPED_KEYWORDS: &[&str] = &[
    "$schema",
    "format",
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "pattern",
    "default",
    "examples",
    "const",
    "additionalProperties",
    "title",
];

/// Normalize a JSON schema to the backend's dialect: drop unsupported
/// keywords and rewrite every object's `required` to name every property.
pub fn normalize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if DROPPED_KEYWORDS.contains(&key.as_str()) {
                    continue;
                }
                if key == "required" {
                    // Rewritten below from properties.
                    continue;
                }
                out.insert(key.clone(), normalize_schema(value));
            }
            if let Some(Value::Object(properties)) = out.get("properties") {
                let required: Vec<Value> =
                    properties.keys().map(|k| Value::String(k.clone())).collect();
                out.insert("required".to_string(), Value::Array(required));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_schema).collect()),
        other => other.clone(),
    }
}

/// Strip a trailing `-thinking` suffix, reporting whether it was present.
fn split_thinking_suffix(model: &str) -> (&str, bool) {
    match model.strip_suffix("-thinking") {
        Some(base) => (base, true),
        None => (model, false),
    }
}

/// The wire shape of thinking configuration depends on the model family:
/// the 2.5 line takes an integer budget, newer lines take a level enum.
fn thinking_config(model: &str, effort: ThinkingEffort) -> Value {
    if model.contains("2.5") {
        json!({"thinkingBudget": effort.budget_tokens(), "includeThoughts": true})
    } else {
        json!({"thinkingLevel": effort.level(), "includeThoughts": true})
    }
}

fn wire_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents = Vec::new();
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => contents.push(json!({
                "role": "user",
                "parts": wire_parts(message),
            })),
            Role::Assistant => contents.push(json!({
                "role": "model",
                "parts": wire_parts(message),
            })),
            Role::Tool => {
                let parts: Vec<Value> = message
                    .tool_results()
                    .map(|result| {
                        json!({
                            "functionResponse": {
                                "name": result.name,
                                "response": {"output": result.text},
                            }
                        })
                    })
                    .collect();
                contents.push(json!({"role": "user", "parts": parts}));
            }
        }
    }
    contents
}

fn wire_parts(message: &Message) -> Vec<Value> {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => {
                (!text.is_empty()).then(|| json!({"text": text}))
            }
            Part::Image { media_type, data, .. } => Some(json!({
                "inlineData": {"mimeType": media_type, "data": data},
            })),
            Part::ToolCall(call) => {
                let mut wire = json!({
                    "functionCall": {
                        "name": call.name,
                        "args": call.parsed_arguments().unwrap_or_else(|_| json!({})),
                    }
                });
                if let Some(signature) = &call.thought_signature {
                    wire["thoughtSignature"] = json!(signature);
                }
                Some(wire)
            }
            Part::ToolResult(_) => None,
        })
        .collect()
}

async fn pump(response: reqwest::Response, sink: EventSink) -> Result<()> {
    let mut payloads = sse_payloads(response);
    let mut sources: Vec<(String, String)> = Vec::new();
    let mut usage = Usage::default();
    let mut saw_usage = false;

    loop {
        let payload = tokio::select! {
            _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
            payload = payloads.next() => payload,
        };
        let Some(payload) = payload else { break };
        let frame: Value = serde_json::from_str(&payload?)
            .map_err(|e| Error::stream(format!("malformed frame: {e}")))?;

        for candidate in frame["candidates"].as_array().unwrap_or(&Vec::new()) {
            for part in candidate["content"]["parts"].as_array().unwrap_or(&Vec::new()) {
                if part["thought"].as_bool().unwrap_or(false) {
                    if let Some(text) = part["text"].as_str() {
                        sink.send(Event::ReasoningDelta(crate::types::ReasoningMeta {
                            summary: text.to_string(),
                            ..Default::default()
                        }))
                        .await;
                    }
                    continue;
                }
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() && !sink.send(Event::TextDelta(text.to_string())).await {
                        return Err(Error::Cancelled);
                    }
                }
                if part["functionCall"].is_object() {
                    // Calls arrive whole; no id on this wire, the engine
                    // synthesizes one.
                    let name = part["functionCall"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    let arguments = part["functionCall"]["args"].to_string();
                    let mut call = ToolCallPart::new("", name, arguments);
                    call.thought_signature =
                        part["thoughtSignature"].as_str().map(str::to_string);
                    if !sink.send(Event::ToolCall(call)).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
            for chunk in candidate["groundingMetadata"]["groundingChunks"]
                .as_array()
                .unwrap_or(&Vec::new())
            {
                if let Some(uri) = chunk["web"]["uri"].as_str() {
                    let title = chunk["web"]["title"].as_str().unwrap_or(uri);
                    let entry = (title.to_string(), uri.to_string());
                    if !sources.contains(&entry) {
                        sources.push(entry);
                    }
                }
            }
        }

        let metadata = &frame["usageMetadata"];
        if metadata.is_object() {
            saw_usage = true;
            usage.input_tokens = metadata["promptTokenCount"].as_u64().unwrap_or(0);
            usage.output_tokens = metadata["candidatesTokenCount"].as_u64().unwrap_or(0);
            usage.cached_tokens = metadata["cachedContentTokenCount"].as_u64().unwrap_or(0);
        }
    }

    if !sources.is_empty() {
        let mut links = String::from("\n\nSources:\n");
        for (title, uri) in &sources {
            links.push_str(&format!("- {title} ({uri})\n"));
        }
        sink.send(Event::TextDelta(links)).await;
    }
    if saw_usage {
        sink.send(Event::Usage(usage)).await;
    }

    Ok(())
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            web_search: true,
            url_fetch: true,
            tool_calls: true,
            force_tool: true,
            ..Default::default()
        }
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let (model, wants_thinking) = split_thinking_suffix(&request.model);
        let has_tools = !request.tools.is_empty();

        let mut payload = json!({
            "contents": wire_contents(&request.messages),
        });

        let system = request.system_prompt();
        if !system.is_empty() {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        if has_tools {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|tool: &ToolSpec| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": normalize_schema(&tool.parameters),
                    })
                })
                .collect();
            payload["tools"] = json!([{"functionDeclarations": declarations}]);

            let mode = match &request.tool_choice {
                crate::types::ToolChoice::Auto => json!({"mode": "AUTO"}),
                crate::types::ToolChoice::None => json!({"mode": "NONE"}),
                crate::types::ToolChoice::Required => json!({"mode": "ANY"}),
                crate::types::ToolChoice::Tool(name) => {
                    json!({"mode": "ANY", "allowedFunctionNames": [name]})
                }
            };
            payload["toolConfig"] = json!({"functionCallingConfig": mode});
        } else if request.search {
            payload["tools"] = json!([{"googleSearch": {}}]);
        }

        // Backend constraint: thinking configuration cannot ride along with
        // tools or native search.
        if wants_thinking && !has_tools && !request.search {
            payload["generationConfig"] =
                json!({"thinkingConfig": thinking_config(model, self.config.effort)});
        }

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url, model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(Error::Http)?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &headers, &body));
        }

        Ok(spawn_stream(DEFAULT_CAPACITY, move |sink| pump(response, sink)))
    }
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, client })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drops_unsupported_keywords() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "title": "Args",
            "additionalProperties": false,
            "properties": {
                "path": {"type": "string", "format": "uri", "pattern": "^/", "minLength": 1},
                "count": {"type": "integer", "minimum": 0, "default": 1, "examples": [2]}
            },
            "required": ["path"]
        });

        let normalized = normalize_schema(&schema);
        assert!(normalized.get("$schema").is_none());
        assert!(normalized.get("title").is_none());
        assert!(normalized.get("additionalProperties").is_none());
        assert!(normalized["properties"]["path"].get("format").is_none());
        assert!(normalized["properties"]["path"].get("pattern").is_none());
        assert!(normalized["properties"]["path"].get("minLength").is_none());
        assert!(normalized["properties"]["count"].get("default").is_none());
        assert!(normalized["properties"]["count"].get("examples").is_none());
    }

    #[test]
    fn test_normalize_requires_every_property() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "string"},
                "b": {"type": "integer"}
            },
            "required": ["a"]
        });

        let normalized = normalize_schema(&schema);
        let mut required: Vec<String> = normalized["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        required.sort();
        assert_eq!(required, vec!["a", "b"]);
    }

    #[test]
    fn test_normalize_recurses_into_nested_objects() {
        let schema = json!({
            "type": "object",
            "properties": {
                "filter": {
                    "type": "object",
                    "properties": {"q": {"type": "string", "const": "x"}},
                }
            }
        });

        let normalized = normalize_schema(&schema);
        assert_eq!(normalized["properties"]["filter"]["required"][0], "q");
        assert!(normalized["properties"]["filter"]["properties"]["q"]
            .get("const")
            .is_none());
    }

    #[test]
    fn test_normalize_array_items() {
        let schema = json!({
            "type": "object",
            "properties": {
                "names": {"type": "array", "items": {"type": "string", "maxLength": 8}, "maxItems": 5}
            }
        });
        let normalized = normalize_schema(&schema);
        assert!(normalized["properties"]["names"].get("maxItems").is_none());
        assert!(normalized["properties"]["names"]["items"]
            .get("maxLength")
            .is_none());
    }

    #[test]
    fn test_thinking_suffix_and_family_shape() {
        let (model, thinking) = split_thinking_suffix("gemini-2.5-pro-thinking");
        assert_eq!(model, "gemini-2.5-pro");
        assert!(thinking);

        let config = thinking_config("gemini-2.5-pro", ThinkingEffort::High);
        assert!(config.get("thinkingBudget").is_some());

        let config = thinking_config("gemini-3-pro", ThinkingEffort::Low);
        assert_eq!(config["thinkingLevel"], "low");
        assert!(config.get("thinkingBudget").is_none());
    }

    #[test]
    fn test_no_thinking_suffix() {
        let (model, thinking) = split_thinking_suffix("gemini-2.5-flash");
        assert_eq!(model, "gemini-2.5-flash");
        assert!(!thinking);
    }

    #[test]
    fn test_tool_results_become_function_responses() {
        let mut result = crate::types::ToolResultPart::new("c1", "file contents");
        result.name = "read_file".to_string();
        let messages = vec![Message::tool(vec![result])];
        let contents = wire_contents(&messages);
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["name"], "read_file");
    }
}
