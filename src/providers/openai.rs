//! Generic OpenAI-compatible adapter: streaming chat completions over SSE.
//!
//! Works against any server speaking the chat-completions dialect (hosted
//! REST APIs and local inference servers alike). Tool-call fragments are
//! accumulated by the `index` slot, reasoning deltas are surfaced when the
//! backend provides them, and the `/models` endpoint is exposed for listing.

use crate::event::Event;
use crate::provider::{Capabilities, Provider};
use crate::providers::http_error;
use crate::sse::{sse_payloads, ToolCallAccumulator};
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::types::{Message, Part, Request, Role, ToolChoice, ToolSpec, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Display name used in logs and usage records.
    pub name: String,

    /// Endpoint base, e.g. `https://api.example.com/v1`.
    pub base_url: String,

    /// Bearer token. Optional: local servers typically need none.
    pub api_key: Option<String>,

    /// HTTP timeout.
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// The adapter itself.
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

/// One entry from `GET /models`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub owned_by: Option<String>,
    /// Input/output price per token, parsed from string fields when the
    /// server reports them.
    #[serde(default, deserialize_with = "parse_price")]
    pub prompt_price: Option<f64>,
    #[serde(default, deserialize_with = "parse_price")]
    pub completion_price: Option<f64>,
}

fn parse_price<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }))
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelInfo>,
}

// Wire types for the streaming chunk format.

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning text, under either of the field names in the wild.
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<Value>,
    stream: bool,
    stream_options: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(Error::config("base_url must start with http:// or https://"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, client })
    }

    /// List the models the server advertises.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.config.base_url);
        let mut req = self.client.get(&url);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(Error::Http)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &headers, &body));
        }
        let list: ModelList = response.json().await.map_err(Error::Http)?;
        Ok(list.data)
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        let mut out = Vec::new();
        for message in messages {
            match message.role {
                Role::System => out.push(json!({
                    "role": "system",
                    "content": message.text(),
                })),
                Role::User => out.push(user_message(message)),
                Role::Assistant => out.push(assistant_message(message)),
                Role::Tool => {
                    // One wire message per result; this dialect has no batch
                    // tool message.
                    for result in message.tool_results() {
                        out.push(json!({
                            "role": "tool",
                            "tool_call_id": result.call_id,
                            "content": result.text,
                        }));
                    }
                }
            }
        }
        out
    }

    fn wire_tools(tools: &[ToolSpec]) -> Option<Vec<Value>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        )
    }

    fn wire_tool_choice(choice: &ToolChoice) -> Option<Value> {
        match choice {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(json!("none")),
            ToolChoice::Required => Some(json!("required")),
            ToolChoice::Tool(name) => Some(json!({
                "type": "function",
                "function": {"name": name},
            })),
        }
    }
}

/// Multimodal user content when images are present, plain string otherwise.
fn user_message(message: &Message) -> Value {
    let has_image = message
        .parts
        .iter()
        .any(|p| matches!(p, Part::Image { .. }));
    if !has_image {
        return json!({"role": "user", "content": message.text()});
    }

    let content: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => Some(json!({"type": "text", "text": text})),
            Part::Image { media_type, data, .. } => Some(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{media_type};base64,{data}")},
            })),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn assistant_message(message: &Message) -> Value {
    let mut wire = json!({"role": "assistant"});
    let text = message.text();
    if !text.is_empty() {
        wire["content"] = json!(text);
    }
    let calls: Vec<Value> = message
        .tool_calls()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {"name": call.name, "arguments": call.arguments},
            })
        })
        .collect();
    if !calls.is_empty() {
        wire["tool_calls"] = json!(calls);
    }
    wire
}

fn neutral_usage(wire: WireUsage) -> Usage {
    Usage {
        input_tokens: wire.prompt_tokens,
        output_tokens: wire.completion_tokens,
        cached_tokens: wire
            .prompt_tokens_details
            .map(|d| d.cached_tokens)
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

async fn pump(response: reqwest::Response, sink: EventSink) -> Result<()> {
    let mut payloads = sse_payloads(response);
    let mut accumulator = ToolCallAccumulator::new();
    let mut flushed = false;

    loop {
        let payload = tokio::select! {
            _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
            payload = payloads.next() => payload,
        };
        let Some(payload) = payload else { break };
        let payload = payload?;

        let chunk: Chunk = match serde_json::from_str(&payload) {
            Ok(chunk) => chunk,
            Err(e) => return Err(Error::stream(format!("malformed chunk: {e}"))),
        };

        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if !reasoning.is_empty() {
                    sink.send(Event::ReasoningDelta(crate::types::ReasoningMeta {
                        summary: reasoning,
                        ..Default::default()
                    }))
                    .await;
                }
            }
            if let Some(text) = choice.delta.content {
                if !text.is_empty() && !sink.send(Event::TextDelta(text)).await {
                    return Err(Error::Cancelled);
                }
            }
            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let function = delta.function.as_ref();
                    accumulator.fragment(
                        delta.index,
                        delta.id.as_deref(),
                        function.and_then(|f| f.name.as_deref()),
                        function.and_then(|f| f.arguments.as_deref()),
                    );
                }
            }
            if choice.finish_reason.is_some() && !flushed {
                flushed = true;
                for call in accumulator.take_completed() {
                    if !sink.send(Event::ToolCall(call)).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }

        if let Some(usage) = chunk.usage {
            sink.send(Event::Usage(neutral_usage(usage))).await;
        }
    }

    // Servers that drop the connection without a finish_reason still owe
    // the caller any fully accumulated calls.
    for call in accumulator.take_completed() {
        sink.send(Event::ToolCall(call)).await;
    }

    Ok(())
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn credential_kind(&self) -> &str {
        if self.config.api_key.is_some() {
            "api-key"
        } else {
            "none"
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_calls: true,
            force_tool: true,
            ..Default::default()
        }
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let wire = WireRequest {
            model: request.model.clone(),
            messages: Self::wire_messages(&request.messages),
            stream: true,
            stream_options: json!({"include_usage": true}),
            tools: Self::wire_tools(&request.tools),
            tool_choice: Self::wire_tool_choice(&request.tool_choice),
            parallel_tool_calls: (!request.tools.is_empty() && request.parallel_tool_calls)
                .then_some(true),
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let mut req = self.client.post(&url).json(&wire);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(Error::Http)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &headers, &body));
        }

        Ok(spawn_stream(DEFAULT_CAPACITY, move |sink| pump(response, sink)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallPart;
    use crate::types::ToolResultPart;

    #[test]
    fn test_wire_messages_roles() {
        let messages = vec![
            Message::system("be terse"),
            Message::user("hi"),
            Message::assistant(vec![
                Part::text("checking"),
                Part::ToolCall(ToolCallPart::new("c1", "shell", "{}")),
            ]),
            Message::tool(vec![
                ToolResultPart::new("c1", "ok"),
                ToolResultPart::new("c2", "ok2"),
            ]),
        ];

        let wire = OpenAiProvider::wire_messages(&messages);
        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[2]["tool_calls"][0]["function"]["name"], "shell");
        assert_eq!(wire[3]["role"], "tool");
        assert_eq!(wire[3]["tool_call_id"], "c1");
        assert_eq!(wire[4]["tool_call_id"], "c2");
    }

    #[test]
    fn test_user_message_multimodal() {
        let message = Message::new(
            Role::User,
            vec![
                Part::text("what is this"),
                Part::Image {
                    media_type: "image/png".to_string(),
                    data: "AAAA".to_string(),
                    path: None,
                },
            ],
        );
        let wire = user_message(&message);
        assert!(wire["content"].is_array());
        assert_eq!(wire["content"][1]["type"], "image_url");
        assert!(wire["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_wire_tool_choice() {
        assert!(OpenAiProvider::wire_tool_choice(&ToolChoice::Auto).is_none());
        assert_eq!(
            OpenAiProvider::wire_tool_choice(&ToolChoice::Required).unwrap(),
            json!("required")
        );
        let forced = OpenAiProvider::wire_tool_choice(&ToolChoice::Tool("x".into())).unwrap();
        assert_eq!(forced["function"]["name"], "x");
    }

    #[test]
    fn test_model_pricing_parsed_from_strings() {
        let raw = r#"{
            "id": "m-1",
            "created": 1700000000,
            "owned_by": "acme",
            "prompt_price": "0.000002",
            "completion_price": "0.000008"
        }"#;
        let model: ModelInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(model.prompt_price, Some(0.000002));
        assert_eq!(model.completion_price, Some(0.000008));
    }

    #[test]
    fn test_usage_mapping() {
        let wire: WireUsage = serde_json::from_str(
            r#"{"prompt_tokens": 100, "completion_tokens": 20,
                "prompt_tokens_details": {"cached_tokens": 60}}"#,
        )
        .unwrap();
        let usage = neutral_usage(wire);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cached_tokens, 60);
    }
}
