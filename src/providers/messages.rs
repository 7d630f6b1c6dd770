//! Adapter for backends exposing a "messages with tool_use content blocks"
//! API.
//!
//! System content goes out in the dedicated `system` field; everything else
//! becomes ordered content blocks. Streaming frames arrive as typed SSE
//! events (`message_start`, `content_block_*`, `message_delta`,
//! `message_stop`); tool_use blocks are accumulated by their block index,
//! which stays stable across the start/delta/stop frames of a block.
//!
//! One documented backend constraint: a per-model thinking budget and a
//! forced tool choice cannot be combined. When both are requested the
//! adapter keeps the thinking budget and degrades the forced choice to
//! prompt-level guidance.

use crate::event::Event;
use crate::provider::{Capabilities, Provider};
use crate::providers::http_error;
use crate::sse::{sse_payloads, ToolCallAccumulator};
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::types::{Message, Part, ReasoningMeta, Request, Role, ToolChoice, ToolSpec, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Configuration for a messages-style endpoint.
#[derive(Debug, Clone)]
pub struct MessagesConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,

    /// Thinking token budget per turn. `None` disables extended thinking.
    pub thinking_budget: Option<u32>,

    pub max_tokens: u32,
    pub timeout: Duration,
}

impl MessagesConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            thinking_budget: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_thinking_budget(mut self, budget: u32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }
}

pub struct MessagesProvider {
    config: MessagesConfig,
    client: reqwest::Client,
}

impl MessagesProvider {
    pub fn new(config: MessagesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, client })
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect()
    }

    fn wire_tool_choice(choice: &ToolChoice) -> Option<Value> {
        match choice {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(json!({"type": "none"})),
            ToolChoice::Required => Some(json!({"type": "any"})),
            ToolChoice::Tool(name) => Some(json!({"type": "tool", "name": name})),
        }
    }

    fn build_payload(&self, request: &Request) -> Value {
        let system = request.system_prompt();
        let mut guidance: Option<String> = None;

        let thinking_on = self.config.thinking_budget.is_some();
        let tool_choice = if thinking_on {
            // Thinking and forced choice are mutually exclusive on this
            // backend; keep thinking, steer through the prompt instead.
            guidance = request.tool_choice.prompt_guidance();
            None
        } else {
            Self::wire_tool_choice(&request.tool_choice)
        };

        let mut messages = wire_messages(&request.messages);
        if let Some(guidance) = guidance {
            messages.push(json!({
                "role": "user",
                "content": [{"type": "text", "text": guidance}],
            }));
        }

        let mut payload = json!({
            "model": request.model,
            "max_tokens": self.config.max_tokens,
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            payload["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(Self::wire_tools(&request.tools));
        }
        if let Some(choice) = tool_choice {
            payload["tool_choice"] = choice;
        }
        if let Some(budget) = self.config.thinking_budget {
            payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        payload
    }
}

/// Convert history to wire messages. System messages are excluded (they
/// ride the dedicated field); tool messages become user-role tool_result
/// blocks per this dialect.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => out.push(json!({
                "role": "user",
                "content": content_blocks(message),
            })),
            Role::Assistant => out.push(json!({
                "role": "assistant",
                "content": content_blocks(message),
            })),
            Role::Tool => {
                let blocks: Vec<Value> = message
                    .tool_results()
                    .map(|result| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": result.call_id,
                            "content": result.text,
                            "is_error": result.is_error,
                        })
                    })
                    .collect();
                out.push(json!({"role": "user", "content": blocks}));
            }
        }
    }
    out
}

fn content_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    for part in &message.parts {
        match part {
            Part::Text { text, reasoning } => {
                // Replay the thinking block ahead of its text; the
                // signature rides back exactly as received.
                if let Some(meta) = reasoning {
                    if !meta.is_empty() && message.role == Role::Assistant {
                        blocks.push(json!({
                            "type": "thinking",
                            "thinking": meta.summary,
                            "signature": meta.encrypted_content.clone().unwrap_or_default(),
                        }));
                    }
                }
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
            }
            Part::Image { media_type, data, .. } => blocks.push(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            })),
            Part::ToolCall(call) => blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call
                    .parsed_arguments()
                    .unwrap_or_else(|_| json!({})),
            })),
            Part::ToolResult(_) => {}
        }
    }
    blocks
}

async fn pump(response: reqwest::Response, sink: EventSink) -> Result<()> {
    let mut payloads = sse_payloads(response);
    let mut calls = ToolCallAccumulator::new();
    let mut usage = Usage::default();
    // Thinking text and signature accumulate per block and flush as one
    // reasoning delta at block stop.
    let mut thinking = String::new();
    let mut signature = String::new();

    loop {
        let payload = tokio::select! {
            _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
            payload = payloads.next() => payload,
        };
        let Some(payload) = payload else { break };
        let frame: Value = serde_json::from_str(&payload?)
            .map_err(|e| Error::stream(format!("malformed frame: {e}")))?;

        let slot = frame["index"].as_u64().unwrap_or(0) as u32;
        match frame["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let wire = &frame["message"]["usage"];
                usage.input_tokens = wire["input_tokens"].as_u64().unwrap_or(0);
                usage.cached_tokens = wire["cache_read_input_tokens"].as_u64().unwrap_or(0);
                usage.cache_write_tokens =
                    wire["cache_creation_input_tokens"].as_u64().unwrap_or(0);
            }
            "content_block_start" => {
                let block = &frame["content_block"];
                if block["type"] == "tool_use" {
                    calls.fragment(
                        slot,
                        block["id"].as_str(),
                        block["name"].as_str(),
                        None,
                    );
                }
            }
            "content_block_delta" => match frame["delta"]["type"].as_str().unwrap_or_default() {
                "text_delta" => {
                    if let Some(text) = frame["delta"]["text"].as_str() {
                        if !sink.send(Event::TextDelta(text.to_string())).await {
                            return Err(Error::Cancelled);
                        }
                    }
                }
                "input_json_delta" => {
                    calls.fragment(slot, None, None, frame["delta"]["partial_json"].as_str());
                }
                "thinking_delta" => {
                    if let Some(text) = frame["delta"]["thinking"].as_str() {
                        thinking.push_str(text);
                    }
                }
                "signature_delta" => {
                    if let Some(text) = frame["delta"]["signature"].as_str() {
                        signature.push_str(text);
                    }
                }
                _ => {}
            },
            "content_block_stop" => {
                if let Some(call) = calls.take_slot(slot) {
                    if !sink.send(Event::ToolCall(call)).await {
                        return Err(Error::Cancelled);
                    }
                } else if !thinking.is_empty() || !signature.is_empty() {
                    let meta = ReasoningMeta {
                        item_id: None,
                        encrypted_content: (!signature.is_empty())
                            .then(|| std::mem::take(&mut signature)),
                        summary: std::mem::take(&mut thinking),
                    };
                    if !sink.send(Event::ReasoningDelta(meta)).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
            "message_delta" => {
                if let Some(output) = frame["usage"]["output_tokens"].as_u64() {
                    usage.output_tokens = output;
                }
            }
            "message_stop" => {
                sink.send(Event::Usage(usage)).await;
            }
            "error" => {
                let message = frame["error"]["message"].as_str().unwrap_or("stream error");
                return Err(Error::stream(message.to_string()));
            }
            _ => {}
        }
    }

    // Flush calls the server never closed with a stop frame.
    for call in calls.take_completed() {
        sink.send(Event::ToolCall(call)).await;
    }

    Ok(())
}

#[async_trait]
impl Provider for MessagesProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tool_calls: true,
            // Forcing is unavailable once a thinking budget is configured.
            force_tool: self.config.thinking_budget.is_none(),
            ..Default::default()
        }
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let payload = self.build_payload(&request);
        let url = format!("{}/v1/messages", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallPart, ToolResultPart};

    fn provider(thinking: Option<u32>) -> MessagesProvider {
        let mut config = MessagesConfig::new("msg", "https://example.test", "key");
        config.thinking_budget = thinking;
        MessagesProvider::new(config).unwrap()
    }

    #[test]
    fn test_system_rides_dedicated_field() {
        let request = Request::new(
            "model-x",
            vec![Message::system("be brief"), Message::user("hi")],
        );
        let payload = provider(None).build_payload(&request);
        assert_eq!(payload["system"], "be brief");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
        assert_eq!(payload["messages"][0]["role"], "user");
    }

    #[test]
    fn test_tool_results_become_user_blocks() {
        let request = Request::new(
            "model-x",
            vec![
                Message::user("go"),
                Message::assistant(vec![Part::ToolCall(ToolCallPart::new(
                    "c1",
                    "shell",
                    r#"{"cmd":"ls"}"#,
                ))]),
                Message::tool(vec![ToolResultPart::error("c1", "permission denied")]),
            ],
        );
        let payload = provider(None).build_payload(&request);
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["cmd"], "ls");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["is_error"], true);
    }

    #[test]
    fn test_thinking_excludes_forced_choice() {
        let mut request = Request::new("model-x", vec![Message::user("go")]);
        request.tools = vec![ToolSpec::new("shell", "run", json!({"type": "object"}))];
        request.tool_choice = ToolChoice::Tool("shell".to_string());

        let payload = provider(Some(4096)).build_payload(&request);
        assert!(payload.get("tool_choice").is_none());
        assert_eq!(payload["thinking"]["budget_tokens"], 4096);
        // Forced choice degraded to prompt guidance.
        let messages = payload["messages"].as_array().unwrap();
        let last = messages.last().unwrap();
        assert!(last["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("shell"));
    }

    #[test]
    fn test_forced_choice_without_thinking() {
        let mut request = Request::new("model-x", vec![Message::user("go")]);
        request.tool_choice = ToolChoice::Tool("shell".to_string());
        let payload = provider(None).build_payload(&request);
        assert_eq!(payload["tool_choice"]["type"], "tool");
        assert_eq!(payload["tool_choice"]["name"], "shell");
    }

    #[test]
    fn test_thinking_replay_block() {
        let message = Message::assistant(vec![Part::Text {
            text: String::new(),
            reasoning: Some(ReasoningMeta {
                item_id: None,
                encrypted_content: Some("sig".to_string()),
                summary: "thought hard".to_string(),
            }),
        }]);
        let blocks = content_blocks(&message);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["signature"], "sig");
    }

    #[test]
    fn test_thinking_and_text_in_one_part_yield_both_blocks() {
        let message = Message::assistant(vec![Part::Text {
            text: "the answer".to_string(),
            reasoning: Some(ReasoningMeta {
                item_id: None,
                encrypted_content: Some("sig".to_string()),
                summary: "worked it out".to_string(),
            }),
        }]);
        let blocks = content_blocks(&message);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[1]["type"], "text");
        assert_eq!(blocks[1]["text"], "the answer");
    }
}
