//! Adapter for backends speaking the "responses" SSE event taxonomy.
//!
//! Two backends share this dialect, differing only in base URL and
//! credentials. The notable translation duties:
//!
//! - `system` content goes out under the `developer` role;
//! - when server-state mode is on and a previous response id is known, only
//!   the trailing user turn is sent (the server holds the rest); a 404
//!   means the server lost that state, so the id is cleared and the request
//!   retried once with full history;
//! - tool calls and reasoning items are both tracked by their stable
//!   `output_index` slot, never by the rewriteable `call_id`;
//! - reasoning blocks are replayed verbatim on later turns as `reasoning`
//!   input items carrying the opaque encrypted blob.

use crate::event::Event;
use crate::provider::{Capabilities, Provider};
use crate::providers::http_error;
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::types::{Message, Part, ReasoningMeta, Request, Role, ToolChoice, ToolSpec, Usage};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Configuration for a responses-style endpoint.
#[derive(Debug, Clone)]
pub struct ResponsesConfig {
    pub name: String,

    /// Full endpoint URL; requests POST here directly.
    pub url: String,

    pub api_key: Option<String>,

    /// Let the server hold conversation state between turns.
    pub server_state: bool,

    /// Forward the caller's session id as a `session_id` header and a
    /// `prompt_cache_key` body field to warm the backend's prompt cache.
    pub forward_session_id: bool,

    pub timeout: Duration,
}

impl ResponsesConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
            server_state: false,
            forward_session_id: false,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_server_state(mut self, enabled: bool) -> Self {
        self.server_state = enabled;
        self
    }

    pub fn with_session_forwarding(mut self, enabled: bool) -> Self {
        self.forward_session_id = enabled;
        self
    }
}

pub struct ResponsesProvider {
    config: ResponsesConfig,
    client: reqwest::Client,
    /// Response id from the previous completed turn, for server-state
    /// mode. Shared with the producer task that observes completion.
    previous_response_id: Arc<Mutex<Option<String>>>,
}

impl ResponsesProvider {
    pub fn new(config: ResponsesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            config,
            client,
            previous_response_id: Arc::new(Mutex::new(None)),
        })
    }

    fn wire_tools(tools: &[ToolSpec]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                    "strict": false,
                })
            })
            .collect()
    }

    fn wire_tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool(name) => json!({"type": "function", "name": name}),
        }
    }

    fn build_payload(&self, request: &Request, input: Vec<Value>, prev_id: Option<&str>) -> Value {
        let mut payload = json!({
            "model": request.model,
            "input": input,
            "tools": Self::wire_tools(&request.tools),
            "tool_choice": Self::wire_tool_choice(&request.tool_choice),
            "parallel_tool_calls": request.parallel_tool_calls,
            "stream": true,
            "store": self.config.server_state,
            "include": ["reasoning.encrypted_content"],
        });
        if let Some(id) = prev_id {
            payload["previous_response_id"] = json!(id);
        }
        if self.config.forward_session_id {
            if let Some(session) = &request.session_id {
                payload["prompt_cache_key"] = json!(session);
            }
        }
        payload
    }

    async fn send(&self, request: &Request, payload: &Value) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(payload);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        if self.config.forward_session_id {
            if let Some(session) = &request.session_id {
                req = req.header("session_id", session);
            }
        }
        req.send().await.map_err(Error::Http)
    }
}

/// Convert the full message list to responses-API input items.
fn full_input(messages: &[Message]) -> Vec<Value> {
    let mut input = Vec::new();
    for message in messages {
        match message.role {
            Role::System => input.push(json!({
                "type": "message",
                "role": "developer",
                "content": [{"type": "input_text", "text": message.text()}],
            })),
            Role::User => input.push(user_item(message)),
            Role::Assistant => assistant_items(message, &mut input),
            Role::Tool => {
                for result in message.tool_results() {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": result.call_id,
                        "output": result.text,
                    }));
                }
            }
        }
    }
    input
}

/// Server-state mode: only what the server has not seen yet, meaning the
/// trailing turn after the last assistant message (a fresh user turn, or
/// the tool outputs feeding back into the loop).
fn trailing_input(messages: &[Message]) -> Vec<Value> {
    let start = messages
        .iter()
        .rposition(|m| m.role == Role::Assistant)
        .map(|i| i + 1)
        .unwrap_or(0);
    full_input(&messages[start..])
}

fn user_item(message: &Message) -> Value {
    let content: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text, .. } => Some(json!({"type": "input_text", "text": text})),
            Part::Image { media_type, data, .. } => Some(json!({
                "type": "input_image",
                "image_url": format!("data:{media_type};base64,{data}"),
            })),
            _ => None,
        })
        .collect();
    json!({"type": "message", "role": "user", "content": content})
}

fn assistant_items(message: &Message, input: &mut Vec<Value>) {
    for part in &message.parts {
        match part {
            Part::Text { text, reasoning } => {
                // Replay the opaque reasoning block before the text it
                // accompanied, exactly as received.
                if let Some(meta) = reasoning {
                    if !meta.is_empty() {
                        let mut item = json!({"type": "reasoning", "summary": []});
                        if let Some(id) = &meta.item_id {
                            item["id"] = json!(id);
                        }
                        if let Some(blob) = &meta.encrypted_content {
                            item["encrypted_content"] = json!(blob);
                        }
                        if !meta.summary.is_empty() {
                            item["summary"] =
                                json!([{"type": "summary_text", "text": meta.summary}]);
                        }
                        input.push(item);
                    }
                }
                if !text.is_empty() {
                    input.push(json!({
                        "type": "message",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
            }
            Part::ToolCall(call) => input.push(json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.name,
                "arguments": call.arguments,
            })),
            _ => {}
        }
    }
}

/// Per-slot accumulation state for function calls.
#[derive(Default)]
struct FunctionSlot {
    call_id: String,
    name: String,
    arguments: String,
}

/// Per-slot accumulation state for reasoning items.
#[derive(Default)]
struct ReasoningSlot {
    item_id: Option<String>,
    summary: String,
}

fn wire_usage(usage: &Value) -> Usage {
    Usage {
        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
        cached_tokens: usage["input_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        cache_write_tokens: 0,
    }
}

async fn pump(response: reqwest::Response, sink: EventSink) -> Result<Option<String>> {
    let mut events = response.bytes_stream().eventsource();

    let mut functions: BTreeMap<u64, FunctionSlot> = BTreeMap::new();
    let mut reasoning: BTreeMap<u64, ReasoningSlot> = BTreeMap::new();
    // Slots whose text already streamed as deltas; message items for these
    // are not re-emitted on done.
    let mut streamed_slots: HashSet<u64> = HashSet::new();
    let mut response_id = None;

    loop {
        let sse = tokio::select! {
            _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
            sse = events.next() => sse,
        };
        let Some(sse) = sse else { break };
        let sse = sse.map_err(|e| Error::stream(e.to_string()))?;
        if sse.data.is_empty() || sse.data == "[DONE]" {
            continue;
        }

        let frame: Value = match serde_json::from_str(&sse.data) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("skipping unparseable frame: {e}");
                continue;
            }
        };
        let kind = frame["type"].as_str().unwrap_or_default();
        let slot = frame["output_index"].as_u64().unwrap_or(0);

        match kind {
            "response.output_text.delta" => {
                streamed_slots.insert(slot);
                if let Some(delta) = frame["delta"].as_str() {
                    if !sink.send(Event::TextDelta(delta.to_string())).await {
                        return Err(Error::Cancelled);
                    }
                }
            }
            "response.output_item.added" => {
                let item = &frame["item"];
                match item["type"].as_str().unwrap_or_default() {
                    "function_call" => {
                        let entry = functions.entry(slot).or_default();
                        if let Some(id) = item["call_id"].as_str() {
                            entry.call_id = id.to_string();
                        }
                        if let Some(name) = item["name"].as_str() {
                            entry.name = name.to_string();
                        }
                    }
                    "reasoning" => {
                        let entry = reasoning.entry(slot).or_default();
                        entry.item_id = item["id"].as_str().map(str::to_string);
                    }
                    _ => {}
                }
            }
            "response.function_call_arguments.delta" => {
                if let Some(delta) = frame["delta"].as_str() {
                    functions.entry(slot).or_default().arguments.push_str(delta);
                }
            }
            "response.reasoning_summary_part.added" => {
                let entry = reasoning.entry(slot).or_default();
                if !entry.summary.is_empty() {
                    entry.summary.push('\n');
                }
            }
            "response.reasoning_summary_text.delta" => {
                if let Some(delta) = frame["delta"].as_str() {
                    reasoning.entry(slot).or_default().summary.push_str(delta);
                }
            }
            "response.output_item.done" => {
                let item = &frame["item"];
                match item["type"].as_str().unwrap_or_default() {
                    "function_call" => {
                        let mut slot_state = functions.remove(&slot).unwrap_or_default();
                        // The done frame carries the authoritative fields;
                        // deltas are only a fallback.
                        if let Some(id) = item["call_id"].as_str() {
                            slot_state.call_id = id.to_string();
                        }
                        if let Some(name) = item["name"].as_str() {
                            slot_state.name = name.to_string();
                        }
                        if let Some(args) = item["arguments"].as_str() {
                            slot_state.arguments = args.to_string();
                        }
                        if slot_state.name.is_empty() {
                            continue;
                        }
                        let call = crate::types::ToolCallPart::new(
                            slot_state.call_id,
                            slot_state.name,
                            slot_state.arguments,
                        );
                        if !sink.send(Event::ToolCall(call)).await {
                            return Err(Error::Cancelled);
                        }
                    }
                    "reasoning" => {
                        let slot_state = reasoning.remove(&slot).unwrap_or_default();
                        let mut summary = slot_state.summary;
                        if summary.is_empty() {
                            if let Some(parts) = item["summary"].as_array() {
                                summary = parts
                                    .iter()
                                    .filter_map(|p| p["text"].as_str())
                                    .collect::<Vec<_>>()
                                    .join("\n");
                            }
                        }
                        let meta = ReasoningMeta {
                            item_id: item["id"]
                                .as_str()
                                .map(str::to_string)
                                .or(slot_state.item_id),
                            encrypted_content: item["encrypted_content"]
                                .as_str()
                                .map(str::to_string),
                            summary,
                        };
                        if !sink.send(Event::ReasoningDelta(meta)).await {
                            return Err(Error::Cancelled);
                        }
                    }
                    "message" => {
                        // Some servers finalize assistant text without ever
                        // streaming deltas for it; emit it once.
                        if !streamed_slots.contains(&slot) {
                            let text: String = item["content"]
                                .as_array()
                                .map(|parts| {
                                    parts
                                        .iter()
                                        .filter_map(|p| p["text"].as_str())
                                        .collect::<Vec<_>>()
                                        .join("")
                                })
                                .unwrap_or_default();
                            if !text.is_empty() && !sink.send(Event::TextDelta(text)).await {
                                return Err(Error::Cancelled);
                            }
                        }
                    }
                    _ => {}
                }
            }
            "response.completed" => {
                response_id = frame["response"]["id"].as_str().map(str::to_string);
                let usage = &frame["response"]["usage"];
                if usage.is_object() {
                    sink.send(Event::Usage(wire_usage(usage))).await;
                }
            }
            "response.failed" => {
                let message = frame["response"]["error"]["message"]
                    .as_str()
                    .unwrap_or("response failed");
                return Err(Error::stream(message.to_string()));
            }
            _ => {}
        }
    }

    Ok(response_id)
}

#[async_trait]
impl Provider for ResponsesProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn credential_kind(&self) -> &str {
        if self.config.api_key.is_some() {
            "api-key"
        } else {
            "oauth"
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            web_search: true,
            tool_calls: true,
            force_tool: true,
            ..Default::default()
        }
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let prev_id = if self.config.server_state {
            self.previous_response_id
                .lock()
                .expect("previous response id lock poisoned")
                .clone()
        } else {
            None
        };

        let (input, sent_prev) = match &prev_id {
            Some(_) => (trailing_input(&request.messages), true),
            None => (full_input(&request.messages), false),
        };
        let payload = self.build_payload(&request, input, prev_id.as_deref());
        let mut response = self.send(&request, &payload).await?;

        // The server may have expired the stored conversation; fall back to
        // full history exactly once.
        if response.status() == reqwest::StatusCode::NOT_FOUND && sent_prev {
            log::debug!("previous response id rejected; retrying with full history");
            *self
                .previous_response_id
                .lock()
                .expect("previous response id lock poisoned") = None;
            let payload = self.build_payload(&request, full_input(&request.messages), None);
            response = self.send(&request, &payload).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &headers, &body));
        }

        let store_state = self.config.server_state;
        let id_slot = Arc::clone(&self.previous_response_id);
        let stream = spawn_stream(DEFAULT_CAPACITY, move |sink| async move {
            let response_id = pump(response, sink).await?;
            if store_state {
                if let Some(id) = response_id {
                    *id_slot
                        .lock()
                        .expect("previous response id lock poisoned") = Some(id);
                }
            }
            Ok(())
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallPart, ToolResultPart};

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::system("be brief"),
            Message::user("what changed"),
            Message::assistant(vec![
                Part::Text {
                    text: "checking".to_string(),
                    reasoning: Some(ReasoningMeta {
                        item_id: Some("rs_1".to_string()),
                        encrypted_content: Some("blob".to_string()),
                        summary: "plan".to_string(),
                    }),
                },
                Part::ToolCall(ToolCallPart::new("call_1", "shell", "{}")),
            ]),
            Message::tool(vec![ToolResultPart::new("call_1", "diff output")]),
            Message::user("summarize"),
        ]
    }

    #[test]
    fn test_full_input_shapes() {
        let input = full_input(&sample_messages());
        // developer msg, user msg, reasoning replay, assistant text,
        // function_call, function_call_output, trailing user msg.
        assert_eq!(input.len(), 7);
        assert_eq!(input[0]["role"], "developer");
        assert_eq!(input[2]["type"], "reasoning");
        assert_eq!(input[2]["encrypted_content"], "blob");
        assert_eq!(input[4]["type"], "function_call");
        assert_eq!(input[4]["call_id"], "call_1");
        assert_eq!(input[5]["type"], "function_call_output");
        assert_eq!(input[6]["content"][0]["text"], "summarize");
    }

    #[test]
    fn test_trailing_input_is_last_user_turn_only() {
        let input = trailing_input(&sample_messages());
        assert_eq!(input.len(), 1);
        assert_eq!(input[0]["role"], "user");
        assert_eq!(input[0]["content"][0]["text"], "summarize");
    }

    #[test]
    fn test_payload_session_forwarding() {
        let provider = ResponsesProvider::new(
            ResponsesConfig::new("resp", "https://example.test/responses")
                .with_session_forwarding(true),
        )
        .unwrap();
        let mut request = Request::new("m", vec![Message::user("hi")]);
        request.session_id = Some("sess-42".to_string());

        let payload = provider.build_payload(&request, full_input(&request.messages), None);
        assert_eq!(payload["prompt_cache_key"], "sess-42");
        assert_eq!(payload["store"], false);
        assert_eq!(payload["include"][0], "reasoning.encrypted_content");
    }

    #[test]
    fn test_payload_previous_response_id() {
        let provider = ResponsesProvider::new(
            ResponsesConfig::new("resp", "https://example.test/responses").with_server_state(true),
        )
        .unwrap();
        let request = Request::new("m", vec![Message::user("hi")]);
        let payload =
            provider.build_payload(&request, trailing_input(&request.messages), Some("resp_9"));
        assert_eq!(payload["previous_response_id"], "resp_9");
        assert_eq!(payload["store"], true);
    }

    #[test]
    fn test_wire_usage_mapping() {
        let usage = json!({
            "input_tokens": 50,
            "output_tokens": 9,
            "input_tokens_details": {"cached_tokens": 30}
        });
        let mapped = wire_usage(&usage);
        assert_eq!(mapped.input_tokens, 50);
        assert_eq!(mapped.cached_tokens, 30);
    }
}
