//! Core data model shared by every backend adapter.
//!
//! The vocabulary here is deliberately provider-neutral: a conversation is a
//! list of [`Message`]s, each message an ordered list of [`Part`]s, and a
//! model turn is described by a [`Request`]. Adapters translate this model
//! to and from their wire formats; nothing in this module knows about HTTP,
//! SSE, or subprocess framing.
//!
//! Two pieces of the model are opaque by contract:
//!
//! - **Reasoning replay metadata** ([`ReasoningMeta`]): an item id, an
//!   encrypted blob, and a human-readable summary that some backends attach
//!   to their reasoning output. The only legal operations are extract on
//!   receive and replay verbatim on send. Implementations never parse the
//!   encrypted content.
//! - **Thought signatures** on tool calls and results: per-provider tokens
//!   carried round-trip untouched.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Identifies the sender of a message.
///
/// Serializes to lowercase strings (`"system"`, `"user"`, ...). Adapters map
/// this set onto whatever the backend uses; `System` content may become a
/// dedicated field, a `developer` role, or CLI instructions depending on the
/// adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and context that apply to the whole conversation.
    System,
    /// Input from the human or the calling application.
    User,
    /// Model output: text, reasoning, tool calls.
    Assistant,
    /// Tool execution results fed back to the model.
    Tool,
}

/// Opaque reasoning replay metadata.
///
/// These three fields travel together and are only meaningful to the adapter
/// that produced them. They are replayed verbatim on the next turn so the
/// model can resume its chain-of-thought state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReasoningMeta {
    /// Backend-assigned reasoning item id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,

    /// Encrypted reasoning blob. Never inspected, only replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,

    /// Human-readable reasoning summary, safe to display.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

impl ReasoningMeta {
    /// True when there is nothing to replay or display.
    pub fn is_empty(&self) -> bool {
        self.item_id.is_none() && self.encrypted_content.is_none() && self.summary.is_empty()
    }
}

/// A model-requested function invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPart {
    /// Call id joining this request to its result. Some backends rewrite
    /// ids between streaming frames, so adapters accumulate by positional
    /// slot and only surface the final id here.
    pub id: String,

    /// Tool name. Advisory for joining; the id is the sole join key.
    pub name: String,

    /// Raw JSON argument text, exactly as the backend produced it.
    pub arguments: String,

    /// Opaque per-provider signature carried round-trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl ToolCallPart {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            thought_signature: None,
        }
    }

    /// Parse the raw argument text. Empty arguments parse as `{}`.
    pub fn parsed_arguments(&self) -> crate::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments).map_err(Error::Json)
    }
}

/// One item of structured tool output, order-preserving.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultContent {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// A structured file diff attached to a tool result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDiff {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
}

/// The response to a [`ToolCallPart`], joined by `call_id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPart {
    /// Id of the tool call this result answers. The sole join key.
    pub call_id: String,

    /// Tool name, advisory only.
    #[serde(default)]
    pub name: String,

    /// Plain-text summary of the result.
    pub text: String,

    /// Optional structured content parts, order preserved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ResultContent>,

    /// Optional structured diffs produced by the tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<FileDiff>,

    /// Filesystem paths of images the tool produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_paths: Vec<PathBuf>,

    /// True when the tool failed; the model is expected to recover.
    #[serde(default)]
    pub is_error: bool,

    /// Round-tripped thought signature from the originating call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl ToolResultPart {
    pub fn new(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn error(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(call_id, text)
        }
    }
}

/// A single content part within a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Text content, optionally carrying reasoning replay metadata.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<ReasoningMeta>,
    },

    /// Image content for vision-capable backends.
    Image {
        media_type: String,
        /// Base64 payload.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },

    /// A model-requested function invocation.
    ToolCall(ToolCallPart),

    /// The response to a tool call.
    ToolResult(ToolResultPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text {
            text: text.into(),
            reasoning: None,
        }
    }

    /// Build an image part from raw bytes, encoding the payload.
    pub fn image_from_bytes(
        media_type: impl Into<String>,
        bytes: &[u8],
        path: Option<PathBuf>,
    ) -> crate::Result<Self> {
        let media_type = media_type.into();
        if !media_type.starts_with("image/") {
            return Err(Error::invalid_input(
                "media type must start with 'image/' (e.g. 'image/png')",
            ));
        }
        use base64::Engine as _;
        Ok(Part::Image {
            media_type,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            path,
        })
    }

    /// The text body if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            Part::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultPart> {
        match self {
            Part::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}

/// A complete message in a conversation.
///
/// Messages are append-only within a conversation: the engine never mutates
/// prior messages, only appends assistant and tool messages produced during
/// the agentic loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(parts: Vec<Part>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    /// A tool message carrying one or more results (batch execution).
    pub fn tool(results: Vec<ToolResultPart>) -> Self {
        Self::new(Role::Tool, results.into_iter().map(Part::ToolResult).collect())
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(Part::as_tool_call)
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultPart> {
        self.parts.iter().filter_map(Part::as_tool_result)
    }
}

/// Tool description handed to a backend.
///
/// `parameters` is a JSON-schema-shaped map. Adapters normalize it to their
/// backend's dialect (some require every property in `required`, some forbid
/// whole keyword families) before sending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// How strongly the backend is steered toward tool use.
///
/// Not every backend honors every mode; adapters that cannot force a
/// specific call degrade to prompt-level guidance via
/// [`ToolChoice::prompt_guidance`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force one specific tool by name.
    Tool(String),
}

impl ToolChoice {
    /// Prompt-level fallback for backends that cannot force a call.
    pub fn prompt_guidance(&self) -> Option<String> {
        match self {
            ToolChoice::Tool(name) => Some(format!(
                "You must call the `{name}` tool to answer this request."
            )),
            ToolChoice::Required => {
                Some("You must call one of the available tools to answer this request.".to_string())
            }
            _ => None,
        }
    }
}

/// Token accounting for one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        *self == Usage::default()
    }
}

/// Executor injected by the engine for backends with inverted tool flow.
///
/// The subprocess adapter's MCP bridge routes every tool invocation through
/// this hook so engine-level bookkeeping (exec events, registry lookup,
/// error capture) is never bypassed by the child process.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCallPart) -> ToolResultPart;
}

/// One model turn: everything an adapter needs to open a stream.
///
/// Requests are single-use; adapters may not retain them past `stream`
/// return. `Clone` exists so the retry wrapper can re-issue.
#[derive(Clone, Default)]
pub struct Request {
    /// Model identifier in the backend's namespace.
    pub model: String,

    /// Full conversation history, oldest first.
    pub messages: Vec<Message>,

    /// Tools offered to the model this turn.
    pub tools: Vec<ToolSpec>,

    pub tool_choice: ToolChoice,

    /// Run this turn's tool calls concurrently when true.
    pub parallel_tool_calls: bool,

    /// Ask for web search; the engine injects search tools when the
    /// backend has no native equivalent.
    pub search: bool,

    /// Caller-supplied session token forwarded to backends that support
    /// prompt caching.
    pub session_id: Option<String>,

    /// Tool choice to force on the final allowed loop iteration.
    pub last_turn_tool_choice: Option<ToolChoice>,

    /// Agentic loop budget. Zero means the engine default.
    pub max_turns: u32,

    /// Engine-injected executor for inverted tool flow (subprocess MCP).
    pub executor: Option<Arc<dyn ToolExecutor>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("model", &self.model)
            .field("messages", &self.messages.len())
            .field("tools", &self.tools.len())
            .field("tool_choice", &self.tool_choice)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .field("search", &self.search)
            .field("session_id", &self.session_id)
            .field("max_turns", &self.max_turns)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}

impl Request {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Builder with validation for requests with more than the basics set.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// The concatenated system prompt, extracted from the full message
    /// list. Backends that hold history server-side still need this every
    /// turn.
    pub fn system_prompt(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(Message::text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Builder for [`Request`].
///
/// `model` is required; everything else defaults the way
/// `Request::default()` does.
#[derive(Default)]
pub struct RequestBuilder {
    model: Option<String>,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
    tool_choice: ToolChoice,
    parallel_tool_calls: bool,
    search: bool,
    session_id: Option<String>,
    last_turn_tool_choice: Option<ToolChoice>,
    max_turns: u32,
}

impl RequestBuilder {
    /// Sets the model identifier (required).
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Appends one message to the conversation.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Appends multiple messages to the conversation.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Offers one tool to the model this turn.
    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    /// Offers multiple tools to the model this turn.
    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    pub fn search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    /// Sets the session token forwarded to prompt-caching backends.
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the tool choice forced on the final allowed loop iteration.
    pub fn last_turn_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.last_turn_tool_choice = Some(choice);
        self
    }

    /// Sets the agentic loop budget; zero means the engine default.
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = turns;
        self
    }

    /// Validates and builds the final [`Request`].
    ///
    /// # Errors
    ///
    /// Returns an error when the model is missing, empty, or whitespace.
    pub fn build(self) -> crate::Result<Request> {
        let model = self
            .model
            .ok_or_else(|| Error::config("model is required"))?;
        if model.trim().is_empty() {
            return Err(Error::invalid_input(
                "model cannot be empty or whitespace",
            ));
        }

        Ok(Request {
            model,
            messages: self.messages,
            tools: self.tools,
            tool_choice: self.tool_choice,
            parallel_tool_calls: self.parallel_tool_calls,
            search: self.search,
            session_id: self.session_id,
            last_turn_tool_choice: self.last_turn_tool_choice,
            max_turns: self.max_turns,
            executor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::from_str::<Role>("\"tool\"").unwrap(), Role::Tool);
    }

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "hello");

        let msg = Message::tool(vec![
            ToolResultPart::new("c1", "one"),
            ToolResultPart::new("c2", "two"),
        ]);
        assert_eq!(msg.tool_results().count(), 2);
    }

    #[test]
    fn test_tool_call_empty_arguments_parse_as_object() {
        let call = ToolCallPart::new("c1", "shell", "");
        assert_eq!(call.parsed_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn test_tool_call_invalid_arguments_error() {
        let call = ToolCallPart::new("c1", "shell", "{not json");
        assert!(call.parsed_arguments().is_err());
    }

    #[test]
    fn test_part_tagged_serialization() {
        let part = Part::ToolCall(ToolCallPart::new("c1", "read_file", r#"{"path":"x"}"#));
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["id"], "c1");

        let back: Part = serde_json::from_value(value).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_reasoning_meta_survives_round_trip() {
        let part = Part::Text {
            text: "summary shown to user".to_string(),
            reasoning: Some(ReasoningMeta {
                item_id: Some("rs_1".to_string()),
                encrypted_content: Some("opaque-blob".to_string()),
                summary: "thought about it".to_string(),
            }),
        };
        let json = serde_json::to_string(&part).unwrap();
        let back: Part = serde_json::from_str(&json).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn test_image_from_bytes_encodes_and_validates() {
        let part = Part::image_from_bytes("image/png", b"ABC", None).unwrap();
        match &part {
            Part::Image { media_type, data, .. } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "QUJD");
            }
            other => panic!("expected image part, got {other:?}"),
        }

        assert!(Part::image_from_bytes("text/plain", b"ABC", None).is_err());
    }

    #[test]
    fn test_tool_choice_prompt_guidance() {
        assert!(ToolChoice::Auto.prompt_guidance().is_none());
        let guidance = ToolChoice::Tool("web_search".to_string())
            .prompt_guidance()
            .unwrap();
        assert!(guidance.contains("web_search"));
    }

    #[test]
    fn test_request_builder() {
        let request = Request::builder()
            .model("qwen2.5-32b-instruct")
            .message(Message::system("be brief"))
            .message(Message::user("hi"))
            .tool(ToolSpec::new("shell", "run", serde_json::json!({"type": "object"})))
            .tool_choice(ToolChoice::Required)
            .parallel_tool_calls(true)
            .session_id("sess-1")
            .max_turns(5)
            .build()
            .unwrap();

        assert_eq!(request.model, "qwen2.5-32b-instruct");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tool_choice, ToolChoice::Required);
        assert!(request.parallel_tool_calls);
        assert_eq!(request.session_id.as_deref(), Some("sess-1"));
        assert_eq!(request.max_turns, 5);
        assert!(request.executor.is_none());
    }

    #[test]
    fn test_request_builder_requires_model() {
        assert!(Request::builder().message(Message::user("hi")).build().is_err());
        assert!(Request::builder().model("   ").build().is_err());
    }

    #[test]
    fn test_system_prompt_extraction() {
        let req = Request::new(
            "m",
            vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::system("be kind"),
            ],
        );
        assert_eq!(req.system_prompt(), "be brief\nbe kind");
    }
}
