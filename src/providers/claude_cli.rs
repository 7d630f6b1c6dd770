//! Subprocess CLI adapter.
//!
//! This backend is a locally executed CLI that streams line-delimited JSON
//! frames on stdout while *also* initiating callbacks into this process for
//! tool execution (via the loopback MCP bridge). The moving parts per turn:
//!
//! - a child process, one invocation per turn, prompt piped via stdin
//!   (never argv: tool results can exceed argv size limits);
//! - a stdout reader task feeding a line channel and a stderr drain task;
//! - a single dispatcher task reading two inputs, the line channel and the
//!   turn's tool-request inbox, and emitting neutral events.
//!
//! **Ordering rule.** Stdout frames take priority: on every wakeup the
//! dispatcher drains all immediately-available frames before handling a
//! pending tool request, and then waits a short grace window (default
//! 75 ms, `AGENT_RELAY_CLI_GRACE_MS` override) for trailing text deltas.
//! This preserves the invariant that text appearing before a tool call in
//! the model's intent appears before the `ToolCall` event on our stream.
//!
//! The MCP bridge is started lazily on the first turn that carries tools
//! and then kept alive: the child's view of its url and token must stay
//! constant across `--resume` invocations. Teardown is explicit via
//! [`ClaudeCliProvider::cleanup_mcp`].
//!
//! Turn state machine: Idle -> Running (process started) -> Draining
//! (stdout closed) -> Done (wait returned, queued tool requests answered
//! with stream-closed errors).

use crate::event::Event;
use crate::mcp::{next_call_id, McpBridge, McpToolHandler};
use crate::provider::{Capabilities, Provider};
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::types::{
    Message, Part, ReasoningMeta, Request, Role, ToolCallPart, ToolExecutor, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Environment variable overriding the text-delta grace window, in
/// milliseconds. The only environment knob the core reads itself.
pub const GRACE_ENV: &str = "AGENT_RELAY_CLI_GRACE_MS";

const DEFAULT_GRACE: Duration = Duration::from_millis(75);

/// Truncation ladder for the overlong-prompt retry.
const TRUNCATION_LIMITS: &[usize] = &[20_000, 5_000];

/// Configuration for the subprocess backend.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    /// Executable name or path.
    pub binary: String,

    /// Clear the API-key environment variable so the CLI authenticates via
    /// its own OAuth session instead.
    pub force_oauth: bool,

    /// Grace window for trailing text deltas after a tool request wakes
    /// the dispatcher.
    pub grace: Duration,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        let grace = std::env::var(GRACE_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE);
        Self {
            binary: "claude".to_string(),
            force_oauth: true,
            grace,
        }
    }
}

/// One inverted tool invocation from the child, routed through the
/// dispatcher so event ordering stays centralized.
pub(crate) struct ClaudeToolRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    /// Carries (result text, is_error) back to the MCP handler.
    pub respond: oneshot::Sender<Result<(String, bool)>>,
}

/// The active turn's inbox. Held behind a mutex so the MCP handler can
/// find the current turn without keeping stale references alive.
type TurnSlot = Arc<Mutex<Option<mpsc::Sender<ClaudeToolRequest>>>>;

struct BridgeHandler {
    turn_slot: TurnSlot,
}

#[async_trait]
impl McpToolHandler for BridgeHandler {
    async fn call(&self, call_id: &str, name: &str, arguments: Value) -> Result<(String, bool)> {
        let inbox = self
            .turn_slot
            .lock()
            .expect("turn slot lock poisoned")
            .clone();
        // No active turn means the stream has closed: fail the child's
        // request rather than bypassing engine-level checks.
        let Some(inbox) = inbox else {
            return Err(Error::stream("stream closed"));
        };

        let (respond, response) = oneshot::channel();
        let request = ClaudeToolRequest {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
            respond,
        };
        inbox
            .send(request)
            .await
            .map_err(|_| Error::stream("stream closed"))?;
        response
            .await
            .map_err(|_| Error::stream("stream closed"))?
    }
}

/// Session carry-over between turns.
#[derive(Default)]
struct SessionState {
    /// CLI session id for `--resume`.
    id: Option<String>,
    /// How many history messages previous turns already delivered.
    sent_messages: usize,
}

pub struct ClaudeCliProvider {
    config: ClaudeCliConfig,
    session: Arc<Mutex<SessionState>>,
    mcp: tokio::sync::Mutex<Option<McpBridge>>,
    turn_slot: TurnSlot,
}

impl ClaudeCliProvider {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(SessionState::default())),
            mcp: tokio::sync::Mutex::new(None),
            turn_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Tear down the MCP bridge. Callers invoke this once the provider is
    /// no longer needed; turns themselves never stop the bridge.
    pub async fn cleanup_mcp(&self) {
        if let Some(bridge) = self.mcp.lock().await.take() {
            bridge.stop().await;
        }
    }

    /// Start the bridge on the first turn that carries tools. At most one
    /// bridge per adapter instance.
    async fn ensure_bridge(&self, request: &Request) -> Result<Option<(String, String)>> {
        if request.tools.is_empty() {
            let guard = self.mcp.lock().await;
            return Ok(guard.as_ref().map(|b| (b.url().to_string(), b.token().to_string())));
        }

        let mut guard = self.mcp.lock().await;
        if guard.is_none() {
            let handler = Arc::new(BridgeHandler {
                turn_slot: Arc::clone(&self.turn_slot),
            });
            let bridge = McpBridge::start(request.tools.clone(), handler).await?;
            *guard = Some(bridge);
        }
        Ok(guard.as_ref().map(|b| (b.url().to_string(), b.token().to_string())))
    }
}

/// Map a full model name onto the CLI's short names.
fn short_model_name(model: &str) -> &str {
    for short in ["opus", "sonnet", "haiku"] {
        if model.contains(short) {
            return short;
        }
    }
    model
}

/// Strip the `mcp__<server>__` namespace the CLI wraps around bridge tools.
fn strip_mcp_namespace(name: &str) -> &str {
    name.strip_prefix("mcp__")
        .and_then(|rest| rest.split_once("__"))
        .map(|(_, tool)| tool)
        .unwrap_or(name)
}

/// Render history into the single stdin prompt. System messages are
/// excluded (they ride `--append-system-prompt`); structured image parts
/// are omitted, the CLI reads local files from paths in the text itself.
fn render_prompt(messages: &[Message]) -> String {
    let relevant: Vec<&Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .collect();

    if let [only] = relevant.as_slice() {
        if only.role == Role::User {
            return only.text();
        }
    }

    let mut out = String::new();
    for message in relevant {
        let block = match message.role {
            Role::User => format!("User: {}\n", message.text()),
            Role::Assistant => {
                let mut text = message.text();
                for call in message.tool_calls() {
                    text.push_str(&format!("\n[called {}({})]", call.name, call.arguments));
                }
                format!("Assistant: {text}\n")
            }
            Role::Tool => {
                let mut text = String::new();
                for result in message.tool_results() {
                    text.push_str(&format!(
                        "Result of {}: {}\n",
                        if result.name.is_empty() { "tool" } else { &result.name },
                        result.text
                    ));
                }
                text
            }
            Role::System => unreachable!(),
        };
        out.push_str(&block);
    }
    out
}

/// Clamp every tool-result text to `limit` characters, for the overlong
/// prompt retry.
fn truncate_tool_results(messages: &[Message], limit: usize) -> Vec<Message> {
    messages
        .iter()
        .map(|message| {
            let parts = message
                .parts
                .iter()
                .map(|part| match part {
                    Part::ToolResult(result) if result.text.chars().count() > limit => {
                        let mut clipped = result.clone();
                        clipped.text = result.text.chars().take(limit).collect();
                        clipped.text.push_str("\n[result truncated]");
                        Part::ToolResult(clipped)
                    }
                    other => other.clone(),
                })
                .collect();
            Message::new(message.role, parts)
        })
        .collect()
}

/// What a completed dispatch learned from the frames.
#[derive(Default)]
struct DispatchReport {
    session_id: Option<String>,
    /// Text from the final `assistant` frame, used only when no deltas
    /// streamed during the turn.
    fallback_text: String,
    deltas_seen: bool,
    prompt_too_long: bool,
    error: Option<Error>,
}

async fn handle_frame(line: &str, report: &mut DispatchReport, sink: &EventSink) -> Result<()> {
    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(_) => {
            log::debug!("skipping non-json stdout line");
            return Ok(());
        }
    };

    match frame["type"].as_str().unwrap_or_default() {
        "system" => {
            if let Some(id) = frame["session_id"].as_str() {
                report.session_id = Some(id.to_string());
            }
        }
        "stream_event" => {
            let event = &frame["event"];
            if event["type"] == "content_block_delta" {
                match event["delta"]["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            report.deltas_seen = true;
                            if !sink.send(Event::TextDelta(text.to_string())).await {
                                return Err(Error::Cancelled);
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = event["delta"]["thinking"].as_str() {
                            sink.send(Event::ReasoningDelta(ReasoningMeta {
                                summary: text.to_string(),
                                ..Default::default()
                            }))
                            .await;
                        }
                    }
                    _ => {}
                }
            }
        }
        "assistant" => {
            if let Some(blocks) = frame["message"]["content"].as_array() {
                for block in blocks {
                    if block["type"] == "text" {
                        if let Some(text) = block["text"].as_str() {
                            report.fallback_text.push_str(text);
                        }
                    }
                }
            }
        }
        "result" => {
            if let Some(id) = frame["session_id"].as_str() {
                report.session_id = Some(id.to_string());
            }
            let wire = &frame["usage"];
            if wire.is_object() {
                sink.send(Event::Usage(Usage {
                    input_tokens: wire["input_tokens"].as_u64().unwrap_or(0),
                    output_tokens: wire["output_tokens"].as_u64().unwrap_or(0),
                    cached_tokens: wire["cache_read_input_tokens"].as_u64().unwrap_or(0),
                    cache_write_tokens: wire["cache_creation_input_tokens"]
                        .as_u64()
                        .unwrap_or(0),
                }))
                .await;
            }
            // Rate limits and auth failures arrive here; they must surface
            // as errors rather than silent completion.
            let failed = frame["is_error"].as_bool().unwrap_or(false)
                || frame["subtype"].as_str().is_some_and(|s| s != "success");
            if failed {
                let text = frame["result"]
                    .as_str()
                    .unwrap_or("CLI reported an error")
                    .to_string();
                let lowered = text.to_lowercase();
                if lowered.contains("prompt is too long") {
                    report.prompt_too_long = true;
                } else if lowered.contains("rate limit") || lowered.contains("usage limit") {
                    report.error = Some(Error::rate_limit(text, Default::default()));
                } else if lowered.contains("auth") || lowered.contains("login") {
                    report.error = Some(Error::auth(text));
                } else {
                    report.error = Some(Error::subprocess(text));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

async fn handle_tool_request(
    request: ClaudeToolRequest,
    executor: Option<&Arc<dyn ToolExecutor>>,
    sink: &EventSink,
) -> Result<()> {
    let name = strip_mcp_namespace(&request.name).to_string();
    let call = ToolCallPart::new(request.call_id.clone(), name, request.arguments.to_string());

    if !sink.send(Event::ToolCall(call.clone())).await {
        let _ = request.respond.send(Err(Error::stream("stream closed")));
        return Err(Error::Cancelled);
    }

    let outcome = match executor {
        Some(executor) => {
            let result = executor.execute(&call).await;
            Ok((result.text, result.is_error))
        }
        None => Err(Error::tool("no tool executor configured for this turn")),
    };
    let _ = request.respond.send(outcome);
    Ok(())
}

/// The dispatcher core: one task, two inputs, events out.
///
/// Factored over plain channels so the ordering rules are testable without
/// a child process.
async fn dispatch(
    lines: &mut mpsc::Receiver<std::io::Result<String>>,
    inbox: &mut mpsc::Receiver<ClaudeToolRequest>,
    executor: Option<&Arc<dyn ToolExecutor>>,
    grace: Duration,
    sink: &EventSink,
) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();
    let mut inbox_open = true;

    // Running until stdout closes.
    loop {
        tokio::select! {
            biased;
            _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
            line = lines.recv() => match line {
                Some(Ok(line)) => handle_frame(&line, &mut report, sink).await?,
                Some(Err(e)) => {
                    return Err(Error::subprocess(format!("stdout read failed: {e}")));
                }
                None => break,
            },
            request = inbox.recv(), if inbox_open => match request {
                Some(request) => {
                    // Frames first: drain everything already queued, then
                    // hold the grace window open for trailing deltas, so
                    // text the model produced before the call stays ahead
                    // of the ToolCall event.
                    while let Ok(line) = lines.try_recv() {
                        match line {
                            Ok(line) => handle_frame(&line, &mut report, sink).await?,
                            Err(e) => {
                                return Err(Error::subprocess(format!(
                                    "stdout read failed: {e}"
                                )));
                            }
                        }
                    }
                    loop {
                        match timeout(grace, lines.recv()).await {
                            Ok(Some(Ok(line))) => {
                                handle_frame(&line, &mut report, sink).await?
                            }
                            Ok(Some(Err(e))) => {
                                return Err(Error::subprocess(format!(
                                    "stdout read failed: {e}"
                                )));
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    handle_tool_request(request, executor, sink).await?;
                }
                None => inbox_open = false,
            },
        }
    }

    // Draining: the turn's text is settled now. Fall back to the final
    // assistant frame only when nothing streamed.
    if !report.deltas_seen && !report.fallback_text.is_empty() && report.error.is_none() {
        let text = std::mem::take(&mut report.fallback_text);
        sink.send(Event::TextDelta(text)).await;
    }

    Ok(report)
}

/// Outcome of one CLI invocation.
enum TurnOutcome {
    Completed { session_id: Option<String> },
    PromptTooLong,
}

struct TurnParams {
    binary: String,
    force_oauth: bool,
    model: String,
    resume: Option<String>,
    system_prompt: String,
    bridge: Option<(String, String)>,
    grace: Duration,
}

async fn run_turn(
    params: &TurnParams,
    prompt: String,
    executor: Option<&Arc<dyn ToolExecutor>>,
    turn_slot: &TurnSlot,
    sink: &EventSink,
) -> Result<TurnOutcome> {
    let mut cmd = Command::new(&params.binary);
    cmd.arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--include-partial-messages")
        .arg("--verbose")
        .arg("--strict-mcp-config")
        .arg("--dangerously-skip-permissions")
        .arg("--max-turns")
        .arg("1")
        .arg("--model")
        .arg(short_model_name(&params.model));
    if let Some(session) = &params.resume {
        cmd.arg("--resume").arg(session);
    }
    if !params.system_prompt.is_empty() {
        cmd.arg("--append-system-prompt").arg(&params.system_prompt);
    }
    if let Some((url, token)) = &params.bridge {
        let mcp_config = serde_json::json!({
            "mcpServers": {
                "agent": {
                    "type": "http",
                    "url": url,
                    "headers": {"Authorization": format!("Bearer {token}")},
                }
            }
        });
        cmd.arg("--mcp-config").arg(mcp_config.to_string());
    }
    if params.force_oauth {
        cmd.env_remove("ANTHROPIC_API_KEY");
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Idle -> Running.
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::subprocess(format!("failed to launch {}: {e}", params.binary)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::subprocess("child stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::subprocess("child stdout unavailable"))?;
    let stderr = child.stderr.take();

    // The prompt rides stdin; argv has size limits and tool results do not.
    stdin
        .write_all(prompt.as_bytes())
        .await
        .map_err(|e| Error::subprocess(format!("writing prompt failed: {e}")))?;
    drop(stdin);

    let (line_tx, mut lines) = mpsc::channel::<std::io::Result<String>>(64);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(Ok(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = line_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    if let Some(mut stderr) = stderr {
        tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            if !buffer.trim().is_empty() {
                log::debug!("cli stderr: {}", buffer.trim());
            }
        });
    }

    // The turn bridge: its lifetime is exactly this invocation's.
    let (tool_tx, mut inbox) = mpsc::channel::<ClaudeToolRequest>(8);
    *turn_slot.lock().expect("turn slot lock poisoned") = Some(tool_tx);

    let dispatched = dispatch(&mut lines, &mut inbox, executor, params.grace, sink).await;

    // Draining -> Done: drop the inbox so late MCP calls fail fast, answer
    // anything already queued, and reap the child.
    *turn_slot.lock().expect("turn slot lock poisoned") = None;
    inbox.close();
    while let Ok(request) = inbox.try_recv() {
        let _ = request.respond.send(Err(Error::stream("stream closed")));
    }

    let report = match dispatched {
        Ok(report) => report,
        Err(e) => {
            // Non-EOF dispatch failure: kill rather than orphan.
            let _ = child.kill().await;
            return Err(e);
        }
    };

    let status = tokio::select! {
        _ = sink.cancellation().cancelled() => {
            let _ = child.kill().await;
            return Err(Error::Cancelled);
        }
        status = child.wait() => {
            status.map_err(|e| Error::subprocess(format!("wait failed: {e}")))?
        }
    };

    if report.prompt_too_long {
        return Ok(TurnOutcome::PromptTooLong);
    }
    if let Some(error) = report.error {
        return Err(error);
    }
    if !status.success() && report.session_id.is_none() {
        return Err(Error::subprocess(format!(
            "CLI exited with status {status}"
        )));
    }

    Ok(TurnOutcome::Completed {
        session_id: report.session_id,
    })
}

#[async_trait]
impl Provider for ClaudeCliProvider {
    fn name(&self) -> &str {
        "claude-cli"
    }

    fn credential_kind(&self) -> &str {
        "oauth"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            web_search: true,
            url_fetch: true,
            tool_calls: true,
            force_tool: false,
            manages_context: true,
        }
    }

    async fn stream(&self, request: Request) -> Result<EventStream> {
        let bridge = self.ensure_bridge(&request).await?;

        let (resume, skip) = {
            let session = self.session.lock().expect("session lock poisoned");
            (session.id.clone(), session.sent_messages)
        };

        // On resume the CLI holds the prior conversation; send only what it
        // has not seen. The system prompt is re-extracted from the full
        // list every turn so it persists across invocations.
        let new_messages: Vec<Message> = if resume.is_some() && skip < request.messages.len() {
            request.messages[skip..].to_vec()
        } else {
            request.messages.clone()
        };

        let params = TurnParams {
            binary: self.config.binary.clone(),
            force_oauth: self.config.force_oauth,
            model: request.model.clone(),
            resume,
            system_prompt: request.system_prompt(),
            bridge,
            grace: self.config.grace,
        };
        let executor = request.executor.clone();
        let session = Arc::clone(&self.session);
        let turn_slot = Arc::clone(&self.turn_slot);
        let total_messages = request.messages.len();

        let stream = spawn_stream(DEFAULT_CAPACITY, move |sink| async move {
            let mut messages = new_messages;
            let mut prompt = render_prompt(&messages);
            let mut attempt = 0usize;

            loop {
                let outcome =
                    run_turn(&params, prompt.clone(), executor.as_ref(), &turn_slot, &sink).await?;

                match outcome {
                    TurnOutcome::Completed { session_id } => {
                        let mut state = session.lock().expect("session lock poisoned");
                        if let Some(id) = session_id {
                            state.id = Some(id);
                        }
                        state.sent_messages = total_messages;
                        return Ok(());
                    }
                    TurnOutcome::PromptTooLong => {
                        let Some(&limit) = TRUNCATION_LIMITS.get(attempt) else {
                            return Err(Error::subprocess(
                                "prompt is too long even after truncating tool results",
                            ));
                        };
                        attempt += 1;
                        messages = truncate_tool_results(&messages, limit);
                        let truncated = render_prompt(&messages);
                        if truncated.len() >= prompt.len() {
                            // Truncation did not shrink anything; retrying
                            // would loop.
                            return Err(Error::subprocess(
                                "prompt is too long and tool results cannot be truncated further",
                            ));
                        }
                        log::debug!(
                            "prompt too long; retrying with tool results clamped to {limit} chars"
                        );
                        prompt = truncated;
                    }
                }
            }
        });

        Ok(stream)
    }
}
