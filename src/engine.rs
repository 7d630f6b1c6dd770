//! The agentic engine: repeated provider turns with tool execution.
//!
//! `Engine::stream` drives the whole loop. It asks the provider to speak,
//! forwards text and reasoning to the caller as they stream, intercepts
//! tool-call events, executes registered tools (sequentially or with a
//! structured parallel join), appends the call/result exchange to history,
//! and reinvokes the provider until the model stops requesting tools or the
//! turn budget runs out.
//!
//! Backends that manage their own context (the subprocess CLI) run their
//! tool loop internally; for those the engine passes events through in a
//! single turn and injects its executor into the request so inverted tool
//! callbacks still route through engine-level execution and bookkeeping.

use crate::event::Event;
use crate::provider::Provider;
use crate::sanitize::sanitize_messages;
use crate::stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};
use crate::tools::{preview_from_args, ToolRegistry};
use crate::types::{
    Message, Part, ReasoningMeta, Request, ToolCallPart, ToolChoice, ToolExecutor,
    ToolResultPart, Usage,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Default turn budget for the agentic loop.
pub const DEFAULT_MAX_TURNS: u32 = 20;

/// System hint appended on the last allowed iteration.
const LAST_TURN_HINT: &str =
    "Do not call any tools. Use the information already retrieved and answer directly.";

/// Names of the engine-injected search tools. When the request asks for
/// search and the backend has no native equivalent, the engine offers these
/// from its registry.
pub const WEB_SEARCH_TOOL: &str = "web_search";
pub const READ_URL_TOOL: &str = "read_url";

/// Receives per-turn token accounting.
pub trait UsageLogger: Send + Sync {
    fn record(&self, provider: &str, model: &str, usage: &Usage);
}

/// Default logger: one `info!` line per turn.
pub struct LogUsage;

impl UsageLogger for LogUsage {
    fn record(&self, provider: &str, model: &str, usage: &Usage) {
        log::info!(
            "usage provider={provider} model={model} input={} output={} cached={} cache_write={}",
            usage.input_tokens,
            usage.output_tokens,
            usage.cached_tokens,
            usage.cache_write_tokens
        );
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct EngineOptions {
    /// Agentic loop budget when the request does not set one.
    pub max_turns: u32,

    /// Event channel capacity.
    pub capacity: usize,

    /// Per-turn usage recorder.
    pub usage_logger: Arc<dyn UsageLogger>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            capacity: DEFAULT_CAPACITY,
            usage_logger: Arc::new(LogUsage),
        }
    }
}

impl EngineOptions {
    /// Builder with validation; unset fields keep their defaults.
    pub fn builder() -> EngineOptionsBuilder {
        EngineOptionsBuilder::default()
    }
}

/// Builder for [`EngineOptions`].
#[derive(Default)]
pub struct EngineOptionsBuilder {
    max_turns: Option<u32>,
    capacity: Option<usize>,
    usage_logger: Option<Arc<dyn UsageLogger>>,
}

impl EngineOptionsBuilder {
    /// Sets the agentic loop budget.
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    /// Sets the event channel capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the per-turn usage recorder.
    pub fn usage_logger(mut self, logger: Arc<dyn UsageLogger>) -> Self {
        self.usage_logger = Some(logger);
        self
    }

    /// Validates and builds the final [`EngineOptions`].
    ///
    /// # Errors
    ///
    /// Returns an error when `max_turns` or `capacity` is zero.
    pub fn build(self) -> Result<EngineOptions> {
        let max_turns = self.max_turns.unwrap_or(DEFAULT_MAX_TURNS);
        if max_turns == 0 {
            return Err(Error::invalid_input("max_turns must be greater than 0"));
        }
        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY);
        if capacity == 0 {
            return Err(Error::invalid_input("capacity must be greater than 0"));
        }
        Ok(EngineOptions {
            max_turns,
            capacity,
            usage_logger: self.usage_logger.unwrap_or_else(|| Arc::new(LogUsage)),
        })
    }
}

/// The agentic surface: owns a provider and a tool registry for its
/// lifetime, produces one event stream per submitted turn.
pub struct Engine {
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    options: EngineOptions,
}

impl Engine {
    pub fn new(provider: Arc<dyn Provider>, registry: ToolRegistry) -> Self {
        Self::with_options(provider, registry, EngineOptions::default())
    }

    pub fn with_options(
        provider: Arc<dyn Provider>,
        registry: ToolRegistry,
        options: EngineOptions,
    ) -> Self {
        Self {
            provider,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Submit one caller turn and stream the resulting events.
    pub fn stream(&self, request: Request) -> EventStream {
        let provider = Arc::clone(&self.provider);
        let registry = self.registry.clone();
        let options = self.options.clone();

        spawn_stream(options.capacity, move |sink| async move {
            run(provider, registry, options, request, sink).await
        })
    }
}

async fn run(
    provider: Arc<dyn Provider>,
    registry: ToolRegistry,
    options: EngineOptions,
    mut request: Request,
    sink: EventSink,
) -> Result<()> {
    let caps = provider.capabilities();

    // Offer the engine's search tools when the caller wants search and the
    // backend cannot do it natively.
    if request.search && !(caps.web_search && caps.url_fetch) {
        inject_search_tools(&registry, &mut request);
    }

    // Backends that cannot force a specific call get prompt-level guidance
    // instead.
    if !caps.force_tool {
        if let Some(guidance) = request.tool_choice.prompt_guidance() {
            request.messages.push(Message::system(guidance));
            request.tool_choice = ToolChoice::Auto;
        }
    }

    request.messages = sanitize_messages(&request.messages);

    let looping = !request.tools.is_empty() && caps.tool_calls && !caps.manages_context;
    if !looping {
        if caps.manages_context {
            // Inverted flow: the backend calls us back for tool execution.
            request.executor = Some(Arc::new(EngineExecutor {
                registry: registry.clone(),
                sink: sink.clone(),
            }));
        }
        return passthrough(provider, options, request, sink).await;
    }

    let original_choice = request.tool_choice.clone();
    let mut forced_retry_used = false;
    let max_turns = if request.max_turns == 0 {
        options.max_turns
    } else {
        request.max_turns
    };

    for turn in 0..max_turns {
        let last_allowed = turn + 1 == max_turns;
        if last_allowed {
            request.messages.push(Message::system(LAST_TURN_HINT));
            if let Some(choice) = request.last_turn_tool_choice.clone() {
                request.tool_choice = choice;
            }
        }

        let turn_output = collect_turn(&provider, &options, &request, &sink).await?;
        let mut calls = turn_output.calls;

        // A forced choice applies to one provider call only; holding it
        // across turns would loop the same tool forever.
        request.tool_choice = ToolChoice::Auto;

        if calls.is_empty() {
            if matches!(original_choice, ToolChoice::Tool(_)) && turn == 0 && !forced_retry_used {
                // Forced choice produced a text-only reply: restore it for
                // exactly one more attempt.
                forced_retry_used = true;
                request.tool_choice = original_choice.clone();
                continue;
            }
            send_done(&sink).await;
            return Ok(());
        }

        ensure_call_ids(&mut calls);
        dedup_by_id(&mut calls);

        // Registered calls are ours to execute; the caller owns the rest.
        let (registered, unregistered): (Vec<_>, Vec<_>) = calls
            .into_iter()
            .partition(|call| registry.contains(&call.name));

        for call in &unregistered {
            if !sink.send(Event::ToolCall(call.clone())).await {
                return Err(Error::Cancelled);
            }
        }
        if registered.is_empty() {
            send_done(&sink).await;
            return Ok(());
        }

        let mut results = Vec::with_capacity(registered.len());
        let mut finishing = false;
        if request.parallel_tool_calls {
            let joined = tokio::select! {
                _ = sink.cancellation().cancelled() => return Err(Error::Cancelled),
                joined = futures::future::join_all(
                    registered
                        .iter()
                        .map(|call| execute_call(&registry, &sink, call)),
                ) => joined,
            };
            for (result, finished) in joined {
                finishing |= finished;
                results.push(result);
            }
        } else {
            for call in &registered {
                if sink.is_closed() {
                    return Err(Error::Cancelled);
                }
                let (result, finished) = execute_call(&registry, &sink, call).await;
                finishing |= finished;
                results.push(result);
            }
        }

        request.messages.push(Message::assistant(assistant_parts(
            turn_output.text,
            turn_output.reasoning,
            registered,
        )));
        request.messages.push(Message::tool(results));

        // Search tools are an opening move; later turns work from what was
        // already retrieved.
        request.search = false;

        if finishing {
            send_done(&sink).await;
            return Ok(());
        }
    }

    Err(Error::MaxTurnsExceeded(max_turns))
}

/// Single provider turn without the loop: forward everything, then `Done`.
async fn passthrough(
    provider: Arc<dyn Provider>,
    options: EngineOptions,
    request: Request,
    sink: EventSink,
) -> Result<()> {
    let provider_name = provider.name().to_string();
    let model = request.model.clone();
    let mut stream = provider.stream(request).await?;

    loop {
        let item = tokio::select! {
            _ = sink.cancellation().cancelled() => {
                stream.close();
                return Err(Error::Cancelled);
            }
            item = stream.recv() => item,
        };
        match item {
            Some(Ok(Event::Done)) => {}
            Some(Ok(Event::Usage(usage))) => {
                options.usage_logger.record(&provider_name, &model, &usage);
                if !sink.send(Event::Usage(usage)).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Ok(event)) => {
                if !sink.send(event).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    send_done(&sink).await;
    Ok(())
}

/// Everything one provider turn produced: the tool calls to act on, plus
/// the assistant text and reasoning blocks that preceded them, which must
/// survive into history so the next turn can replay them.
#[derive(Default)]
struct TurnOutput {
    calls: Vec<ToolCallPart>,
    text: String,
    reasoning: Vec<ReasoningMeta>,
}

/// Run one provider turn, forwarding non-tool-call events and collecting
/// the turn's tool calls, text, and reasoning.
async fn collect_turn(
    provider: &Arc<dyn Provider>,
    options: &EngineOptions,
    request: &Request,
    sink: &EventSink,
) -> Result<TurnOutput> {
    let mut stream = provider.stream(request.clone()).await?;
    let mut output = TurnOutput::default();

    loop {
        let item = tokio::select! {
            _ = sink.cancellation().cancelled() => {
                stream.close();
                return Err(Error::Cancelled);
            }
            item = stream.recv() => item,
        };
        match item {
            Some(Ok(Event::ToolCall(call))) => output.calls.push(call),
            Some(Ok(Event::Done)) => {}
            Some(Ok(Event::Usage(usage))) => {
                options
                    .usage_logger
                    .record(provider.name(), &request.model, &usage);
                if !sink.send(Event::Usage(usage)).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Ok(Event::TextDelta(text))) => {
                output.text.push_str(&text);
                if !sink.send(Event::TextDelta(text)).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Ok(Event::ReasoningDelta(meta))) => {
                output.reasoning.push(meta.clone());
                if !sink.send(Event::ReasoningDelta(meta)).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Ok(event)) => {
                if !sink.send(event).await {
                    return Err(Error::Cancelled);
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    Ok(output)
}

/// Assemble the assistant message appended after a tool round: reasoning
/// blocks first (replayed verbatim next turn), then the streamed text,
/// then the tool calls.
fn assistant_parts(
    text: String,
    mut reasoning: Vec<ReasoningMeta>,
    calls: Vec<ToolCallPart>,
) -> Vec<Part> {
    let mut parts = Vec::new();
    let last_meta = reasoning.pop();
    for meta in reasoning {
        parts.push(Part::Text {
            text: String::new(),
            reasoning: Some(meta),
        });
    }
    match last_meta {
        Some(meta) => parts.push(Part::Text {
            text,
            reasoning: Some(meta),
        }),
        None if !text.is_empty() => parts.push(Part::text(text)),
        None => {}
    }
    parts.extend(calls.into_iter().map(Part::ToolCall));
    parts
}

/// Execute one registered call, bracketed by exec lifecycle events.
///
/// Tool failures are not fatal: the error text becomes an `is_error`
/// result and the loop continues.
async fn execute_call(
    registry: &ToolRegistry,
    sink: &EventSink,
    call: &ToolCallPart,
) -> (ToolResultPart, bool) {
    let tool = registry.get(&call.name);

    let args = call.parsed_arguments();
    let preview = match (&tool, &args) {
        (Some(tool), Ok(args)) => tool
            .preview(args)
            .unwrap_or_else(|| preview_from_args(args, 5, 500)),
        (_, Ok(args)) => preview_from_args(args, 5, 500),
        (_, Err(_)) => format!("({})", call.arguments),
    };

    sink.send(Event::ToolExecStart {
        id: call.id.clone(),
        name: call.name.clone(),
        preview,
    })
    .await;

    let outcome = match (tool, args) {
        (Some(tool), Ok(args)) => tool.execute(args).await.map(|out| (out, tool.is_finishing())),
        (Some(_), Err(e)) => Err(Error::tool(format!("invalid arguments: {e}"))),
        (None, _) => Err(Error::tool(format!("tool not registered: {}", call.name))),
    };

    let (result, finishing) = match outcome {
        Ok((output, finishing)) => {
            let mut result = ToolResultPart::new(&call.id, output.text.clone());
            result.name = call.name.clone();
            result.content = output.content;
            result.diffs = output.diffs;
            result.image_paths = output.image_paths;
            result.thought_signature = call.thought_signature.clone();
            (result, finishing)
        }
        Err(e) => {
            log::warn!("tool {} failed: {e}", call.name);
            let mut result = ToolResultPart::error(&call.id, e.to_string());
            result.name = call.name.clone();
            result.thought_signature = call.thought_signature.clone();
            (result, false)
        }
    };

    sink.send(Event::ToolExecEnd {
        id: call.id.clone(),
        name: call.name.clone(),
        success: !result.is_error,
        output: result.text.clone(),
        diffs: result.diffs.clone(),
        image_paths: result.image_paths.clone(),
    })
    .await;

    (result, finishing)
}

/// Executor handed to self-managing backends so inverted tool callbacks
/// flow through the same execution path as loop-mode calls.
struct EngineExecutor {
    registry: ToolRegistry,
    sink: EventSink,
}

#[async_trait]
impl ToolExecutor for EngineExecutor {
    async fn execute(&self, call: &ToolCallPart) -> ToolResultPart {
        let (result, _finishing) = execute_call(&self.registry, &self.sink, call).await;
        result
    }
}

fn inject_search_tools(registry: &ToolRegistry, request: &mut Request) {
    for name in [WEB_SEARCH_TOOL, READ_URL_TOOL] {
        if request.tools.iter().any(|t| t.name == name) {
            continue;
        }
        if let Some(tool) = registry.get(name) {
            request.tools.push(tool.spec());
        }
    }
}

fn ensure_call_ids(calls: &mut [ToolCallPart]) {
    for (index, call) in calls.iter_mut().enumerate() {
        if call.id.is_empty() {
            call.id = format!("toolcall-{index}");
        }
    }
}

/// Drop repeated calls sharing an id, keeping the first occurrence.
fn dedup_by_id(calls: &mut Vec<ToolCallPart>) {
    let mut seen = HashSet::new();
    calls.retain(|call| seen.insert(call.id.clone()));
}

async fn send_done(sink: &EventSink) {
    sink.send(Event::Done).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_call_ids_synthesizes_missing() {
        let mut calls = vec![
            ToolCallPart::new("", "a", "{}"),
            ToolCallPart::new("have-id", "b", "{}"),
            ToolCallPart::new("", "c", "{}"),
        ];
        ensure_call_ids(&mut calls);
        assert_eq!(calls[0].id, "toolcall-0");
        assert_eq!(calls[1].id, "have-id");
        assert_eq!(calls[2].id, "toolcall-2");
    }

    #[test]
    fn test_options_builder_defaults_and_validation() {
        let options = EngineOptions::builder().build().unwrap();
        assert_eq!(options.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(options.capacity, DEFAULT_CAPACITY);

        let options = EngineOptions::builder()
            .max_turns(5)
            .capacity(8)
            .build()
            .unwrap();
        assert_eq!(options.max_turns, 5);
        assert_eq!(options.capacity, 8);

        assert!(EngineOptions::builder().max_turns(0).build().is_err());
        assert!(EngineOptions::builder().capacity(0).build().is_err());
    }

    #[test]
    fn test_assistant_parts_carry_text_and_reasoning_before_calls() {
        let meta = ReasoningMeta {
            item_id: Some("rs_1".to_string()),
            encrypted_content: Some("blob".to_string()),
            summary: "plan".to_string(),
        };
        let parts = assistant_parts(
            "checking".to_string(),
            vec![meta.clone()],
            vec![ToolCallPart::new("c1", "shell", "{}")],
        );

        assert_eq!(parts.len(), 2);
        match &parts[0] {
            Part::Text { text, reasoning } => {
                assert_eq!(text, "checking");
                assert_eq!(reasoning.as_ref(), Some(&meta));
            }
            other => panic!("expected text part, got {other:?}"),
        }
        assert!(matches!(&parts[1], Part::ToolCall(call) if call.id == "c1"));
    }

    #[test]
    fn test_assistant_parts_multiple_reasoning_blocks_keep_order() {
        let metas: Vec<ReasoningMeta> = (0..3)
            .map(|i| ReasoningMeta {
                item_id: Some(format!("rs_{i}")),
                encrypted_content: Some(format!("blob-{i}")),
                summary: String::new(),
            })
            .collect();
        let parts = assistant_parts(String::new(), metas, vec![]);

        assert_eq!(parts.len(), 3);
        for (i, part) in parts.iter().enumerate() {
            match part {
                Part::Text { reasoning: Some(meta), .. } => {
                    assert_eq!(meta.item_id.as_deref(), Some(format!("rs_{i}").as_str()));
                }
                other => panic!("expected reasoning carrier, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_assistant_parts_calls_only() {
        let parts = assistant_parts(
            String::new(),
            vec![],
            vec![ToolCallPart::new("c1", "shell", "{}")],
        );
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], Part::ToolCall(_)));
    }

    #[test]
    fn test_dedup_by_id_keeps_first() {
        let mut calls = vec![
            ToolCallPart::new("call-1", "a", r#"{"first":true}"#),
            ToolCallPart::new("call-1", "a", r#"{"first":false}"#),
            ToolCallPart::new("call-2", "b", "{}"),
        ];
        dedup_by_id(&mut calls);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].arguments.contains("true"));
    }
}
