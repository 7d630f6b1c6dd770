//! # agent-relay
//!
//! Multi-provider streaming orchestration core for terminal AI agents.
//!
//! The crate presents one uniform surface over a heterogeneous set of LLM
//! backends: submit a turn, consume a typed event stream, let the engine
//! execute tools and loop until the model is done. Each backend keeps its
//! own wire format, streaming conventions, reasoning-replay rules, and
//! auth semantics behind a [`Provider`] adapter.
//!
//! ## Layers
//!
//! - **Data model** ([`types`], [`event`]): messages, parts, tool specs,
//!   and the neutral event vocabulary every adapter emits.
//! - **Streams** ([`stream`]): pull-style cursors over bounded channels,
//!   with producer lifecycle and cancellation built in.
//! - **Adapters** ([`providers`]): OpenAI-compatible chat completions, the
//!   responses SSE dialect, messages-style content blocks, a
//!   content-generation API, and a subprocess CLI tunneling tool calls
//!   back over a loopback MCP bridge.
//! - **Engine** ([`engine`]): the agentic loop. Streams the provider,
//!   intercepts tool calls, executes registered tools, feeds results back,
//!   and terminates on completion, a finishing tool, or the turn budget.
//! - **Reliability** ([`retry`], [`sanitize`]): transparent retry on rate
//!   limits and transient failures; history repair so every tool call
//!   pairs with a result.
//!
//! ## Example
//!
//! ```no_run
//! use agent_relay::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> agent_relay::Result<()> {
//! let provider = Arc::new(OpenAiProvider::new(
//!     OpenAiConfig::new("local", "http://localhost:1234/v1"),
//! )?);
//! let engine = Engine::new(provider, ToolRegistry::new());
//!
//! let request = Request::new("qwen2.5-32b-instruct", vec![Message::user("Hello")]);
//! let mut stream = engine.stream(request);
//! while let Some(event) = stream.recv().await {
//!     match event? {
//!         Event::TextDelta(text) => print!("{text}"),
//!         Event::Done => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// The agentic engine: provider turns, tool execution, loop termination.
mod engine;

/// Error types and the `Result` alias used across all public APIs.
mod error;

/// The neutral streamed event vocabulary.
mod event;

/// Loopback MCP-over-HTTP bridge used by the subprocess backend.
mod mcp;

/// The uniform `Provider` trait and backend capability flags.
mod provider;

/// History sanitizer: tool call/result pairing enforcement.
mod sanitize;

/// SSE payload extraction and slot-keyed tool-call accumulation.
mod sse;

/// Pull-style event streams over bounded channels.
mod stream;

/// Tool trait, registry, and execution output types.
mod tools;

/// Core data model: messages, parts, specs, requests, usage.
mod types;

/// Backend adapters, one module per backend family.
pub mod providers;

/// Transparent retry wrapper and backoff policy.
pub mod retry;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Engine ---

pub use engine::{
    Engine, EngineOptions, EngineOptionsBuilder, LogUsage, UsageLogger, DEFAULT_MAX_TURNS,
};

// --- Error Handling ---

pub use error::{Error, RateLimitInfo, Result};

// --- Events & Streams ---

pub use event::Event;
pub use stream::{spawn_stream, EventSink, EventStream, DEFAULT_CAPACITY};

// --- Providers ---

pub use provider::{Capabilities, Provider};
pub use providers::claude_cli::{ClaudeCliConfig, ClaudeCliProvider};
pub use providers::gemini::{GeminiConfig, GeminiProvider, ThinkingEffort};
pub use providers::messages::{MessagesConfig, MessagesProvider};
pub use providers::openai::{ModelInfo, OpenAiConfig, OpenAiProvider};
pub use providers::responses::{ResponsesConfig, ResponsesProvider};

// --- MCP Bridge ---

pub use mcp::{McpBridge, McpToolHandler};

// --- Sanitizer ---

pub use sanitize::sanitize_messages;

// --- Tools ---

pub use tools::{Tool, ToolOutput, ToolRegistry};

// --- Core Types ---

pub use types::{
    FileDiff, Message, Part, ReasoningMeta, Request, RequestBuilder, ResultContent, Role,
    ToolCallPart, ToolChoice, ToolExecutor, ToolResultPart, ToolSpec, Usage,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types most callers need, importable in one line.
pub mod prelude {
    pub use crate::{
        Capabilities, Engine, EngineOptions, Error, Event, EventStream, Message, OpenAiConfig,
        OpenAiProvider, Part, Provider, Request, Result, Role, Tool, ToolChoice, ToolOutput,
        ToolRegistry, ToolSpec, Usage,
    };
}
