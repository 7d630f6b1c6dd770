//! The uniform adapter surface every backend implements.

use crate::stream::EventStream;
use crate::types::Request;
use crate::Result;
use async_trait::async_trait;

/// What a backend can do natively.
///
/// The engine consults this to decide what to inject (search tools), what
/// to degrade (forced tool choice), and whether to run its own loop at all
/// (backends that manage their own context run their tool loop internally).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Backend performs web search itself; no search tool injection needed.
    pub web_search: bool,

    /// Backend fetches URLs itself.
    pub url_fetch: bool,

    /// Backend understands tool calling at all.
    pub tool_calls: bool,

    /// Backend can be forced to call one specific tool. When false the
    /// engine falls back to prompt-level guidance.
    pub force_tool: bool,

    /// Backend holds conversation state server-side (or in-process) and
    /// runs its own tool loop; the engine passes events through instead of
    /// looping, injecting only its executor.
    pub manages_context: bool,
}

/// A backend adapter: converts a [`Request`] into the backend's wire form,
/// opens a streaming transport, and translates inbound frames into neutral
/// events.
///
/// Contract highlights (shared by all adapters):
///
/// - non-2xx HTTP statuses are returned synchronously from `stream`, not as
///   stream items, so the retry wrapper can see them;
/// - 429 responses are parsed into [`crate::Error::RateLimit`] with
///   whatever reset hints the backend supplied;
/// - text deltas are emitted as they arrive, never buffered whole;
/// - tool calls are emitted only once fully accumulated.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable backend name, used in logs and usage records.
    fn name(&self) -> &str;

    /// Which kind of credential this adapter consumes (debug aid).
    fn credential_kind(&self) -> &str {
        "api-key"
    }

    fn capabilities(&self) -> Capabilities;

    /// Open one model turn. The request must not be retained past return.
    async fn stream(&self, request: Request) -> Result<EventStream>;
}
