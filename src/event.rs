//! The streamed event vocabulary shared by every backend.

use crate::types::{FileDiff, ReasoningMeta, ToolCallPart, Usage};
use std::path::PathBuf;
use std::time::Duration;

/// One streamed event.
///
/// Every adapter translates its wire frames into this sequence; the engine
/// adds tool-execution lifecycle events of its own. Mid-stream failures are
/// not events but `Err` items on the stream, delivered before end-of-stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Incremental assistant text.
    TextDelta(String),

    /// One completed reasoning block with its replay metadata.
    ReasoningDelta(ReasoningMeta),

    /// A fully accumulated tool call. Adapters never emit partial calls.
    ToolCall(ToolCallPart),

    /// The engine is about to execute a registered tool.
    ToolExecStart {
        id: String,
        name: String,
        /// Short user-facing description of what this call will do.
        preview: String,
    },

    /// A registered tool finished executing.
    ToolExecEnd {
        id: String,
        name: String,
        success: bool,
        output: String,
        diffs: Vec<FileDiff>,
        image_paths: Vec<PathBuf>,
    },

    /// Token accounting for the turn.
    Usage(Usage),

    /// Informational phase marker. A `WARNING:` prefix signals that the
    /// message should be shown to the user.
    Phase(String),

    /// The retry wrapper is about to re-issue the request.
    Retry {
        attempt: u32,
        max_attempts: u32,
        wait: Duration,
    },

    /// Terminal event: the turn (or agentic loop) completed normally.
    Done,
}

impl Event {
    /// True for the terminal `Done` event.
    pub fn is_done(&self) -> bool {
        matches!(self, Event::Done)
    }

    /// The delta text, when this is a text delta.
    pub fn as_text_delta(&self) -> Option<&str> {
        match self {
            Event::TextDelta(text) => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_detection() {
        assert!(Event::Done.is_done());
        assert!(!Event::TextDelta("hi".to_string()).is_done());
    }

    #[test]
    fn test_phase_warning_convention() {
        let phase = Event::Phase("WARNING: context nearly full".to_string());
        if let Event::Phase(text) = &phase {
            assert!(text.starts_with("WARNING:"));
        }
    }
}
