//! Streaming transport utilities: SSE payload extraction and slot-keyed
//! tool-call accumulation.
//!
//! Two problems recur across every HTTP adapter:
//!
//! 1. **SSE framing.** Backends stream `data: <json>` lines separated by
//!    blank lines, terminated by a `data: [DONE]` sentinel. HTTP chunking
//!    can split frames at arbitrary byte positions, so payload extraction
//!    has to buffer partial lines across chunks.
//!
//! 2. **Tool-call fragmentation.** Tool calls arrive as interleaved deltas
//!    spread over many frames. The one thing backends keep stable across
//!    the "added", "delta", and "done" frames of a call is its positional
//!    slot (`index` / `output_index`); the human-assigned call id is
//!    sometimes rewritten mid-call. [`ToolCallAccumulator`] therefore keys
//!    strictly by slot and treats the id as payload.

use crate::types::ToolCallPart;
use crate::{Error, Result};
use futures::stream::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::pin::Pin;

/// A stream of raw SSE `data:` payloads.
pub type SsePayloadStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Extract `data:` payloads from a streaming HTTP response body.
///
/// Partial lines are buffered across chunk boundaries; the `[DONE]`
/// sentinel and non-data lines (comments, event names, heartbeats) are
/// skipped. Event names matter to the responses-style backend, which embeds
/// the event type in the JSON payload itself, so dropping the `event:` line
/// loses nothing.
pub fn sse_payloads(response: reqwest::Response) -> SsePayloadStream {
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(Error::Http))
        .scan(String::new(), |buffer, chunk| {
            let payloads = match chunk {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    let mut out: Vec<Result<String>> = Vec::new();
                    // Consume complete lines, keep the partial tail.
                    while let Some(newline) = buffer.find('\n') {
                        let line: String = buffer.drain(..=newline).collect();
                        let line = line.trim_end_matches(['\n', '\r']);
                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim_start();
                            if data != "[DONE]" && !data.is_empty() {
                                out.push(Ok(data.to_string()));
                            }
                        }
                    }
                    out
                }
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(futures::stream::iter(payloads)))
        })
        .flatten();

    Box::pin(stream)
}

/// In-progress tool call assembled from deltas.
#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    thought_signature: Option<String>,
}

/// Accumulates fragmented tool calls keyed by the backend's stable slot.
///
/// Usage: feed every fragment with [`fragment`](Self::fragment) as frames
/// arrive, then call [`take_completed`](Self::take_completed) once the
/// stream flushes. Calls missing a name are dropped; calls missing an id
/// keep an empty id for the engine to synthesize one.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    // BTreeMap so completed calls flush in slot order.
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fragment for the call occupying `slot`.
    pub fn fragment(
        &mut self,
        slot: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments_delta: Option<&str>,
    ) {
        let entry = self.calls.entry(slot).or_default();
        if let Some(id) = id {
            // Later frames win: some backends rewrite the id between the
            // added and done frames of the same call.
            entry.id = Some(id.to_string());
        }
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        if let Some(args) = arguments_delta {
            entry.arguments.push_str(args);
        }
    }

    /// Attach an opaque thought signature to the call in `slot`.
    pub fn signature(&mut self, slot: u32, signature: &str) {
        self.calls.entry(slot).or_default().thought_signature = Some(signature.to_string());
    }

    /// True when no fragments have been recorded.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Flush all completed calls in slot order, resetting the accumulator.
    pub fn take_completed(&mut self) -> Vec<ToolCallPart> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter_map(|partial| {
                let name = partial.name?;
                Some(ToolCallPart {
                    id: partial.id.unwrap_or_default(),
                    name,
                    arguments: partial.arguments,
                    thought_signature: partial.thought_signature,
                })
            })
            .collect()
    }

    /// Flush a single slot, if it has a complete call.
    pub fn take_slot(&mut self, slot: u32) -> Option<ToolCallPart> {
        let partial = self.calls.remove(&slot)?;
        let name = partial.name?;
        Some(ToolCallPart {
            id: partial.id.unwrap_or_default(),
            name,
            arguments: partial.arguments,
            thought_signature: partial.thought_signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleaved_fragments_accumulate_by_slot() {
        let mut acc = ToolCallAccumulator::new();
        acc.fragment(0, Some("call_1"), Some("search"), None);
        acc.fragment(1, Some("call_2"), Some("calculate"), None);
        acc.fragment(0, None, None, Some(r#"{"q""#));
        acc.fragment(1, None, None, Some(r#"{"expr""#));
        acc.fragment(0, None, None, Some(r#":"rust"}"#));
        acc.fragment(1, None, None, Some(r#":"2+2"}"#));

        let calls = acc.take_completed();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, r#"{"q":"rust"}"#);
        assert_eq!(calls[1].name, "calculate");
        assert_eq!(calls[1].arguments, r#"{"expr":"2+2"}"#);
    }

    #[test]
    fn test_rewritten_id_last_wins() {
        let mut acc = ToolCallAccumulator::new();
        acc.fragment(0, Some("tmp_0"), Some("shell"), Some("{"));
        acc.fragment(0, Some("call_final"), None, Some("}"));

        let calls = acc.take_completed();
        assert_eq!(calls[0].id, "call_final");
        assert_eq!(calls[0].arguments, "{}");
    }

    #[test]
    fn test_nameless_call_dropped_idless_kept() {
        let mut acc = ToolCallAccumulator::new();
        acc.fragment(0, Some("call_1"), None, Some("{}"));
        acc.fragment(1, None, Some("shell"), Some("{}"));

        let calls = acc.take_completed();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "shell");
        assert!(calls[0].id.is_empty());
    }

    #[test]
    fn test_take_completed_resets() {
        let mut acc = ToolCallAccumulator::new();
        acc.fragment(0, Some("c"), Some("t"), None);
        assert_eq!(acc.take_completed().len(), 1);
        assert!(acc.is_empty());
        assert!(acc.take_completed().is_empty());
    }

    #[test]
    fn test_take_slot() {
        let mut acc = ToolCallAccumulator::new();
        acc.fragment(3, Some("c3"), Some("read_url"), Some("{}"));
        acc.signature(3, "sig-blob");
        let call = acc.take_slot(3).unwrap();
        assert_eq!(call.thought_signature.as_deref(), Some("sig-blob"));
        assert!(acc.take_slot(3).is_none());
    }
}
