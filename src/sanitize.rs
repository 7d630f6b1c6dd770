//! History sanitizer: enforces tool call/result pairing.
//!
//! Several backends reject requests containing dangling function calls.
//! This module is the single place that guarantees well-formed history
//! regardless of what the previous turn, an interrupt, or a prior
//! compaction left behind: every assistant tool call ends up with exactly
//! one matching result, orphaned results are dropped, and orphaned calls
//! are rewritten to visible text stubs so the model sees what it attempted
//! instead of silently losing context.

use crate::types::{Message, Part, ToolCallPart};
use std::collections::HashMap;
use std::collections::VecDeque;

/// Prefix of the text stub an orphaned tool call is rewritten to.
pub const INTERRUPTED_STUB_PREFIX: &str = "[tool call interrupted";

fn interrupted_stub(call: &ToolCallPart) -> String {
    format!(
        "[tool call interrupted - id:{} name:{} args:{}]",
        call.id, call.name, call.arguments
    )
}

/// Location of a pending (not yet answered) tool call in the output list.
struct PendingCall {
    message_index: usize,
    part_index: usize,
}

/// Normalize history so every tool call pairs with exactly one result.
///
/// The walk is order-preserving and deep-clones every part; arguments and
/// opaque blobs are copied, never shared with the input. Pending calls are
/// queued FIFO per id, which keeps repeated ids from buggy providers paired
/// in submission order. On well-formed input this is the identity, and the
/// function is idempotent.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    let mut output: Vec<Message> = Vec::with_capacity(messages.len());
    let mut pending: HashMap<String, VecDeque<PendingCall>> = HashMap::new();

    for message in messages {
        let message_index = output.len();
        let mut parts: Vec<Part> = Vec::with_capacity(message.parts.len());

        for part in &message.parts {
            match part {
                Part::ToolCall(call) => {
                    pending.entry(call.id.clone()).or_default().push_back(PendingCall {
                        message_index,
                        part_index: parts.len(),
                    });
                    parts.push(part.clone());
                }
                Part::ToolResult(result) => {
                    // Each result consumes the head reference for its id;
                    // unmatched results are discarded.
                    let matched = pending
                        .get_mut(&result.call_id)
                        .and_then(VecDeque::pop_front)
                        .is_some();
                    if matched {
                        parts.push(part.clone());
                    } else {
                        log::debug!(
                            "dropping orphaned tool result for call id {}",
                            result.call_id
                        );
                    }
                }
                other => parts.push(other.clone()),
            }
        }

        if !parts.is_empty() || message.parts.is_empty() {
            output.push(Message::new(message.role, parts));
        }
    }

    // Any call still pending never got a result: rewrite it in place to a
    // visible text part.
    for queue in pending.into_values() {
        for location in queue {
            let message = &mut output[location.message_index];
            if let Part::ToolCall(call) = &message.parts[location.part_index] {
                let stub = interrupted_stub(call);
                log::debug!("stubbing interrupted tool call id {}", call.id);
                message.parts[location.part_index] = Part::text(stub);
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Role, ToolResultPart};

    fn call(id: &str, name: &str, args: &str) -> Part {
        Part::ToolCall(ToolCallPart::new(id, name, args))
    }

    fn result(id: &str, text: &str) -> ToolResultPart {
        ToolResultPart::new(id, text)
    }

    #[test]
    fn test_well_formed_history_is_identity() {
        let messages = vec![
            Message::user("list the dir"),
            Message::assistant(vec![
                Part::text("on it"),
                call("c1", "shell", r#"{"cmd":"ls"}"#),
            ]),
            Message::tool(vec![result("c1", "a.txt b.txt")]),
            Message::assistant(vec![Part::text("two files")]),
        ];
        assert_eq!(sanitize_messages(&messages), messages);
    }

    #[test]
    fn test_orphaned_call_becomes_text_stub() {
        let messages = vec![
            Message::user("go"),
            Message::assistant(vec![
                Part::text("t"),
                call("c1", "shell", r#"{"cmd":"sleep"}"#),
            ]),
            Message::user("next"),
        ];

        let sanitized = sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 3);
        let stub = sanitized[1].parts[1].as_text().unwrap();
        assert!(stub.starts_with(INTERRUPTED_STUB_PREFIX));
        assert!(stub.contains("name:shell"));
        assert!(stub.contains(r#"args:{"cmd":"sleep"}"#));
    }

    #[test]
    fn test_orphaned_result_is_dropped() {
        let messages = vec![
            Message::user("go"),
            Message::tool(vec![result("ghost", "stale output")]),
            Message::assistant(vec![Part::text("done")]),
        ];

        let sanitized = sanitize_messages(&messages);
        // The tool message lost its only part and is dropped entirely.
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn test_batch_tool_message_keeps_matched_results_only() {
        let messages = vec![
            Message::assistant(vec![
                call("c1", "read_file", r#"{"path":"a"}"#),
                call("c2", "read_file", r#"{"path":"b"}"#),
            ]),
            Message::tool(vec![
                result("c1", "alpha"),
                result("ghost", "stale"),
                result("c2", "beta"),
            ]),
        ];

        let sanitized = sanitize_messages(&messages);
        let results: Vec<_> = sanitized[1].tool_results().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].call_id, "c1");
        assert_eq!(results[1].call_id, "c2");
    }

    #[test]
    fn test_repeated_ids_pair_fifo() {
        // A buggy provider reused the same id for two calls; only one
        // result arrived. The first call in submission order gets it.
        let messages = vec![
            Message::assistant(vec![call("dup", "shell", "{}")]),
            Message::assistant(vec![call("dup", "shell", "{}")]),
            Message::tool(vec![result("dup", "output")]),
        ];

        let sanitized = sanitize_messages(&messages);
        assert!(matches!(sanitized[0].parts[0], Part::ToolCall(_)));
        assert!(
            sanitized[1].parts[0]
                .as_text()
                .unwrap()
                .starts_with(INTERRUPTED_STUB_PREFIX)
        );
    }

    #[test]
    fn test_result_before_call_is_orphaned() {
        // Pairing is by conversation order: a result cannot answer a call
        // that has not happened yet.
        let messages = vec![
            Message::tool(vec![result("c1", "early")]),
            Message::assistant(vec![call("c1", "shell", "{}")]),
        ];

        let sanitized = sanitize_messages(&messages);
        assert_eq!(sanitized.len(), 1);
        assert!(
            sanitized[0].parts[0]
                .as_text()
                .unwrap()
                .starts_with(INTERRUPTED_STUB_PREFIX)
        );
    }

    #[test]
    fn test_idempotence() {
        let messages = vec![
            Message::user("go"),
            Message::assistant(vec![call("c1", "shell", "{}")]),
            Message::tool(vec![result("ghost", "stale")]),
        ];

        let once = sanitize_messages(&messages);
        let twice = sanitize_messages(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_deep_clone_does_not_share_with_input() {
        let messages = vec![Message::assistant(vec![call("c1", "shell", r#"{"cmd":"ls"}"#)])];
        let sanitized = sanitize_messages(&messages);
        // Orphan rewritten to text; original untouched.
        assert!(matches!(messages[0].parts[0], Part::ToolCall(_)));
        assert!(matches!(sanitized[0].parts[0], Part::Text { .. }));
    }

    #[test]
    fn test_empty_messages_preserved() {
        let messages = vec![Message::new(Role::User, vec![])];
        assert_eq!(sanitize_messages(&messages).len(), 1);
    }
}
