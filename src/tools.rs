//! Tool definition, registry, and execution output.
//!
//! A tool exposes three things: its [`ToolSpec`] (what the model sees), a
//! [`preview`](Tool::preview) hook (the short line the UI shows while the
//! call runs, e.g. the file path being read), and an async
//! [`execute`](Tool::execute). Concrete tool implementations live outside
//! this crate; the engine only needs this shape plus the registry.

use crate::types::{FileDiff, ResultContent, ToolSpec};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Everything a tool execution can hand back to the model.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Plain-text result summary. Always present, possibly empty.
    pub text: String,

    /// Optional structured content for multimodal round-trip.
    pub content: Vec<ResultContent>,

    /// Structured diffs, for tools that edit files.
    pub diffs: Vec<FileDiff>,

    /// Paths of images the tool produced.
    pub image_paths: Vec<PathBuf>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A callable tool.
///
/// `is_finishing` marks tools whose execution terminates the agentic loop
/// regardless of whether the model requests more turns (the `FinishingTool`
/// role): the engine still surfaces every `tool_exec_end` for the turn, then
/// emits `Done`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    /// Short user-facing description of what this call will do, derived
    /// from the arguments (e.g. `/etc/hosts`). Return `None` to let the
    /// engine pretty-print the arguments instead.
    fn preview(&self, _args: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput>;

    /// True when executing this tool should end the agentic loop.
    fn is_finishing(&self) -> bool {
        false
    }
}

/// Name-keyed set of tools. Read-mostly after startup; registration takes
/// the write lock.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its spec name, replacing any previous entry.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(name, tool);
    }

    /// Remove a tool by name, returning whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .contains_key(name)
    }

    /// Specs of every registered tool, sorted by name for stable output.
    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .read()
            .expect("tool registry lock poisoned")
            .values()
            .map(|t| t.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .tools
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

/// Pretty-print call arguments for a preview line when the tool has no
/// preview hook: at most `max_keys` keys, truncated to `max_len` chars.
pub(crate) fn preview_from_args(args: &Value, max_keys: usize, max_len: usize) -> String {
    let rendered = match args {
        Value::Object(map) => {
            let mut pieces: Vec<String> = map
                .iter()
                .take(max_keys)
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}: {s}"),
                    other => format!("{k}: {other}"),
                })
                .collect();
            if map.len() > max_keys {
                pieces.push("...".to_string());
            }
            format!("({})", pieces.join(", "))
        }
        Value::Null => "()".to_string(),
        other => format!("({other})"),
    };

    if rendered.chars().count() > max_len {
        let truncated: String = rendered.chars().take(max_len).collect();
        format!("{truncated}...")
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(
                "echo",
                "Echo the input back",
                json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            )
        }

        fn preview(&self, args: &Value) -> Option<String> {
            args["text"].as_str().map(|s| format!("({s})"))
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text(args["text"].as_str().unwrap_or_default()))
        }
    }

    #[test]
    fn test_register_get_unregister() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert!(registry.contains("echo"));
        assert_eq!(registry.get("echo").unwrap().spec().name, "echo");
        assert_eq!(registry.specs().len(), 1);

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.get("echo").is_none());
    }

    #[tokio::test]
    async fn test_execute_and_preview() {
        let tool = EchoTool;
        assert_eq!(
            tool.preview(&json!({"text": "hi"})).as_deref(),
            Some("(hi)")
        );
        let out = tool.execute(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out.text, "hi");
        assert!(!tool.is_finishing());
    }

    #[test]
    fn test_preview_from_args_limits_keys() {
        let args = json!({
            "a": 1, "b": 2, "c": 3, "d": 4, "e": 5, "f": 6, "g": 7
        });
        let preview = preview_from_args(&args, 5, 500);
        assert!(preview.contains("..."));
        // 5 keys plus the ellipsis marker.
        assert_eq!(preview.matches(": ").count(), 5);
    }

    #[test]
    fn test_preview_from_args_truncates_length() {
        let args = json!({"text": "x".repeat(900)});
        let preview = preview_from_args(&args, 5, 500);
        assert!(preview.chars().count() <= 503);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_preview_from_non_object_args() {
        assert_eq!(preview_from_args(&json!(null), 5, 500), "()");
        assert_eq!(preview_from_args(&json!([1, 2]), 5, 500), "([1,2])");
    }
}
