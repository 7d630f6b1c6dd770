//! Loopback MCP-over-HTTP bridge for the subprocess backend.
//!
//! The CLI backend inverts control flow: mid-stream, the child process
//! calls *us* to execute tools. This module is the HTTP half of that
//! inversion: a minimal JSON-RPC service bound to a loopback port, guarded
//! by a bearer token, that translates MCP `tools/call` requests into the
//! adapter-supplied handler callback and returns text content.
//!
//! The bridge outlives individual turns (the child's view of url and token
//! must stay constant across `--resume` invocations) and is torn down only
//! by an explicit caller-invoked stop.

use crate::types::ToolSpec;
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Process-wide MCP call-id counter. Initialized at process start, never
/// reset.
static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a unique id for an inbound MCP tool invocation.
pub(crate) fn next_call_id() -> String {
    format!("mcp-{}", NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
}

/// Receives tool invocations from the child process.
///
/// Returns the result text and an error flag. Implementations route the
/// call to the active turn's dispatcher; a closed turn returns `Err` so the
/// child sees a failure instead of silently bypassing engine-level checks.
#[async_trait]
pub trait McpToolHandler: Send + Sync {
    async fn call(&self, call_id: &str, name: &str, arguments: Value) -> Result<(String, bool)>;
}

struct BridgeState {
    token: String,
    specs: Vec<ToolSpec>,
    handler: Arc<dyn McpToolHandler>,
}

/// The running bridge: url and token stay constant for its lifetime.
pub struct McpBridge {
    url: String,
    token: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl McpBridge {
    /// Bind a loopback port and start serving.
    pub async fn start(
        specs: Vec<ToolSpec>,
        handler: Arc<dyn McpToolHandler>,
    ) -> Result<McpBridge> {
        let token = mint_token();
        let state = Arc::new(BridgeState {
            token: token.clone(),
            specs,
            handler,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::subprocess(format!("mcp bridge bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::subprocess(format!("mcp bridge addr: {e}")))?;
        let url = format!("http://{addr}/mcp");

        let app = Router::new()
            .route("/mcp", post(handle_rpc))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                log::warn!("mcp bridge server error: {e}");
            }
        });

        log::debug!("mcp bridge listening at {url}");
        Ok(McpBridge {
            url,
            token,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Stop serving and wait for the task to wind down.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for McpBridge {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn mint_token() -> String {
    let bytes: [u8; 24] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn rpc_error(id: Value, code: i64, message: &str) -> Json<Value> {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    }))
}

fn rpc_result(id: Value, result: Value) -> Json<Value> {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn handle_rpc(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    // Bearer check before anything else; the port is loopback but other
    // local processes are not trusted.
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", state.token))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            rpc_error(Value::Null, -32000, "missing or invalid bearer token"),
        );
    }

    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();

    let response = match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "agent-relay",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "notifications/initialized" => Json(json!({"jsonrpc": "2.0"})),
        "tools/list" => {
            let tools: Vec<Value> = state
                .specs
                .iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "inputSchema": spec.parameters,
                    })
                })
                .collect();
            rpc_result(id, json!({"tools": tools}))
        }
        "tools/call" => {
            let name = request["params"]["name"].as_str().unwrap_or_default();
            let arguments = request["params"]["arguments"].clone();

            if !state.specs.iter().any(|spec| spec.name == name) {
                return (
                    StatusCode::OK,
                    rpc_error(id, -32602, &format!("unknown tool: {name}")),
                );
            }

            let call_id = next_call_id();
            match state.handler.call(&call_id, name, arguments).await {
                Ok((text, is_error)) => rpc_result(
                    id,
                    json!({
                        "content": [{"type": "text", "text": text}],
                        "isError": is_error,
                    }),
                ),
                Err(e) => rpc_error(id, -32603, &e.to_string()),
            }
        }
        other => rpc_error(id, -32601, &format!("unknown method: {other}")),
    };

    (StatusCode::OK, response)
}
