//! CCW server: JSON-RPC dispatch over the counterfactual execution engine.
//!
//! The dispatcher is single-threaded: one request at a time, engine state
//! mutated only from handlers. Stdout carries responses, stderr carries logs.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

pub mod resources;
pub mod rpc;
pub mod tools;

use rpc::{error_response, success_response, Params, RpcError, PROTOCOL_VERSION};

pub use ccw_capsule::CapsuleRegistry;
pub use ccw_policy::PolicyEngine;
pub use ccw_witness::WitnessEngine;

/// Server state: the registry, witness engine, and policy store over one
/// storage directory.
pub struct Server {
    storage_dir: PathBuf,
    pub capsules: CapsuleRegistry,
    pub witnesses: WitnessEngine,
    pub policies: PolicyEngine,
}

impl Server {
    /// Initialize the server over a storage directory and rehydrate any
    /// persisted capsules and witness records.
    pub fn new(storage_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(storage_dir)
            .with_context(|| format!("Failed to create {}", storage_dir.display()))?;

        let mut server = Self {
            storage_dir: storage_dir.to_path_buf(),
            capsules: CapsuleRegistry::new(&storage_dir.join("capsules"))?,
            witnesses: WitnessEngine::new(&storage_dir.join("witnesses"))?,
            policies: PolicyEngine::new(),
        };
        let capsules = server.capsules.rehydrate_on_startup();
        let witnesses = server.witnesses.rehydrate_on_startup();
        info!(
            storage = %storage_dir.display(),
            capsules,
            witnesses,
            "server initialized"
        );
        Ok(server)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Parse one raw message and handle it. Returns the response to emit,
    /// if any.
    pub fn handle_line(&mut self, line: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(line) {
            Ok(request) => self.handle_request(request),
            Err(e) => Some(error_response(
                Value::Null,
                &RpcError::Parse(e.to_string()),
            )),
        }
    }

    /// Handle one decoded JSON-RPC request.
    ///
    /// Requests without an `id` are notifications: they are executed but
    /// never answered, not even on failure.
    pub fn handle_request(&mut self, request: Value) -> Option<Value> {
        let Some(obj) = request.as_object() else {
            return Some(error_response(
                Value::Null,
                &RpcError::InvalidRequest("not an object".to_string()),
            ));
        };

        let id = obj.get("id").cloned();
        let is_notification = id.is_none();
        let id = id.unwrap_or(Value::Null);

        let method = match obj.get("method").and_then(Value::as_str) {
            Some(method) if !method.is_empty() => method,
            _ => {
                if is_notification {
                    return None;
                }
                return Some(error_response(
                    id,
                    &RpcError::InvalidRequest("missing method".to_string()),
                ));
            }
        };
        let params = obj.get("params").cloned().unwrap_or_else(|| json!({}));

        if method == "initialized" {
            return None;
        }

        let outcome = self.dispatch(method, &params);
        if is_notification {
            if let Err(e) = outcome {
                error!(method, error = %e, "notification handler failed");
            }
            return None;
        }

        Some(match outcome {
            Ok(result) => success_response(id, result),
            Err(e) => {
                error!(method, error = %e, "request failed");
                error_response(id, &e)
            }
        })
    }

    fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize()),
            "tools/list" => Ok(tools::list_tools()),
            "tools/call" => {
                let p = Params::new(params);
                let name = p.required_str("name").map_err(|_| {
                    RpcError::InvalidParams("missing tool name".to_string())
                })?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                self.call_tool(name, &arguments)
            }
            "resources/list" => Ok(self.list_resources()),
            "resources/read" => {
                let p = Params::new(params);
                let uri = p
                    .required_str("uri")
                    .map_err(|_| RpcError::InvalidParams("missing URI".to_string()))?;
                Ok(self.read_resource(uri))
            }
            "prompts/list" => Ok(json!({ "prompts": [] })),
            "prompts/get" => {
                let p = Params::new(params);
                let name = p
                    .required_str("name")
                    .map_err(|_| RpcError::InvalidParams("missing prompt name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Ok(json!({
                    "name": name,
                    "messages": [{
                        "role": "user",
                        "content": [{"type": "text", "text": format!("Unknown prompt: {name}")}],
                    }],
                    "arguments": arguments,
                }))
            }
            "ping" => Ok(json!({ "ok": true })),
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "ccw-mcp",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {},
                "resources": {},
                "prompts": {},
                "sampling": {},
                "logging": {},
            },
        })
    }

    /// Release every live capsule's sandbox before exit.
    pub fn shutdown(&mut self) {
        info!("shutting down, cleaning up capsules");
        self.capsules.cleanup_all();
    }
}

/// Serve requests from stdin until end of input or shutdown flag.
pub fn run_stdio(server: &mut Server, shutdown: &AtomicBool) -> Result<()> {
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();
    let stdout = std::io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let Some(message) = rpc::read_message(&mut reader)? else {
            break;
        };
        if let Some(response) = server.handle_line(&message) {
            let mut out = stdout.lock();
            serde_json::to_writer(&mut out, &response)?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
    }

    server.shutdown();
    Ok(())
}
