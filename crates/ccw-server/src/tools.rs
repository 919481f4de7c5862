//! Tool handlers: the method table over the engine layers.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::rpc::{Params, RpcError};
use crate::Server;
use ccw_analysis::{analyze, minimize};
use ccw_cel::{CopyCel, ExecRequest};
use ccw_policy::{promote, PolicyRule, PromoteRequest};

/// Timeout for each staged deltamin probe run.
const DELTAMIN_PROBE_TIMEOUT_MS: u64 = 60_000;

/// Tool descriptors for `tools/list`.
pub fn list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "capsule/create",
                "description": "Create a new capsule (counterfactual environment)",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "workspace": {"type": "string"},
                        "base": {"type": "string"},
                        "clock_offset_sec": {"type": "integer", "default": 0},
                        "env_whitelist": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["workspace"]
                }
            },
            {
                "name": "capsule/exec",
                "description": "Execute command in capsule",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"},
                        "cmd": {"type": "array", "items": {"type": "string"}},
                        "cwd": {"type": "string"},
                        "timeout_ms": {"type": "integer", "default": 600000},
                        "stdin": {"type": "string"}
                    },
                    "required": ["capsule_id", "cmd"]
                }
            },
            {
                "name": "capsule/diff",
                "description": "Get diff of capsule changes",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"},
                        "format": {"type": "string", "enum": ["unified", "json"], "default": "unified"}
                    },
                    "required": ["capsule_id"]
                }
            },
            {
                "name": "capsule/clone",
                "description": "Clone an existing capsule over the same base",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "source_capsule_id": {"type": "string"},
                        "new_workspace": {"type": "string"}
                    },
                    "required": ["source_capsule_id"]
                }
            },
            {
                "name": "capsule/witness",
                "description": "Create witness package from capsule",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"},
                        "compress": {"type": "string", "enum": ["zstd", "none"], "default": "zstd"},
                        "include_blobs": {"type": "boolean", "default": true}
                    },
                    "required": ["capsule_id"]
                }
            },
            {
                "name": "capsule/replay",
                "description": "Replay witness package",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "witness_id": {"type": "string"}
                    },
                    "required": ["witness_id"]
                }
            },
            {
                "name": "capsule/promote",
                "description": "Promote capsule changes to the host workspace",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"},
                        "policies": {"type": "array", "items": {"type": "string"}},
                        "replay_hash": {"type": "string"},
                        "expected_hash": {"type": "string"},
                        "dry_run": {"type": "boolean", "default": false}
                    },
                    "required": ["capsule_id"]
                }
            },
            {
                "name": "policy/set",
                "description": "Set or update policy rules",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "rules": {"type": "object"}
                    },
                    "required": ["name", "rules"]
                }
            },
            {
                "name": "capsule/deltamin",
                "description": "Find minimal change set that reproduces failure",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"},
                        "target_cmd": {"type": "array", "items": {"type": "string"}},
                        "budget_ms": {"type": "integer", "default": 120000}
                    },
                    "required": ["capsule_id", "target_cmd"]
                }
            },
            {
                "name": "capsule/commutativity",
                "description": "Analyze change commutativity for parallelization",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "capsule_id": {"type": "string"}
                    },
                    "required": ["capsule_id"]
                }
            }
        ]
    })
}

impl Server {
    /// Dispatch one `tools/call` by name.
    pub fn call_tool(&mut self, name: &str, arguments: &Value) -> Result<Value, RpcError> {
        let params = Params::new(arguments);
        match name {
            "capsule/create" => self.tool_capsule_create(&params),
            "capsule/exec" => self.tool_capsule_exec(&params),
            "capsule/diff" => self.tool_capsule_diff(&params),
            "capsule/clone" => self.tool_capsule_clone(&params),
            "capsule/witness" => self.tool_capsule_witness(&params),
            "capsule/replay" => self.tool_capsule_replay(&params),
            "capsule/promote" => self.tool_capsule_promote(&params),
            "policy/set" => self.tool_policy_set(&params),
            "capsule/deltamin" => self.tool_capsule_deltamin(&params),
            "capsule/commutativity" => self.tool_capsule_commutativity(&params),
            other => Err(RpcError::InvalidParams(format!("Unknown tool: {other}"))),
        }
    }

    fn tool_capsule_create(&mut self, params: &Params) -> Result<Value, RpcError> {
        let workspace = PathBuf::from(params.required_str("workspace")?);
        let base = params.optional_str("base").map(PathBuf::from);
        let clock_offset_sec = params.i64_or("clock_offset_sec", 0);
        let env_whitelist = params.string_list_or_default("env_whitelist", &[]);

        let outcome = self
            .capsules
            .create(&workspace, base.as_deref(), clock_offset_sec, env_whitelist)?;
        Ok(serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_exec(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?;
        let cmd = params.required_string_list("cmd")?;
        let cwd = params.optional_str("cwd").map(PathBuf::from);
        let timeout_ms = params.u64_or("timeout_ms", ccw_cel::DEFAULT_TIMEOUT_MS);
        let stdin = params.optional_str("stdin").map(str::to_string);

        let result = self
            .capsules
            .execute(capsule_id, cmd, cwd, timeout_ms, stdin)?;
        Ok(serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_diff(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?;
        let format = params.optional_str("format").unwrap_or("unified");
        let outcome = self.capsules.diff(capsule_id, format)?;
        Ok(serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_clone(&mut self, params: &Params) -> Result<Value, RpcError> {
        let source_id = params.required_str("source_capsule_id")?;
        let new_workspace = params.optional_str("new_workspace").map(PathBuf::from);
        let outcome = self
            .capsules
            .clone_capsule(source_id, new_workspace.as_deref())?;
        Ok(serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_witness(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?.to_string();
        let compress = params.optional_str("compress").unwrap_or("zstd").to_string();
        let include_blobs = params.bool_or("include_blobs", true);

        let Some(entry) = self.capsules.get(&capsule_id) else {
            return Ok(json!({"error": format!("Capsule {capsule_id} not found")}));
        };
        let changes = entry.cel.changes()?;
        let mount = entry.cel.mount_point().to_path_buf();

        let outcome = self
            .witnesses
            .create(&capsule_id, &mount, &changes, &compress, include_blobs)?;
        Ok(serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_replay(&mut self, params: &Params) -> Result<Value, RpcError> {
        let witness_id = params.required_str("witness_id")?;
        let outcome = self.witnesses.replay(witness_id)?;
        Ok(serde_json::to_value(outcome).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_capsule_promote(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?.to_string();
        let policies = params.string_list_or_default("policies", &["baseline"]);
        let dry_run = params.bool_or("dry_run", false);
        let replay_hash = params.optional_str("replay_hash").map(str::to_string);
        let expected_hash = params.optional_str("expected_hash").map(str::to_string);

        let Some(entry) = self.capsules.get(&capsule_id) else {
            return Ok(json!({"error": format!("Capsule {capsule_id} not found")}));
        };
        let changes = entry.cel.changes()?;
        let mount = entry.cel.mount_point().to_path_buf();
        let target = entry.metadata.workspace.clone();
        let usage = entry.last_usage;

        let result = promote(
            &self.policies,
            &PromoteRequest {
                mount: &mount,
                target: &target,
                changes: &changes,
                policies: &policies,
                usage,
                replay_hash: replay_hash.as_deref(),
                expected_hash: expected_hash.as_deref(),
                dry_run,
            },
        );
        Ok(serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))?)
    }

    fn tool_policy_set(&mut self, params: &Params) -> Result<Value, RpcError> {
        let name = params.required_str("name")?;
        let rules_value = params
            .raw("rules")
            .filter(|v| v.is_object())
            .ok_or_else(|| RpcError::InvalidParams("missing rules".to_string()))?;

        let rules = Params::new(rules_value);
        let policy = PolicyRule {
            name: name.to_string(),
            max_rss_mb: rules_value.get("max_rss_mb").and_then(Value::as_u64),
            max_cpu_ms: rules_value.get("max_cpu_ms").and_then(Value::as_u64),
            deny_paths: rules.string_list_or_default("deny_paths", &[]),
            require_tests: rules.string_list_or_default("require_tests", &[]),
            require_replay_ok: rules.bool_or("require_replay_ok", true),
        };
        self.policies.set_policy(policy);
        Ok(json!({"ok": true}))
    }

    fn tool_capsule_deltamin(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?.to_string();
        let target_cmd = params.required_string_list("target_cmd")?;
        let budget_ms = params.u64_or("budget_ms", 120_000);

        let Some(entry) = self.capsules.get(&capsule_id) else {
            return Ok(json!({"error": format!("Capsule {capsule_id} not found")}));
        };
        let changes = entry.cel.changes()?;
        let mount = entry.cel.mount_point().to_path_buf();
        let workspace = entry.metadata.workspace.clone();
        let base = entry
            .metadata
            .base_dir
            .clone()
            .unwrap_or_else(|| workspace.clone());

        // The probe stages a candidate subset over a scratch base copy and
        // considers it reproducing when the target command fails there.
        let result = minimize(
            &changes,
            |subset| match probe_subset(&workspace, &base, &mount, subset, &target_cmd) {
                Ok(reproduced) => reproduced,
                Err(e) => {
                    debug!(error = %e, "deltamin probe failed, dropping candidate");
                    false
                }
            },
            budget_ms,
        );

        Ok(json!({
            "minimal_patch": result.minimal_patch,
            "replay_ok": result.replay_ok,
            "root_hash": result.root_hash,
            "iterations": result.iterations,
        }))
    }

    fn tool_capsule_commutativity(&mut self, params: &Params) -> Result<Value, RpcError> {
        let capsule_id = params.required_str("capsule_id")?.to_string();
        let Some(entry) = self.capsules.get(&capsule_id) else {
            return Ok(json!({"error": format!("Capsule {capsule_id} not found")}));
        };
        let changes = entry.cel.changes()?;
        let result = analyze(&changes);
        Ok(serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))?)
    }
}

/// Stage `subset` over a scratch copy of `base` and run the target command
/// there. Returns true when the command exits non-zero, i.e. the failure
/// still reproduces with only this subset applied.
fn probe_subset(
    workspace: &Path,
    base: &Path,
    mount: &Path,
    subset: &[String],
    target_cmd: &[String],
) -> anyhow::Result<bool> {
    let mut scratch = CopyCel::new(workspace, base)?;
    let sandbox = scratch.mount();

    for rel in subset {
        let src = mount.join(rel);
        if !src.is_file() {
            continue;
        }
        let dst = sandbox.join(rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dst)?;
    }

    let mut req = ExecRequest::new(target_cmd.to_vec());
    req.timeout_ms = DELTAMIN_PROBE_TIMEOUT_MS;
    let result = scratch.execute(&req)?;
    scratch.cleanup();

    Ok(result.exit_code != 0)
}
