//! Resource handlers: JSON summaries of server state by URI.

use serde_json::{json, Value};

use crate::Server;

impl Server {
    /// Enumerate readable resources: server stats, policies, live capsules,
    /// and witnesses.
    pub fn list_resources(&self) -> Value {
        let mut resources = vec![json!({
            "uri": "stats://server",
            "name": "Server Statistics",
            "mimeType": "application/json",
            "description": "Current server status and metrics",
        })];

        for name in self.policies.policy_names() {
            resources.push(json!({
                "uri": format!("policy://{name}"),
                "name": format!("Policy '{name}'"),
                "mimeType": "application/json",
                "description": format!("Policy rules for {name}"),
            }));
        }

        for capsule_id in self.capsules.list() {
            resources.push(json!({
                "uri": format!("capsule://{capsule_id}"),
                "name": format!("Capsule {capsule_id}"),
                "mimeType": "application/json",
                "description": "Capsule metadata and status",
            }));
        }

        for witness_id in self.witnesses.list() {
            resources.push(json!({
                "uri": format!("witness://{witness_id}"),
                "name": format!("Witness {witness_id}"),
                "mimeType": "application/json",
                "description": "Witness package metadata",
            }));
        }

        json!({ "resources": resources })
    }

    /// Read one resource by URI. Unknown URIs return an error payload in the
    /// contents rather than an RPC error.
    pub fn read_resource(&mut self, uri: &str) -> Value {
        let text = self.render_resource(uri);
        json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text,
            }]
        })
    }

    fn render_resource(&mut self, uri: &str) -> String {
        if uri == "stats://server" {
            let stats = json!({
                "server_version": env!("CARGO_PKG_VERSION"),
                "storage_dir": self.storage_dir().display().to_string(),
                "active_capsules": self.capsules.list().len(),
                "witnesses": self.witnesses.list().len(),
                "policies": self.policies.policy_names(),
                "platform": std::env::consts::OS,
            });
            return pretty(&stats);
        }

        if let Some(name) = uri.strip_prefix("policy://") {
            return match self.policies.get_policy(name) {
                Some(policy) => pretty(&serde_json::to_value(policy).unwrap_or(Value::Null)),
                None => pretty(&json!({"error": format!("Unknown policy: {name}")})),
            };
        }

        if let Some(capsule_id) = uri.strip_prefix("capsule://") {
            let capsule_id = capsule_id.to_string();
            let Some(entry) = self.capsules.get(&capsule_id) else {
                return pretty(&json!({"error": format!("Capsule {capsule_id} not found")}));
            };
            let changes = entry.cel.changes().unwrap_or_default();
            let summary = json!({
                "capsule_id": entry.metadata.capsule_id,
                "workspace": entry.metadata.workspace.display().to_string(),
                "base_dir": entry.metadata.base_dir.as_ref().map(|p| p.display().to_string()),
                "created_at": entry.metadata.created_at,
                "mount": entry.metadata.mount_point.as_ref().map(|p| p.display().to_string()),
                "changes_count": changes.len(),
                "changes": changes.iter().take(100).collect::<Vec<_>>(),
                "env_whitelist": entry.metadata.env_whitelist,
                "clock_offset_sec": entry.metadata.clock_offset_sec,
            });
            return pretty(&summary);
        }

        if let Some(witness_id) = uri.strip_prefix("witness://") {
            return match self.witnesses.record(witness_id) {
                Some(record) => pretty(&serde_json::to_value(record).unwrap_or(Value::Null)),
                None => pretty(&json!({"error": format!("Witness {witness_id} not found")})),
            };
        }

        pretty(&json!({"error": format!("Unknown URI: {uri}")}))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}
