//! JSON-RPC 2.0 types and framing for the stdio transport.
//!
//! Requests arrive either one JSON object per line or prefixed with
//! `Content-Length:` headers. Responses are always emitted line-delimited.

use serde_json::{json, Value};
use std::io::{BufRead, Read};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Typed JSON-RPC failure, carrying its wire error code.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Parse(_) => -32700,
            RpcError::InvalidRequest(_) => -32600,
            RpcError::MethodNotFound(_) => -32601,
            RpcError::InvalidParams(_) => -32602,
            RpcError::Internal(_) => -32603,
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::Internal(format!("{e:#}"))
    }
}

pub fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Value, error: &RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code(),
            "message": error.to_string(),
        },
    })
}

/// Read one framed request from the transport.
///
/// Returns `Ok(None)` at end of input. A bare JSON line is passed through
/// as-is; a `Content-Length:` header switches to header framing for that
/// message.
pub fn read_message<R: BufRead>(reader: &mut R) -> std::io::Result<Option<String>> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
            let length: usize = rest.trim().parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad Content-Length")
            })?;
            // Consume remaining headers up to the blank separator line.
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header)? == 0 {
                    return Ok(None);
                }
                if header.trim().is_empty() {
                    break;
                }
            }
            let mut payload = vec![0u8; length];
            reader.read_exact(&mut payload)?;
            return Ok(Some(String::from_utf8_lossy(&payload).into_owned()));
        }

        return Ok(Some(trimmed.to_string()));
    }
}

/// Accessors over the `params` object with typed invalid-params errors.
pub struct Params<'a> {
    value: &'a Value,
}

impl<'a> Params<'a> {
    pub fn new(value: &'a Value) -> Self {
        Self { value }
    }

    pub fn required_str(&self, key: &str) -> Result<&'a str, RpcError> {
        self.value
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::InvalidParams(format!("missing {key}")))
    }

    pub fn optional_str(&self, key: &str) -> Option<&'a str> {
        self.value.get(key).and_then(Value::as_str)
    }

    pub fn required_string_list(&self, key: &str) -> Result<Vec<String>, RpcError> {
        let list = self
            .value
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::InvalidParams(format!("missing {key}")))?;
        list.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RpcError::InvalidParams(format!("{key} must be strings")))
            })
            .collect()
    }

    pub fn string_list_or_default(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.value.get(key).and_then(Value::as_array) {
            Some(list) => list
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.value.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.value.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.value.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn raw(&self, key: &str) -> Option<&'a Value> {
        self.value.get(key)
    }
}
