//! Line-delimited JSON-RPC-style envelopes for the tool wire protocol.
//!
//! One envelope per line, UTF-8. Parent → child: `{id, method, params}`.
//! Child → parent: `{id, result}` or `{id, error: {code, message}}`.
//! Ids are parent-assigned and unique per client lifetime. A
//! zero-length line from the parent asks the child to exit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake method every provider must answer.
pub const LIST_TOOLS: &str = "listTools";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            id,
            method: method.to_string(),
            params,
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Result payload of the `listTools` handshake. Providers may advertise
/// bare method names or `{name, …}` descriptors; both are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolEntry {
    Name(String),
    Described { name: String },
}

impl ToolEntry {
    pub fn name(&self) -> &str {
        match self {
            ToolEntry::Name(n) => n,
            ToolEntry::Described { name } => name,
        }
    }
}
