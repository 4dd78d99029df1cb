//! Tool provider clients.
//!
//! Each tool provider is a long-lived child process reached over
//! stdin/stdout with line-delimited JSON envelopes. The pool
//! supervises one client per provider from a closed name vocabulary;
//! callers see a synchronous-looking `call` that either returns a
//! result or a typed error.

pub mod client;
pub mod pool;
pub mod protocol;

pub use client::{ClientSettings, ToolClient};
pub use pool::ToolPool;

use serde::Serialize;

/// Closed vocabulary of tool provider names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolName {
    LiteratureIndex,
    Citations,
    ClinicalTrials,
    KnowledgeBase,
    Imaging,
}

impl ToolName {
    pub const ALL: [ToolName; 5] = [
        ToolName::LiteratureIndex,
        ToolName::Citations,
        ToolName::ClinicalTrials,
        ToolName::KnowledgeBase,
        ToolName::Imaging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::LiteratureIndex => "literature-index",
            ToolName::Citations => "citations",
            ToolName::ClinicalTrials => "clinical-trials",
            ToolName::KnowledgeBase => "knowledge-base",
            ToolName::Imaging => "imaging",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Typed terminal outcomes for tool calls and connections.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// The client is not connected; the call failed fast.
    #[error("Tool is unavailable")]
    Unavailable,
    /// The per-call deadline passed before a reply arrived.
    #[error("Tool call deadline exceeded")]
    DeadlineExceeded,
    /// The provider replied with a well-formed error envelope.
    #[error("Tool returned error {code}: {message}")]
    Remote { code: i64, message: String },
    /// Transport-level failure (EOF, broken pipe, decode error).
    #[error("Tool transport failed: {0}")]
    Transport(String),
    /// The client was shut down while the call was pending.
    #[error("Tool client shut down")]
    Shutdown,
    /// The per-client pending-call cap is full.
    #[error("Tool pending-call capacity exhausted")]
    PendingCapExceeded,
}

impl ToolError {
    /// Stable class tag used in evidence bundles and audit fields.
    pub fn class(&self) -> &'static str {
        match self {
            ToolError::Unavailable => "unavailable",
            ToolError::DeadlineExceeded => "timeout",
            ToolError::Remote { .. } => "tool-error",
            ToolError::Transport(_) => "transport",
            ToolError::Shutdown => "shutdown",
            ToolError::PendingCapExceeded => "overloaded",
        }
    }
}
