//! Query federation and synthesis.
//!
//! The orchestrator plans tool calls from the intent analysis, fans
//! out to the provider pool under per-entry deadlines, drives the
//! primary/fallback LLM, and merges everything into one structured,
//! safety-annotated response. Upstream failures are partial by
//! design; only every source and the LLM failing together produces
//! the fixed SafetyResponse.

pub mod orchestrator;
pub mod prompt;
pub mod types;

pub use orchestrator::{EvidenceSource, Orchestrator, OrchestratorSettings, Synthesizer};
pub use types::{
    AlertKind, AlertLevel, EvidenceBundle, EvidenceEntry, Finding, SafetyAlert,
    SynthesizedResponse, ToolCallResult,
};
