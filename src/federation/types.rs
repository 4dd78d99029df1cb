//! Data shapes produced by the synthesis pipeline.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::intent::{IntentAnalysis, Urgency};
use crate::tools::{ToolError, ToolName};

/// Fixed summary of the SafetyResponse.
pub const SAFETY_SUMMARY: &str = "Medical analysis unavailable";
/// Fixed first recommendation of the SafetyResponse.
pub const SAFETY_RECOMMENDATION: &str = "Please consult with a healthcare professional";
/// Action attached to the emergency alert.
pub const EMERGENCY_ACTION: &str =
    "Call emergency services or go to the nearest emergency room immediately";

/// One successful tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub payload: Value,
    pub duration_ms: u64,
    pub confidence: f64,
}

/// Either a result or a typed error per attempted source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum EvidenceEntry {
    #[serde(rename = "ok")]
    Result(ToolCallResult),
    #[serde(rename = "error")]
    Error { class: String, message: String },
}

impl EvidenceEntry {
    pub fn from_error(error: &ToolError) -> Self {
        EvidenceEntry::Error {
            class: error.class().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, EvidenceEntry::Result(_))
    }
}

/// Evidence keyed by source. Absence of a key means the tool was not
/// attempted; presence of an `Error` entry means it was and failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceBundle(pub BTreeMap<ToolName, EvidenceEntry>);

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool: ToolName, entry: EvidenceEntry) {
        self.0.insert(tool, entry);
    }

    pub fn get(&self, tool: ToolName) -> Option<&EvidenceEntry> {
        self.0.get(&tool)
    }

    pub fn successes(&self) -> impl Iterator<Item = (ToolName, &ToolCallResult)> {
        self.0.iter().filter_map(|(tool, entry)| match entry {
            EvidenceEntry::Result(result) => Some((*tool, result)),
            EvidenceEntry::Error { .. } => None,
        })
    }

    pub fn failed_sources(&self) -> Vec<ToolName> {
        self.0
            .iter()
            .filter(|(_, entry)| !entry.is_ok())
            .map(|(tool, _)| *tool)
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.0.values().filter(|e| e.is_ok()).count()
    }

    pub fn attempted(&self) -> Vec<ToolName> {
        self.0.keys().copied().collect()
    }
}

/// One finding or recommendation with its source attribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub source: String,
    pub content: String,
}

impl Finding {
    pub fn new(source: &str, content: &str) -> Self {
        Self {
            source: source.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    Emergency,
    ImageAnalysis,
    MedicationSafety,
    LowConfidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Critical,
    High,
    Medium,
}

/// Safety annotation derived from the intent and merged response —
/// never from raw upstream text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyAlert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub action: String,
}

impl SafetyAlert {
    pub fn emergency() -> Self {
        Self {
            kind: AlertKind::Emergency,
            level: AlertLevel::Critical,
            message: "The query indicates a potentially life-threatening situation."
                .to_string(),
            action: EMERGENCY_ACTION.to_string(),
        }
    }

    pub fn image_analysis() -> Self {
        Self {
            kind: AlertKind::ImageAnalysis,
            level: AlertLevel::High,
            message: "Automated image findings require professional confirmation."
                .to_string(),
            action: "Have the image reviewed by a qualified clinician.".to_string(),
        }
    }

    pub fn medication_safety() -> Self {
        Self {
            kind: AlertKind::MedicationSafety,
            level: AlertLevel::High,
            message: "Medication interactions were checked automatically.".to_string(),
            action: "Confirm any medication change with a pharmacist or physician."
                .to_string(),
        }
    }

    pub fn low_confidence() -> Self {
        Self {
            kind: AlertKind::LowConfidence,
            level: AlertLevel::Medium,
            message: "Supporting evidence for this response is limited.".to_string(),
            action: "Treat this response as preliminary and verify independently."
                .to_string(),
        }
    }
}

/// The merged response returned by the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedResponse {
    pub summary: String,
    /// Structured analysis; shape follows the response hint.
    pub analysis: Value,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<Finding>,
    pub safety_alerts: Vec<SafetyAlert>,
    pub confidence: f64,
    pub source_confidences: BTreeMap<String, f64>,
    pub tools_consulted: Vec<String>,
    /// Sources that were attempted but produced no evidence.
    pub missing_sources: Vec<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disclaimer: Option<String>,
    pub intent: IntentAnalysis,
}

impl SynthesizedResponse {
    /// The fixed-shape response for a total upstream blackout.
    pub fn safety_response(intent: IntentAnalysis, disclaimer: Option<String>) -> Self {
        let mut safety_alerts = Vec::new();
        if intent.urgency == Urgency::Critical {
            safety_alerts.push(SafetyAlert::emergency());
        }
        safety_alerts.push(SafetyAlert::low_confidence());
        Self {
            summary: SAFETY_SUMMARY.to_string(),
            analysis: Value::Null,
            findings: Vec::new(),
            recommendations: vec![
                Finding::new("system", SAFETY_RECOMMENDATION),
                Finding::new("system", "If this is an emergency, call your local emergency number."),
            ],
            safety_alerts,
            confidence: 0.0,
            source_confidences: BTreeMap::new(),
            tools_consulted: Vec::new(),
            missing_sources: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            disclaimer,
            intent,
        }
    }
}
