//! LLM adapter: unified text and vision calls with primary/fallback
//! providers, per-call deadlines, and structured-response parsing.

pub mod adapter;
pub mod parse;

pub use adapter::{LlmAdapter, LlmOutcome};
pub use parse::{parse_output, ParsedResponse, TextSections};

use serde::Serialize;

/// Typed failures from the adapter. Both providers failing surfaces
/// the last error; the orchestrator turns that into a SafetyResponse.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),
    #[error("LLM call exceeded its deadline")]
    Timeout,
    #[error("LLM response was unusable: {0}")]
    BadResponse(String),
    #[error("No LLM provider is configured")]
    NotConfigured,
}

/// Response-structure hints (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseHint {
    General,
    DifferentialDiagnosis,
    TreatmentPlanning,
    ImageAnalysis,
    EmergencyAssessment,
    DrugTherapy,
    ResearchAnalysis,
    PatientEducation,
    SpecialtyConsultation,
}

impl ResponseHint {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseHint::General => "general",
            ResponseHint::DifferentialDiagnosis => "differential-diagnosis",
            ResponseHint::TreatmentPlanning => "treatment-planning",
            ResponseHint::ImageAnalysis => "image-analysis",
            ResponseHint::EmergencyAssessment => "emergency-assessment",
            ResponseHint::DrugTherapy => "drug-therapy",
            ResponseHint::ResearchAnalysis => "research-analysis",
            ResponseHint::PatientEducation => "patient-education",
            ResponseHint::SpecialtyConsultation => "specialty-consultation",
        }
    }

    /// Structured fields a well-behaved model includes for this hint.
    /// Presence drives the structured-confidence score.
    pub fn expected_fields(self) -> &'static [&'static str] {
        match self {
            ResponseHint::DifferentialDiagnosis => {
                &["summary", "differentials", "recommendations", "safety", "confidence"]
            }
            ResponseHint::TreatmentPlanning => {
                &["summary", "options", "recommendations", "safety", "confidence"]
            }
            ResponseHint::ImageAnalysis => {
                &["summary", "findings", "recommendations", "safety", "confidence"]
            }
            ResponseHint::EmergencyAssessment => {
                &["summary", "severity", "recommendations", "safety", "confidence"]
            }
            ResponseHint::DrugTherapy => {
                &["summary", "interactions", "recommendations", "safety", "confidence"]
            }
            ResponseHint::ResearchAnalysis => {
                &["summary", "evidence", "recommendations", "confidence"]
            }
            _ => &["summary", "analysis", "recommendations", "safety", "confidence"],
        }
    }
}

/// Sampling parameters. Values come from configuration at composition
/// time; these defaults match the safety-tuned posture.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            top_p: 0.8,
            max_tokens: 2048,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_serialize_kebab_case() {
        let json = serde_json::to_string(&ResponseHint::DifferentialDiagnosis).unwrap();
        assert_eq!(json, "\"differential-diagnosis\"");
        assert_eq!(ResponseHint::DrugTherapy.as_str(), "drug-therapy");
    }

    #[test]
    fn every_hint_expects_a_summary() {
        for hint in [
            ResponseHint::General,
            ResponseHint::DifferentialDiagnosis,
            ResponseHint::TreatmentPlanning,
            ResponseHint::ImageAnalysis,
            ResponseHint::EmergencyAssessment,
            ResponseHint::DrugTherapy,
            ResponseHint::ResearchAnalysis,
            ResponseHint::PatientEducation,
            ResponseHint::SpecialtyConsultation,
        ] {
            assert!(hint.expected_fields().contains(&"summary"));
        }
    }

    #[test]
    fn default_params_match_safety_posture() {
        let params = GenerationParams::default();
        assert_eq!(params.temperature, 0.1);
        assert_eq!(params.top_p, 0.8);
        assert_eq!(params.max_tokens, 2048);
    }
}
