//! Prompt assembly for the synthesis LLM call.
//!
//! One prompt, fixed section order: system prompt selected by intent,
//! patient context JSON, per-source evidence JSON under uppercased
//! headers, the bounded conversation tail, the user query last, and a
//! response-structure instruction matching the hint.

use serde::Deserialize;
use serde_json::Value;

use crate::intent::{IntentAnalysis, IntentTag};
use crate::llm::ResponseHint;

use super::types::EvidenceBundle;

/// Messages kept from the conversation history.
pub const HISTORY_TAIL: usize = 5;

/// One prior conversation turn, as supplied by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

const BASE_SYSTEM_PROMPT: &str = "You are a medical research assistant synthesizing \
evidence from curated clinical sources. You support clinicians and researchers; you do \
not provide definitive diagnoses. Ground every statement in the supplied evidence, \
state uncertainty plainly, and flag anything that warrants urgent human attention.";

/// Pick the response-structure hint from the ranked intent tags.
pub fn hint_for(intent: &IntentAnalysis) -> ResponseHint {
    let Some(first) = intent.intents.first() else {
        return ResponseHint::General;
    };
    match first {
        IntentTag::RadiologyAnalysis
        | IntentTag::DermatologyAnalysis
        | IntentTag::PathologyAnalysis
        | IntentTag::MedicalImageAnalysis => ResponseHint::ImageAnalysis,
        IntentTag::DifferentialDiagnosis => ResponseHint::DifferentialDiagnosis,
        IntentTag::TreatmentOptions => ResponseHint::TreatmentPlanning,
        IntentTag::DrugInteraction => ResponseHint::DrugTherapy,
        IntentTag::EmergencyAssessment => ResponseHint::EmergencyAssessment,
        IntentTag::LiteratureSearch | IntentTag::ClinicalTrials | IntentTag::RareDisease => {
            ResponseHint::ResearchAnalysis
        }
        IntentTag::CardiologyAnalysis
        | IntentTag::NeurologyAnalysis
        | IntentTag::OncologyAnalysis => ResponseHint::SpecialtyConsultation,
        _ => ResponseHint::General,
    }
}

/// System prompt selected by the hint.
pub fn system_prompt(hint: ResponseHint) -> String {
    let focus = match hint {
        ResponseHint::DifferentialDiagnosis => {
            "Focus on a ranked differential with distinguishing features and suggested workup."
        }
        ResponseHint::TreatmentPlanning => {
            "Focus on evidence-graded treatment options, contraindications, and monitoring."
        }
        ResponseHint::ImageAnalysis => {
            "Focus on observable image findings; never assert a diagnosis from imaging alone."
        }
        ResponseHint::EmergencyAssessment => {
            "Focus on time-critical red flags and immediate next steps."
        }
        ResponseHint::DrugTherapy => {
            "Focus on interaction mechanisms, severity, and safer alternatives."
        }
        ResponseHint::ResearchAnalysis => {
            "Focus on study quality, effect sizes, and the strength of the evidence."
        }
        ResponseHint::PatientEducation => {
            "Focus on plain-language explanation a patient can act on."
        }
        ResponseHint::SpecialtyConsultation => {
            "Focus on specialty-specific assessment and referral criteria."
        }
        ResponseHint::General => "Provide a balanced general clinical overview.",
    };
    format!("{BASE_SYSTEM_PROMPT}\n{focus}")
}

fn response_instruction(hint: ResponseHint) -> String {
    let fields = hint.expected_fields().join("\", \"");
    format!(
        "Respond with a single JSON object containing the fields \"{fields}\". \
         Keep \"summary\" concise and list concrete items in \"recommendations\"."
    )
}

fn section_header(name: &str) -> String {
    format!("=== {} ===", name.to_uppercase())
}

/// Assemble the full prompt.
pub fn assemble(
    query: &str,
    patient_context: &Value,
    evidence: &EvidenceBundle,
    history: &[ChatTurn],
    hint: ResponseHint,
) -> String {
    let mut prompt = String::new();

    if !patient_context.is_null() {
        prompt.push_str(&section_header("patient context"));
        prompt.push('\n');
        prompt.push_str(&patient_context.to_string());
        prompt.push_str("\n\n");
    }

    for (tool, entry) in &evidence.0 {
        prompt.push_str(&section_header(tool.as_str()));
        prompt.push('\n');
        match serde_json::to_string(entry) {
            Ok(serialized) => prompt.push_str(&serialized),
            Err(_) => prompt.push_str("{\"status\":\"error\"}"),
        }
        prompt.push_str("\n\n");
    }

    let tail: Vec<&ChatTurn> = history.iter().rev().take(HISTORY_TAIL).rev().collect();
    if !tail.is_empty() {
        prompt.push_str(&section_header("conversation"));
        prompt.push('\n');
        for turn in tail {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }
        prompt.push('\n');
    }

    prompt.push_str(&section_header("query"));
    prompt.push('\n');
    prompt.push_str(query);
    prompt.push_str("\n\n");
    prompt.push_str(&response_instruction(hint));
    prompt
}
