//! The synthesis pipeline.
//!
//! plan → fan-out → (image branch ∥) → prompt → LLM → merge → alerts
//! → outbound scrub → audit. Failures of individual sources are
//! partial: the failing source becomes a `ToolError` entry in the
//! evidence bundle and synthesis continues. Only a total blackout
//! (no evidence, no vision, no LLM) yields the fixed SafetyResponse,
//! which is still a well-formed response served at 200.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditRecord, AuditSeverity, AuditSink};
use crate::imaging::ImageArtifact;
use crate::intent::{IntentAnalysis, IntentTag, Urgency};
use crate::llm::adapter::LlmOutcome;
use crate::llm::{LlmError, ResponseHint};
use crate::scrub::PhiScrubber;
use crate::tools::{ToolError, ToolName, ToolPool};

use super::prompt::{self, ChatTurn};
use super::types::{
    EvidenceBundle, EvidenceEntry, Finding, SafetyAlert, SynthesizedResponse,
    ToolCallResult,
};

/// Default per-call confidence when a tool result carries none.
const DEFAULT_TOOL_CONFIDENCE: f64 = 0.7;

pub const DISCLAIMER: &str = "This synthesis is generated from automated sources for \
research support. It is not medical advice and must not replace the judgment of a \
qualified healthcare professional.";

// ═══════════════════════════════════════════════════════════
// Seams
// ═══════════════════════════════════════════════════════════

/// Where evidence comes from. Implemented by the tool pool; tests
/// substitute fixtures.
#[allow(async_fn_in_trait)]
pub trait EvidenceSource {
    fn members(&self) -> Vec<ToolName>;
    async fn call(
        &self,
        tool: ToolName,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ToolError>;
}

impl EvidenceSource for std::sync::Arc<ToolPool> {
    fn members(&self) -> Vec<ToolName> {
        ToolPool::members(self)
    }

    async fn call(
        &self,
        tool: ToolName,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, ToolError> {
        ToolPool::call(self, tool, method, Some(params), deadline).await
    }
}

/// The LLM seam.
#[allow(async_fn_in_trait)]
pub trait Synthesizer {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError>;

    async fn analyze_image(
        &self,
        system: &str,
        prompt: &str,
        bytes: &[u8],
        mime: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError>;
}

impl Synthesizer for crate::llm::LlmAdapter {
    async fn generate(
        &self,
        system: &str,
        prompt: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError> {
        crate::llm::LlmAdapter::generate(self, system, prompt, hint, deadline).await
    }

    async fn analyze_image(
        &self,
        system: &str,
        prompt: &str,
        bytes: &[u8],
        mime: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError> {
        crate::llm::LlmAdapter::analyze_image(self, system, prompt, bytes, mime, hint, deadline)
            .await
    }
}

// ═══════════════════════════════════════════════════════════
// Inputs and settings
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub request_deadline: Duration,
    /// Subtracted when deriving child deadlines.
    pub headroom: Duration,
    /// Below this overall confidence a low-confidence alert is added.
    pub confidence_threshold: f64,
    pub require_disclaimer: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(60),
            headroom: Duration::from_secs(2),
            confidence_threshold: 0.6,
            require_disclaimer: true,
        }
    }
}

/// Everything the pipeline needs for one request. Query and patient
/// context arrive already scrubbed by the HTTP layer.
pub struct SynthesisInput {
    pub query: String,
    pub intent: IntentAnalysis,
    pub image: Option<ImageArtifact>,
    pub patient_context: Value,
    pub history: Vec<ChatTurn>,
    pub session_id: Option<Uuid>,
}

struct PlanEntry {
    tool: ToolName,
    method: &'static str,
    params: Value,
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct Orchestrator<E: EvidenceSource, S: Synthesizer> {
    evidence: E,
    synthesizer: S,
    scrubber: PhiScrubber,
    audit: AuditSink,
    settings: OrchestratorSettings,
}

impl<E: EvidenceSource, S: Synthesizer> Orchestrator<E, S> {
    pub fn new(
        evidence: E,
        synthesizer: S,
        scrubber: PhiScrubber,
        audit: AuditSink,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            evidence,
            synthesizer,
            scrubber,
            audit,
            settings,
        }
    }

    fn child_deadline(&self, started: Instant) -> Duration {
        self.settings
            .request_deadline
            .saturating_sub(started.elapsed())
            .saturating_sub(self.settings.headroom)
            .max(Duration::from_millis(500))
    }

    /// (clientName, method, args) triples from the required tools.
    /// The imaging tool is driven by the image branch, not the plan.
    fn build_plan(&self, input: &SynthesisInput) -> Vec<PlanEntry> {
        let intent = &input.intent;
        let wants_interactions = intent.intents.contains(&IntentTag::DrugInteraction);
        intent
            .required_tools
            .iter()
            .filter(|tool| **tool != ToolName::Imaging)
            .map(|tool| match tool {
                ToolName::LiteratureIndex => PlanEntry {
                    tool: *tool,
                    method: "searchLiterature",
                    params: json!({
                        "query": input.query,
                        "intents": intent.intents,
                    }),
                },
                ToolName::Citations => PlanEntry {
                    tool: *tool,
                    method: "findCitations",
                    params: json!({ "query": input.query }),
                },
                ToolName::ClinicalTrials => PlanEntry {
                    tool: *tool,
                    method: "searchTrials",
                    params: json!({
                        "condition": input.query,
                        "patientCriteria": input.patient_context,
                    }),
                },
                ToolName::KnowledgeBase => {
                    if wants_interactions {
                        PlanEntry {
                            tool: *tool,
                            method: "checkDrugInteractions",
                            params: json!({
                                "query": input.query,
                                "medications": input
                                    .patient_context
                                    .get("medications")
                                    .cloned()
                                    .unwrap_or(Value::Array(vec![])),
                            }),
                        }
                    } else {
                        PlanEntry {
                            tool: *tool,
                            method: "lookupGuidelines",
                            params: json!({ "query": input.query }),
                        }
                    }
                }
                ToolName::Imaging => unreachable!("imaging filtered above"),
            })
            .collect()
    }

    /// Run the whole pipeline. Infallible by contract: every failure
    /// mode degrades into a response, down to the SafetyResponse.
    pub async fn synthesize(&self, input: SynthesisInput) -> SynthesizedResponse {
        let started = Instant::now();
        let hint = prompt::hint_for(&input.intent);
        let plan = self.build_plan(&input);
        let medication_check = plan.iter().any(|p| p.method == "checkDrugInteractions");
        let child_deadline = self.child_deadline(started);

        // Fan-out: all plan entries issued concurrently; one entry
        // failing never cancels the others. Local concurrency (no
        // spawn) means a dropped request future drops every in-flight
        // call, and the tool clients abandon their pending entries.
        let fan_out = futures::future::join_all(plan.iter().map(|entry| async {
            let call_started = Instant::now();
            let outcome = self
                .evidence
                .call(entry.tool, entry.method, entry.params.clone(), child_deadline)
                .await;
            (entry.tool, call_started.elapsed(), outcome)
        }));

        // Image branch runs in parallel with the fan-out.
        let image_branch = async {
            let Some(artifact) = input.image.as_ref() else {
                return (None, None);
            };
            let vision_prompt = format!(
                "Describe clinically relevant findings in the attached medical image. \
                 Clinical question: {}",
                input.query
            );
            let vision = self
                .synthesizer
                .analyze_image(
                    &prompt::system_prompt(ResponseHint::ImageAnalysis),
                    &vision_prompt,
                    &artifact.content,
                    artifact.format.mime(),
                    ResponseHint::ImageAnalysis,
                    child_deadline,
                )
                .await;
            let call_started = Instant::now();
            let tool = self
                .evidence
                .call(
                    ToolName::Imaging,
                    "analyzeImage",
                    json!({
                        "path": artifact.file_path,
                        "mime": artifact.format.mime(),
                        "width": artifact.width,
                        "height": artifact.height,
                    }),
                    child_deadline,
                )
                .await;
            (Some(vision), Some((call_started.elapsed(), tool)))
        };

        let (tool_outcomes, (vision_outcome, imaging_outcome)) =
            tokio::join!(fan_out, image_branch);

        // Collect evidence.
        let mut bundle = EvidenceBundle::new();
        for (tool, duration, outcome) in tool_outcomes {
            match outcome {
                Ok(payload) => {
                    let confidence = payload
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(DEFAULT_TOOL_CONFIDENCE);
                    bundle.insert(
                        tool,
                        EvidenceEntry::Result(ToolCallResult {
                            payload,
                            duration_ms: duration.as_millis() as u64,
                            confidence,
                        }),
                    );
                }
                Err(e) => bundle.insert(tool, EvidenceEntry::from_error(&e)),
            }
        }
        if let Some((duration, outcome)) = imaging_outcome {
            match outcome {
                Ok(payload) => {
                    let confidence = payload
                        .get("confidence")
                        .and_then(Value::as_f64)
                        .unwrap_or(DEFAULT_TOOL_CONFIDENCE);
                    bundle.insert(
                        ToolName::Imaging,
                        EvidenceEntry::Result(ToolCallResult {
                            payload,
                            duration_ms: duration.as_millis() as u64,
                            confidence,
                        }),
                    );
                }
                Err(e) => bundle.insert(ToolName::Imaging, EvidenceEntry::from_error(&e)),
            }
        }

        // Synthesis LLM call over the assembled evidence.
        let assembled = prompt::assemble(
            &input.query,
            &input.patient_context,
            &bundle,
            &input.history,
            hint,
        );
        let llm_outcome = self
            .synthesizer
            .generate(
                &prompt::system_prompt(hint),
                &assembled,
                hint,
                self.child_deadline(started),
            )
            .await;

        let vision_ok = matches!(vision_outcome, Some(Ok(_)));
        if bundle.success_count() == 0 && llm_outcome.is_err() && !vision_ok {
            let response = SynthesizedResponse::safety_response(
                input.intent.clone(),
                self.settings
                    .require_disclaimer
                    .then(|| DISCLAIMER.to_string()),
            );
            self.audit_query(&input, started, "safety-response");
            return response;
        }

        let response = self.merge(&input, bundle, llm_outcome, vision_outcome, medication_check);
        self.audit_query(&input, started, "ok");
        response
    }

    fn merge(
        &self,
        input: &SynthesisInput,
        bundle: EvidenceBundle,
        llm_outcome: Result<LlmOutcome, LlmError>,
        vision_outcome: Option<Result<LlmOutcome, LlmError>>,
        medication_check: bool,
    ) -> SynthesizedResponse {
        let mut findings: Vec<Finding> = Vec::new();
        let mut recommendations: Vec<Finding> = Vec::new();
        let mut source_confidences: BTreeMap<String, f64> = BTreeMap::new();

        // Evidence findings, in stable (sorted) source order.
        for (tool, result) in bundle.successes() {
            source_confidences.insert(tool.as_str().to_string(), result.confidence);
            if let Some(items) = result.payload.get("findings").and_then(Value::as_array) {
                for item in items {
                    let content = match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    findings.push(Finding::new(tool.as_str(), &content));
                }
            } else if let Some(summary) =
                result.payload.get("summary").and_then(Value::as_str)
            {
                findings.push(Finding::new(tool.as_str(), summary));
            }
        }

        // Image branch findings keep their own attribution.
        if let Some(Ok(vision)) = &vision_outcome {
            source_confidences.insert("vision".to_string(), vision.parsed.confidence);
            if !vision.parsed.sections.summary.is_empty() {
                findings.push(Finding::new("vision", &vision.parsed.sections.summary));
            }
            for item in &vision.parsed.sections.evidence {
                findings.push(Finding::new("vision", item));
            }
        }

        // LLM synthesis.
        let (summary, analysis) = match &llm_outcome {
            Ok(outcome) => {
                source_confidences.insert("llm".to_string(), outcome.parsed.confidence);
                for item in &outcome.parsed.sections.recommendations {
                    recommendations.push(Finding::new("llm", item));
                }
                for item in &outcome.parsed.sections.evidence {
                    findings.push(Finding::new("llm", item));
                }
                let summary = if outcome.parsed.sections.summary.is_empty() {
                    format!(
                        "Synthesis of {} evidence source(s).",
                        bundle.success_count()
                    )
                } else {
                    outcome.parsed.sections.summary.clone()
                };
                let analysis = outcome
                    .parsed
                    .structured
                    .clone()
                    .unwrap_or(Value::Null);
                (summary, analysis)
            }
            Err(e) => {
                tracing::warn!(error = %e, "LLM synthesis failed; serving evidence-only response");
                recommendations.push(Finding::new(
                    "system",
                    "Automated synthesis was unavailable; review the source evidence directly.",
                ));
                (
                    format!(
                        "Evidence collected from {} source(s); synthesis unavailable.",
                        bundle.success_count()
                    ),
                    Value::Null,
                )
            }
        };

        // Overall confidence: mean of the per-source confidences.
        let confidence = if source_confidences.is_empty() {
            0.0
        } else {
            source_confidences.values().sum::<f64>() / source_confidences.len() as f64
        };

        // Safety alerts, fixed derivation order.
        let mut safety_alerts: Vec<SafetyAlert> = Vec::new();
        if input.intent.urgency == Urgency::Critical {
            safety_alerts.push(SafetyAlert::emergency());
        }
        if input.image.is_some() {
            safety_alerts.push(SafetyAlert::image_analysis());
        }
        if medication_check {
            safety_alerts.push(SafetyAlert::medication_safety());
        }
        if confidence < self.settings.confidence_threshold {
            safety_alerts.push(SafetyAlert::low_confidence());
        }

        let missing_sources = bundle
            .failed_sources()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        let tools_consulted = bundle
            .attempted()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        // Outbound scrub on every free-text field.
        let summary = self.scrubber.scrub_text(&summary).text;
        let findings = findings
            .into_iter()
            .map(|f| Finding {
                content: self.scrubber.scrub_text(&f.content).text,
                ..f
            })
            .collect();
        let recommendations = recommendations
            .into_iter()
            .map(|f| Finding {
                content: self.scrubber.scrub_text(&f.content).text,
                ..f
            })
            .collect();
        let mut analysis = analysis;
        self.scrubber.scrub_value(&mut analysis);

        SynthesizedResponse {
            summary,
            analysis,
            findings,
            recommendations,
            safety_alerts,
            confidence,
            source_confidences,
            tools_consulted,
            missing_sources,
            timestamp: chrono::Utc::now().to_rfc3339(),
            disclaimer: self
                .settings
                .require_disclaimer
                .then(|| DISCLAIMER.to_string()),
            intent: input.intent.clone(),
        }
    }

    fn audit_query(&self, input: &SynthesisInput, started: Instant, outcome: &str) {
        let mut record = AuditRecord::new(
            AuditKind::MedicalQuery,
            AuditSeverity::Info,
            "medical-chat",
            "synthesize",
            outcome,
        )
        .with_fields(json!({
            "intents": input.intent.intents,
            "tools": input.intent.required_tools,
            "urgency": input.intent.urgency,
            "durationMs": started.elapsed().as_millis() as u64,
        }));
        if let Some(session_id) = &input.session_id {
            record = record.with_session(session_id);
        }
        self.audit.emit(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::NormalizedFormat;
    use crate::intent::classify;
    use crate::llm::adapter::ProviderRole;
    use crate::llm::parse::parse_output;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    // ── Fixtures ─────────────────────────────────────────────

    /// Evidence fixture: canned outcome per tool, call log for
    /// assertions.
    struct FixtureEvidence {
        outcomes: HashMap<ToolName, Result<Value, ToolError>>,
        calls: Mutex<Vec<(ToolName, String)>>,
    }

    impl FixtureEvidence {
        fn new(outcomes: Vec<(ToolName, Result<Value, ToolError>)>) -> Self {
            Self {
                outcomes: outcomes.into_iter().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(ToolName, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EvidenceSource for &FixtureEvidence {
        fn members(&self) -> Vec<ToolName> {
            let mut members: Vec<ToolName> = self.outcomes.keys().copied().collect();
            members.sort();
            members
        }

        async fn call(
            &self,
            tool: ToolName,
            method: &str,
            _params: Value,
            _deadline: Duration,
        ) -> Result<Value, ToolError> {
            self.calls.lock().unwrap().push((tool, method.to_string()));
            match self.outcomes.get(&tool) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(e)) => Err(e.clone()),
                None => Err(ToolError::Unavailable),
            }
        }
    }

    /// LLM fixture: canned text or failure; records vision calls.
    struct FixtureLlm {
        reply: Option<String>,
        vision_reply: Option<String>,
        vision_called: Mutex<bool>,
    }

    impl FixtureLlm {
        fn structured() -> Self {
            Self {
                reply: Some(
                    r#"{"summary": "Likely stable angina; cardiology follow-up indicated.",
                        "analysis": {"system": "cardiovascular"},
                        "recommendations": ["Obtain a 12-lead ECG", "Check troponin"],
                        "safety": ["Seek urgent care if pain at rest"],
                        "confidence": 0.8}"#
                        .to_string(),
                ),
                vision_reply: None,
                vision_called: Mutex::new(false),
            }
        }

        fn with_vision(mut self, text: &str) -> Self {
            self.vision_reply = Some(text.to_string());
            self
        }

        fn failing() -> Self {
            Self {
                reply: None,
                vision_reply: None,
                vision_called: Mutex::new(false),
            }
        }
    }

    impl Synthesizer for &FixtureLlm {
        async fn generate(
            &self,
            _system: &str,
            _prompt: &str,
            hint: ResponseHint,
            _deadline: Duration,
        ) -> Result<LlmOutcome, LlmError> {
            match &self.reply {
                Some(reply) => Ok(LlmOutcome {
                    parsed: parse_output(reply, hint),
                    provider: ProviderRole::Primary,
                    model: "fixture".to_string(),
                }),
                None => Err(LlmError::Unavailable("fixture down".to_string())),
            }
        }

        async fn analyze_image(
            &self,
            _system: &str,
            _prompt: &str,
            _bytes: &[u8],
            _mime: &str,
            hint: ResponseHint,
            _deadline: Duration,
        ) -> Result<LlmOutcome, LlmError> {
            *self.vision_called.lock().unwrap() = true;
            match &self.vision_reply {
                Some(reply) => Ok(LlmOutcome {
                    parsed: parse_output(reply, hint),
                    provider: ProviderRole::Primary,
                    model: "fixture-vision".to_string(),
                }),
                None => Err(LlmError::Unavailable("no vision".to_string())),
            }
        }
    }

    fn orchestrator<'a>(
        evidence: &'a FixtureEvidence,
        llm: &'a FixtureLlm,
        dir: &tempfile::TempDir,
    ) -> Orchestrator<&'a FixtureEvidence, &'a FixtureLlm> {
        let audit = AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();
        Orchestrator::new(
            evidence,
            llm,
            PhiScrubber::new(),
            audit,
            OrchestratorSettings::default(),
        )
    }

    fn chest_pain_input(evidence: &FixtureEvidence) -> SynthesisInput {
        let intent = classify(
            "evaluate 45-year-old female with chest pain",
            &[],
            None,
            &evidence.members(),
        );
        SynthesisInput {
            query: "evaluate 45-year-old female with chest pain".to_string(),
            intent,
            image: None,
            patient_context: Value::Null,
            history: Vec::new(),
            session_id: Some(Uuid::new_v4()),
        }
    }

    fn lit_result(confidence: f64) -> Value {
        json!({
            "findings": ["Beta blockers reduce anginal episodes"],
            "confidence": confidence,
        })
    }

    fn artifact() -> ImageArtifact {
        ImageArtifact {
            id: Uuid::new_v4(),
            content: vec![0xFF, 0xD8, 0xFF],
            thumbnail: vec![0xFF, 0xD8],
            format: NormalizedFormat::Jpeg,
            width: 640,
            height: 480,
            original_format: "png".to_string(),
            declared_mime: "image/png".to_string(),
            warnings: vec![],
            created_at_ms: 0,
            expires_at_ms: i64::MAX,
            session_hash: "deadbeef".to_string(),
            file_path: PathBuf::from("/tmp/a.jpg"),
            thumb_path: PathBuf::from("/tmp/a_thumb.jpg"),
        }
    }

    // ── Happy path ───────────────────────────────────────────

    #[tokio::test]
    async fn happy_federated_chat_merges_all_sources() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::LiteratureIndex, Ok(lit_result(0.4))),
            (ToolName::KnowledgeBase, Ok(json!({
                "findings": ["ACC/AHA chest pain guideline applies"],
                "confidence": 0.4,
            }))),
            (ToolName::Citations, Ok(json!({"findings": [], "confidence": 0.4}))),
        ]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let response = orchestrator.synthesize(chest_pain_input(&evidence)).await;

        assert!(response.summary.contains("angina"));
        assert!(response.tools_consulted.contains(&"literature-index".to_string()));
        assert!(response.tools_consulted.contains(&"knowledge-base".to_string()));
        assert!(response.confidence >= 0.5);
        assert!(response
            .findings
            .iter()
            .any(|f| f.source == "literature-index"));
        assert!(response.recommendations.iter().all(|r| r.source == "llm"));
        assert!(response.missing_sources.is_empty());
        // Confidence mean: tools at 0.5 and a structured LLM reply;
        // below the 0.6 threshold, so a non-emergency alert exists.
        assert!(response
            .safety_alerts
            .iter()
            .any(|a| a.kind != super::super::types::AlertKind::Emergency));

        let metrics = orchestrator.audit.metrics();
        assert_eq!(metrics.medical_query, 1);
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn partial_upstream_failure_keeps_synthesis() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::LiteratureIndex, Ok(lit_result(0.9))),
            (ToolName::KnowledgeBase, Ok(json!({"confidence": 0.9}))),
            (ToolName::Citations, Err(ToolError::Unavailable)),
        ]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let response = orchestrator.synthesize(chest_pain_input(&evidence)).await;

        assert_ne!(response.summary, super::super::types::SAFETY_SUMMARY);
        assert!(response.missing_sources.contains(&"citations".to_string()));
        assert!(!response.source_confidences.contains_key("citations"));
        // The bundle still records the attempt.
        assert!(response.tools_consulted.contains(&"citations".to_string()));
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn total_blackout_yields_fixed_safety_response() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::LiteratureIndex, Err(ToolError::Unavailable)),
            (ToolName::KnowledgeBase, Err(ToolError::DeadlineExceeded)),
            (ToolName::Citations, Err(ToolError::Unavailable)),
        ]);
        let llm = FixtureLlm::failing();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let response = orchestrator.synthesize(chest_pain_input(&evidence)).await;

        assert_eq!(response.summary, "Medical analysis unavailable");
        assert!(response
            .recommendations
            .iter()
            .any(|r| r.content == "Please consult with a healthcare professional"));
        assert_eq!(response.confidence, 0.0);
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn evidence_only_response_when_llm_down() {
        let evidence = FixtureEvidence::new(vec![(
            ToolName::LiteratureIndex,
            Ok(lit_result(0.8)),
        )]);
        let llm = FixtureLlm::failing();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let mut input = chest_pain_input(&evidence);
        input.intent = classify("chest pain", &[], None, &[ToolName::LiteratureIndex]);
        let response = orchestrator.synthesize(input).await;

        // Not a safety response: one source succeeded.
        assert_ne!(response.summary, super::super::types::SAFETY_SUMMARY);
        assert!(response.summary.contains("synthesis unavailable"));
        assert!(!response.findings.is_empty());
        orchestrator.audit.shutdown();
    }

    // ── Emergency & alerts ───────────────────────────────────

    #[tokio::test]
    async fn critical_urgency_puts_exactly_one_emergency_alert_first() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::KnowledgeBase, Ok(json!({"confidence": 0.9}))),
            (ToolName::LiteratureIndex, Ok(json!({"confidence": 0.9}))),
        ]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let intent = classify(
            "patient unconscious with seizure, critical",
            &[],
            None,
            &(&evidence).members(),
        );
        let response = orchestrator
            .synthesize(SynthesisInput {
                query: "patient unconscious with seizure, critical".to_string(),
                intent,
                image: None,
                patient_context: Value::Null,
                history: Vec::new(),
                session_id: None,
            })
            .await;

        let first = &response.safety_alerts[0];
        assert_eq!(first.kind, super::super::types::AlertKind::Emergency);
        assert_eq!(first.level, super::super::types::AlertLevel::Critical);
        assert_eq!(
            first.action,
            "Call emergency services or go to the nearest emergency room immediately"
        );
        let emergency_count = response
            .safety_alerts
            .iter()
            .filter(|a| a.kind == super::super::types::AlertKind::Emergency)
            .count();
        assert_eq!(emergency_count, 1);
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn drug_interaction_plan_adds_medication_alert() {
        let evidence = FixtureEvidence::new(vec![(
            ToolName::KnowledgeBase,
            Ok(json!({"interactions": [], "confidence": 0.9})),
        )]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let intent = classify(
            "check drug interaction with warfarin",
            &[],
            None,
            &(&evidence).members(),
        );
        let response = orchestrator
            .synthesize(SynthesisInput {
                query: "check drug interaction with warfarin".to_string(),
                intent,
                image: None,
                patient_context: json!({"medications": ["warfarin", "aspirin"]}),
                history: Vec::new(),
                session_id: None,
            })
            .await;

        assert!(response
            .safety_alerts
            .iter()
            .any(|a| a.kind == super::super::types::AlertKind::MedicationSafety));
        let calls = evidence.calls();
        assert!(calls
            .iter()
            .any(|(t, m)| *t == ToolName::KnowledgeBase && m == "checkDrugInteractions"));
        orchestrator.audit.shutdown();
    }

    // ── Image branch ─────────────────────────────────────────

    #[tokio::test]
    async fn image_branch_runs_vision_and_imaging_tool() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::Imaging, Ok(json!({
                "findings": ["Opacity in right lower lobe"],
                "confidence": 0.75,
            }))),
            (ToolName::LiteratureIndex, Ok(lit_result(0.8))),
        ]);
        let llm = FixtureLlm::structured()
            .with_vision("The image shows a focal opacity. A study of similar cases supports follow-up imaging.");
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let intent = classify(
            "evaluate for pneumonia",
            &[crate::intent::FileDescriptor {
                filename: "chest_xray.png".to_string(),
                mime: "image/png".to_string(),
            }],
            None,
            &(&evidence).members(),
        );
        let response = orchestrator
            .synthesize(SynthesisInput {
                query: "evaluate for pneumonia".to_string(),
                intent,
                image: Some(artifact()),
                patient_context: Value::Null,
                history: Vec::new(),
                session_id: None,
            })
            .await;

        assert!(*llm.vision_called.lock().unwrap());
        assert!(response.findings.iter().any(|f| f.source == "imaging"));
        assert!(response.findings.iter().any(|f| f.source == "vision"));
        assert!(response
            .safety_alerts
            .iter()
            .any(|a| a.kind == super::super::types::AlertKind::ImageAnalysis
                && a.level == super::super::types::AlertLevel::High));
        assert!(response.source_confidences.contains_key("vision"));
        orchestrator.audit.shutdown();
    }

    // ── Determinism & scrubbing ──────────────────────────────

    #[tokio::test]
    async fn identical_inputs_and_evidence_merge_identically() {
        let evidence = FixtureEvidence::new(vec![
            (ToolName::LiteratureIndex, Ok(lit_result(0.8))),
            (ToolName::KnowledgeBase, Ok(json!({"confidence": 0.7}))),
            (ToolName::Citations, Ok(json!({"confidence": 0.6}))),
        ]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let a = orchestrator.synthesize(chest_pain_input(&evidence)).await;
        let b = orchestrator.synthesize(chest_pain_input(&evidence)).await;

        let mut a = serde_json::to_value(&a).unwrap();
        let mut b = serde_json::to_value(&b).unwrap();
        a.as_object_mut().unwrap().remove("timestamp");
        b.as_object_mut().unwrap().remove("timestamp");
        assert_eq!(a, b);
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn outbound_scrub_removes_phi_from_model_output() {
        let evidence = FixtureEvidence::new(vec![(
            ToolName::LiteratureIndex,
            Ok(json!({"confidence": 0.9})),
        )]);
        let llm = FixtureLlm {
            reply: Some(
                "The patient can be reached at 555-867-5309. \
                 We recommend follow-up with jane@example.org."
                    .to_string(),
            ),
            vision_reply: None,
            vision_called: Mutex::new(false),
        };
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&evidence, &llm, &dir);

        let response = orchestrator.synthesize(chest_pain_input(&evidence)).await;
        let serialized = serde_json::to_string(&response).unwrap();
        assert!(!serialized.contains("555-867-5309"));
        assert!(!serialized.contains("jane@example.org"));
        orchestrator.audit.shutdown();
    }

    #[tokio::test]
    async fn disclaimer_follows_configuration() {
        let evidence = FixtureEvidence::new(vec![(
            ToolName::LiteratureIndex,
            Ok(json!({"confidence": 0.9})),
        )]);
        let llm = FixtureLlm::structured();
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();
        let orchestrator = Orchestrator::new(
            &evidence,
            &llm,
            PhiScrubber::new(),
            audit,
            OrchestratorSettings {
                require_disclaimer: false,
                ..OrchestratorSettings::default()
            },
        );

        let response = orchestrator.synthesize(chest_pain_input(&evidence)).await;
        assert!(response.disclaimer.is_none());
        orchestrator.audit.shutdown();
    }
}
