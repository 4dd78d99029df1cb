//! Focused medical endpoints: differential diagnosis, clinical
//! trials, drug interactions, and standalone image analysis.

use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::endpoints::chat::{read_parts, run_chat};
use crate::api::error::ApiError;
use crate::api::types::{ApiContext, SessionContext};
use crate::federation::SynthesizedResponse;
use crate::tools::ToolName;

fn tool_deadline(ctx: &ApiContext) -> Duration {
    Duration::from_secs(ctx.config.request_deadline_secs)
}

// ── Differential diagnosis ───────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialRequest {
    pub clinical_data: Option<Value>,
}

/// `POST /api/medical/differential-diagnosis`
///
/// Runs the full synthesis pipeline over the supplied clinical data;
/// the classifier sees the flattened text and routes accordingly.
pub async fn differential_diagnosis(
    State(ctx): State<ApiContext>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<DifferentialRequest>,
) -> Result<Json<SynthesizedResponse>, ApiError> {
    let clinical_data = request
        .clinical_data
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::MissingField("clinicalData".into()))?;

    let message = match &clinical_data {
        Value::String(s) => format!("differential diagnosis: {s}"),
        other => format!("differential diagnosis for: {other}"),
    };
    let parts = crate::api::endpoints::chat::ChatParts {
        message: Some(message),
        patient_context: clinical_data,
        history: Vec::new(),
        image: None,
    };
    let response = run_chat(&ctx, &session, parts, "differential-diagnosis").await?;
    Ok(Json(response))
}

// ── Clinical trials ──────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialsRequest {
    pub condition: Option<String>,
    pub patient_criteria: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialsResponse {
    pub condition: String,
    pub results: Value,
    pub timestamp: String,
}

/// `POST /api/medical/clinical-trials` — a single-tool lookup.
pub async fn clinical_trials(
    State(ctx): State<ApiContext>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<TrialsRequest>,
) -> Result<Json<TrialsResponse>, ApiError> {
    let condition = request
        .condition
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::MissingField("condition".into()))?;

    let condition = ctx.scrubber.scrub_text(&condition).text;
    let mut criteria = request.patient_criteria.unwrap_or(Value::Null);
    ctx.scrubber.scrub_value(&mut criteria);

    let results = ctx
        .pool
        .call(
            ToolName::ClinicalTrials,
            "searchTrials",
            Some(json!({ "condition": condition, "patientCriteria": criteria })),
            tool_deadline(&ctx),
        )
        .await?;

    ctx.sessions.record_usage(
        &session.session_id,
        &["clinical-trials".to_string()],
        "clinical-trials",
    );

    Ok(Json(TrialsResponse {
        condition,
        results,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

// ── Drug interactions ────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionsRequest {
    pub medications: Option<Vec<String>>,
    pub new_drug: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionsResponse {
    pub medications: Vec<String>,
    pub results: Value,
    pub timestamp: String,
}

/// `POST /api/medical/drug-interactions` — knowledge-base lookup.
pub async fn drug_interactions(
    State(ctx): State<ApiContext>,
    Extension(session): Extension<SessionContext>,
    Json(request): Json<InteractionsRequest>,
) -> Result<Json<InteractionsResponse>, ApiError> {
    let medications: Vec<String> = request
        .medications
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect();
    if medications.is_empty() {
        return Err(ApiError::MissingField("medications".into()));
    }

    let results = ctx
        .pool
        .call(
            ToolName::KnowledgeBase,
            "checkDrugInteractions",
            Some(json!({
                "medications": medications,
                "newDrug": request.new_drug,
            })),
            tool_deadline(&ctx),
        )
        .await?;

    ctx.sessions.record_usage(
        &session.session_id,
        &["knowledge-base".to_string()],
        "drug-interactions",
    );

    Ok(Json(InteractionsResponse {
        medications,
        results,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }))
}

// ── Image analysis ───────────────────────────────────────────

/// `POST /api/medical/image-analysis` (multipart) — the chat pipeline
/// with the image branch mandatory.
pub async fn image_analysis(
    State(ctx): State<ApiContext>,
    Extension(session): Extension<SessionContext>,
    multipart: Multipart,
) -> Result<Json<SynthesizedResponse>, ApiError> {
    let mut parts = read_parts(multipart).await?;
    if parts.image.is_none() {
        return Err(ApiError::MissingField("medicalImage".into()));
    }
    if parts.message.is_none() {
        parts.message = Some("Analyze the attached medical image.".to_string());
    }
    let response = run_chat(&ctx, &session, parts, "image-analysis").await?;
    Ok(Json(response))
}
