//! The federated medical chat endpoint.
//!
//! `POST /api/medical-chat` (multipart): `message` text,
//! `patientContext` JSON string, `conversationHistory` JSON string,
//! optional `medicalImage` file. The handler scrubs inbound text and
//! context, stores the image, classifies intent, and hands one
//! `SynthesisInput` to the orchestrator.

use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::{Extension, Json};
use serde_json::Value;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, SessionContext};
use crate::federation::orchestrator::SynthesisInput;
use crate::federation::prompt::ChatTurn;
use crate::federation::SynthesizedResponse;
use crate::imaging::spawn_expiry;
use crate::intent::{classify, FileDescriptor};

pub const MAX_MESSAGE_CHARS: usize = 4_000;

/// Parts extracted from the multipart body.
#[derive(Default)]
pub struct ChatParts {
    pub message: Option<String>,
    pub patient_context: Value,
    pub history: Vec<ChatTurn>,
    pub image: Option<UploadedImage>,
}

pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub filename: String,
}

pub async fn read_parts(mut multipart: Multipart) -> Result<ChatParts, ApiError> {
    let mut parts = ChatParts::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidField(format!("multipart: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" | "clinicalContext" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidField(format!("message: {e}")))?;
                parts.message = Some(text);
            }
            "patientContext" | "analysisOptions" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidField(format!("patientContext: {e}")))?;
                if !text.trim().is_empty() {
                    parts.patient_context = serde_json::from_str(&text)
                        .map_err(|_| ApiError::InvalidField("patientContext".into()))?;
                }
            }
            "conversationHistory" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InvalidField(format!("conversationHistory: {e}")))?;
                if !text.trim().is_empty() {
                    parts.history = serde_json::from_str(&text)
                        .map_err(|_| ApiError::InvalidField("conversationHistory".into()))?;
                }
            }
            "medicalImage" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::PayloadTooLarge)?
                    .to_vec();
                parts.image = Some(UploadedImage { bytes, mime, filename });
            }
            _ => {}
        }
    }
    Ok(parts)
}

/// Shared pipeline behind `medical-chat` and `image-analysis`.
pub async fn run_chat(
    ctx: &ApiContext,
    session: &SessionContext,
    parts: ChatParts,
    resource: &str,
) -> Result<SynthesizedResponse, ApiError> {
    let message = parts
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::MissingField("message".into()))?;
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::InvalidField("message exceeds maximum length".into()));
    }

    // Inbound scrub of everything that can carry identifiers.
    let query = ctx.scrubber.scrub_text(&message).text;
    let mut patient_context = parts.patient_context;
    ctx.scrubber.scrub_value(&mut patient_context);
    let history: Vec<ChatTurn> = parts
        .history
        .into_iter()
        .map(|turn| ChatTurn {
            role: turn.role,
            content: ctx.scrubber.scrub_text(&turn.content).text,
        })
        .collect();

    let mut files = Vec::new();
    let mut artifact = None;
    if let Some(upload) = parts.image {
        let descriptor = FileDescriptor {
            filename: upload.filename.clone(),
            mime: upload.mime.clone(),
        };
        // Transcoding is CPU-bound; keep it off the async executor.
        let images = ctx.images.clone();
        let session_id = session.session_id;
        let ingested = tokio::task::spawn_blocking(move || {
            images.ingest(&upload.bytes, &upload.mime, &upload.filename, &session_id)
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
        spawn_expiry(
            ctx.images.clone(),
            ingested.id,
            Duration::from_secs(ctx.config.image_ttl_secs),
        );
        files.push(descriptor);
        artifact = Some(ingested);
    }

    let context_ref = (!patient_context.is_null()).then_some(&patient_context);
    let intent = classify(&query, &files, context_ref, &ctx.pool.members());
    let tools_used: Vec<String> = intent
        .required_tools
        .iter()
        .map(|t| t.as_str().to_string())
        .collect();

    let response = ctx
        .orchestrator
        .synthesize(SynthesisInput {
            query,
            intent,
            image: artifact,
            patient_context,
            history,
            session_id: Some(session.session_id),
        })
        .await;

    ctx.sessions
        .record_usage(&session.session_id, &tools_used, resource);
    Ok(response)
}

/// `POST /api/medical-chat`
pub async fn medical_chat(
    State(ctx): State<ApiContext>,
    Extension(session): Extension<SessionContext>,
    multipart: Multipart,
) -> Result<Json<SynthesizedResponse>, ApiError> {
    let parts = read_parts(multipart).await?;
    let response = run_chat(&ctx, &session, parts, "medical-chat").await?;
    Ok(Json(response))
}
