//! Aggregate audit metrics for compliance reporting.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::types::ApiContext;

#[derive(Deserialize)]
pub struct ComplianceQuery {
    pub timeframe: Option<String>,
}

/// `GET /api/medical/compliance-report?timeframe=…`
///
/// Reports in-process counters from the audit sink. Counters reset
/// with the process; the rolled JSONL streams remain the durable
/// record.
pub async fn report(
    State(ctx): State<ApiContext>,
    Query(query): Query<ComplianceQuery>,
) -> Json<Value> {
    let metrics = ctx.audit.metrics();
    Json(json!({
        "timeframe": query.timeframe.unwrap_or_else(|| "24h".to_string()),
        "auditEnabled": ctx.config.hipaa_audit_enabled,
        "records": metrics,
        "activeSessions": ctx.sessions.active_count(),
        "generatedAt": chrono::Utc::now().to_rfc3339(),
    }))
}
