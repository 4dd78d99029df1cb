//! Health and capability surfaces.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::types::ApiContext;
use crate::config::{APP_NAME, APP_VERSION};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

/// `GET /` — identity/version.
pub async fn identity() -> Json<Value> {
    Json(json!({ "service": APP_NAME, "version": APP_VERSION }))
}

/// `GET /api/health` — aggregate liveness.
pub async fn aggregate(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: APP_NAME,
        version: APP_VERSION,
        uptime_secs: ctx.started_at.elapsed().as_secs(),
    })
}

/// `GET /api/medical/health` — per-component health.
pub async fn per_component(State(ctx): State<ApiContext>) -> Json<Value> {
    let tools: Value = ctx
        .pool
        .statuses()
        .into_iter()
        .map(|(name, status)| (name.as_str().to_string(), json!(status)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "status": "ok",
        "tools": tools,
        "activeSessions": ctx.sessions.active_count(),
        "imageArtifacts": ctx.images.count(),
        "audit": ctx.audit.metrics(),
    }))
}

/// `GET /api/medical/tools` — pool membership and capabilities.
pub async fn tools(State(ctx): State<ApiContext>) -> Json<Value> {
    let members: Vec<Value> = ctx
        .pool
        .statuses()
        .into_iter()
        .map(|(name, status)| json!({ "name": name, "status": status }))
        .collect();
    Json(json!({
        "tools": members,
        "capabilities": ctx.pool.capabilities(),
    }))
}
