//! Session issuance.

use std::net::SocketAddr;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State};
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::session::ClientFingerprint;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: String,
}

/// `POST /api/session` — create a session bound to the client
/// fingerprint; returns the signed bearer token and its expiry.
///
/// The fingerprint hashes the user agent and peer address; neither is
/// stored raw. The peer address is absent when the router is driven
/// without connect info (tests), which degrades to a fixed marker.
pub async fn create(
    State(ctx): State<ApiContext>,
    req: Request,
) -> Result<Json<SessionResponse>, ApiError> {
    let user_agent = req
        .headers()
        .get("User-Agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let peer_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|| "unknown-peer".to_string());

    let issued = ctx
        .sessions
        .create(&ClientFingerprint { user_agent, peer_addr })
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let expires_at = chrono::DateTime::from_timestamp(issued.expires_at, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    Ok(Json(SessionResponse {
        token: issued.token,
        expires_at,
    }))
}
