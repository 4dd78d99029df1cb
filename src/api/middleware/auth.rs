//! Bearer-token session validation middleware.
//!
//! Extracts `Authorization: Bearer <token>`, validates it against the
//! session store (which also touches `last_activity`), and injects
//! `SessionContext` into request extensions for downstream layers and
//! handlers.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, SessionContext};

pub async fn require_session(req: Request<axum::body::Body>, next: Next) -> Response {
    match require_session_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn require_session_inner(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let validated = ctx.sessions.validate(token)?;

    let session = SessionContext {
        session_id: validated.session_id,
        expires_at: validated.expires_at,
    };
    req.extensions_mut().insert(session.clone());

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert("Cache-Control", axum::http::HeaderValue::from_static("no-store"));
    // Propagate the identity outward so the audit layer can hash it.
    response.extensions_mut().insert(session);
    Ok(response)
}
