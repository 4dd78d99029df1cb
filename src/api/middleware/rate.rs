//! Rate-limiting middleware.
//!
//! Keys on the validated session when one is present (auth runs
//! before this layer), otherwise on the hashed peer address. Medical
//! routes carry a tighter cap than the general surface.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, SessionContext};
use crate::rate_limit::{identifier_for, EndpointClass};

fn class_for_path(path: &str) -> EndpointClass {
    if path.starts_with("/api/medical") {
        EndpointClass::Medical
    } else {
        EndpointClass::General
    }
}

pub async fn limit(req: Request<axum::body::Body>, next: Next) -> Response {
    match limit_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn limit_inner(
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let session_id = req
        .extensions()
        .get::<SessionContext>()
        .map(|s| s.session_id);
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|| "unknown-peer".to_string());

    let identifier = identifier_for(session_id.as_ref(), &peer);
    let class = class_for_path(req.uri().path());

    let decision = ctx.rate_limiter.check(&identifier, class);
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            remaining: 0,
            reset_at_ms: decision.reset_at_ms,
        });
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(value) = axum::http::HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = axum::http::HeaderValue::from_str(&decision.reset_at_ms.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn medical_paths_get_the_tighter_class() {
        assert_eq!(class_for_path("/api/medical-chat"), EndpointClass::Medical);
        assert_eq!(
            class_for_path("/api/medical/drug-interactions"),
            EndpointClass::Medical
        );
        assert_eq!(class_for_path("/api/session"), EndpointClass::General);
        assert_eq!(class_for_path("/api/health"), EndpointClass::General);
    }
}
