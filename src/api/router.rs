//! Route table and middleware stack.
//!
//! Public routes: identity, session issuance, aggregate health.
//! Protected routes require `Authorization: Bearer <token>` and run
//! the full chain. Layers apply bottom (innermost) to top (outermost):
//! rate limiter → session validation → inbound audit → Extension.

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::response::Redirect;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::api::endpoints::{chat, compliance, health, medical, session};
use crate::api::middleware;
use crate::api::types::ApiContext;

/// Build the full API router.
pub fn api_router(ctx: ApiContext) -> Router {
    // Uploads up to the configured image cap, plus form overhead.
    let body_limit =
        DefaultBodyLimit::max(ctx.config.max_image_bytes as usize + 1024 * 1024);
    let cors = cors_layer(&ctx.config.cors_origins);

    let public = Router::new()
        .route("/", get(health::identity))
        .route("/api/session", post(session::create))
        .route("/api/health", get(health::aggregate))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::middleware::from_fn(middleware::audit::log_request))
        .layer(axum::Extension(ctx.clone()));

    let protected = Router::new()
        .route("/api/medical-chat", post(chat::medical_chat))
        .route(
            "/api/medical/differential-diagnosis",
            post(medical::differential_diagnosis),
        )
        .route("/api/medical/clinical-trials", post(medical::clinical_trials))
        .route("/api/medical/drug-interactions", post(medical::drug_interactions))
        .route("/api/medical/image-analysis", post(medical::image_analysis))
        .route("/api/medical/health", get(health::per_component))
        .route("/api/medical/tools", get(health::tools))
        .route("/api/medical/compliance-report", get(compliance::report))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::middleware::from_fn(middleware::auth::require_session))
        .layer(axum::middleware::from_fn(middleware::audit::log_request))
        .layer(axum::Extension(ctx))
        .layer(body_limit);

    Router::new()
        .merge(public)
        .merge(protected)
        .route("/api/chat", any(legacy_chat_redirect))
        .layer(cors)
}

/// CORS policy from configuration. Empty origin list means a local
/// development setup and allows any origin.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .expose_headers([
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
        ]);

    if origins.is_empty() {
        cors.allow_origin(Any).allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        cors.allow_origin(parsed)
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
    }
}

/// The legacy chat path permanently redirects to `/api/medical-chat`.
async fn legacy_chat_redirect() -> Redirect {
    Redirect::permanent("/api/medical-chat")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::config::AppConfig;

    fn test_config(dir: &std::path::Path, medical_cap: u32) -> AppConfig {
        let audit_dir = dir.join("audit").display().to_string();
        let scratch_dir = dir.join("scratch").display().to_string();
        let cap = medical_cap.to_string();
        let pairs: Vec<(&str, String)> = vec![
            ("ENCRYPTION_KEY", "router-test-key".to_string()),
            ("JWT_SECRET", "router-test-secret".to_string()),
            ("AUDIT_LOG_DIR", audit_dir),
            ("IMAGE_SCRATCH_DIR", scratch_dir),
            ("MEDICAL_API_RATE_LIMIT_MAX", cap),
        ];
        AppConfig::from_lookup(&|key| {
            pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    fn test_ctx(dir: &tempfile::TempDir) -> ApiContext {
        ApiContext::build(test_config(dir.path(), 20)).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_session(ctx: &ApiContext) -> String {
        let app = api_router(ctx.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session")
                    .header("User-Agent", "router-tests/1.0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        json["token"].as_str().unwrap().to_string()
    }

    fn get_with_token(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    fn multipart_body(fields: &[(&str, &str)]) -> (String, Body) {
        let boundary = "meridian-test-boundary";
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{boundary}--\r\n"));
        (
            format!("multipart/form-data; boundary={boundary}"),
            Body::from(body),
        )
    }

    #[tokio::test]
    async fn identity_endpoint_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let response = api_router(ctx)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "Meridian");
    }

    #[tokio::test]
    async fn session_issuance_returns_token_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let app = api_router(ctx);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(!json["token"].as_str().unwrap().is_empty());
        assert!(!json["expiresAt"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn protected_route_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .uri("/api/medical/tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["code"], "NO_SESSION_TOKEN");
    }

    #[tokio::test]
    async fn garbage_token_is_invalid_session() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let response = api_router(ctx)
            .oneshot(get_with_token("/api/medical/tools", "not-a-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["code"], "INVALID_SESSION");
    }

    #[tokio::test]
    async fn valid_token_reaches_protected_routes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;

        let response = api_router(ctx.clone())
            .oneshot(get_with_token("/api/medical/health", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Cache-Control").unwrap(),
            "no-store"
        );
        assert!(response.headers().contains_key("X-RateLimit-Remaining"));
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json.get("tools").is_some());
    }

    #[tokio::test]
    async fn tools_endpoint_reports_pool() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;

        let response = api_router(ctx)
            .oneshot(get_with_token("/api/medical/tools", &token))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json["tools"].as_array().unwrap().is_empty());
        assert!(json["capabilities"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_chat_path_permanently_redirects() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers().get("Location").unwrap(),
            "/api/medical-chat"
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .uri("/api/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn medical_rate_cap_yields_429_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ApiContext::build(test_config(dir.path(), 1)).unwrap();
        let token = create_session(&ctx).await;

        let ok = api_router(ctx.clone())
            .oneshot(get_with_token("/api/medical/tools", &token))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let limited = api_router(ctx.clone())
            .oneshot(get_with_token("/api/medical/tools", &token))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            limited.headers().get("X-RateLimit-Remaining").unwrap(),
            "0"
        );
        assert!(limited.headers().contains_key("X-RateLimit-Reset"));
        let json = body_json(limited).await;
        assert_eq!(json["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn drug_interactions_validates_medications() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;

        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/medical/drug-interactions")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"medications": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "MISSING_FIELD");
        assert_eq!(json["details"], "medications");
    }

    #[tokio::test]
    async fn drug_interactions_with_no_pool_is_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;

        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/medical/drug-interactions")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("Content-Type", "application/json")
                    .body(Body::from(r#"{"medications": ["warfarin", "aspirin"]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["code"], "TOOL_UNAVAILABLE");
    }

    #[tokio::test]
    async fn chat_without_message_is_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;
        let (content_type, body) = multipart_body(&[("patientContext", "{}")]);

        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/medical-chat")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("Content-Type", content_type)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["code"], "MISSING_FIELD");
    }

    #[tokio::test]
    async fn chat_with_all_upstreams_down_serves_safety_response_at_200() {
        // No tools configured and no LLM provider: total blackout.
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;
        let (content_type, body) =
            multipart_body(&[("message", "evaluate 45-year-old female with chest pain")]);

        let response = api_router(ctx)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/medical-chat")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("Content-Type", content_type)
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["summary"], "Medical analysis unavailable");
        assert!(json["recommendations"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["content"] == "Please consult with a healthcare professional"));
        assert!(json["intent"]["intents"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "SYMPTOM_ANALYSIS"));
    }

    #[tokio::test]
    async fn compliance_report_returns_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let token = create_session(&ctx).await;

        let response = api_router(ctx)
            .oneshot(get_with_token(
                "/api/medical/compliance-report?timeframe=7d",
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["timeframe"], "7d");
        assert!(json["records"].get("medicalQuery").is_some() || json["records"].get("medical_query").is_some());
    }

    #[tokio::test]
    async fn expired_session_is_typed() {
        // Zero-TTL config: the token expires immediately.
        let dir = tempfile::tempdir().unwrap();
        let audit_dir = dir.path().join("audit").display().to_string();
        let scratch_dir = dir.path().join("scratch").display().to_string();
        let pairs: Vec<(&str, String)> = vec![
            ("ENCRYPTION_KEY", "k".to_string()),
            ("JWT_SECRET", "s".to_string()),
            ("AUDIT_LOG_DIR", audit_dir),
            ("IMAGE_SCRATCH_DIR", scratch_dir),
            ("SESSION_TTL_SECS", "0".to_string()),
        ];
        let config = AppConfig::from_lookup(&|key| {
            pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        let ctx = ApiContext::build(config).unwrap();
        let token = {
            let issued = ctx
                .sessions
                .create(&crate::session::ClientFingerprint {
                    user_agent: "ua".into(),
                    peer_addr: "peer".into(),
                })
                .unwrap();
            issued.token
        };

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let response = api_router(ctx)
            .oneshot(get_with_token("/api/medical/tools", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["code"], "SESSION_EXPIRED");
    }
}
