//! Shared context for the API layer — the composition root.
//!
//! `ApiContext::build` wires every component once, at startup; the
//! router and middleware receive clones of the resulting handle.
//! Nothing else in the crate constructs cross-component dependencies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::AppConfig;
use crate::crypto::token::{SystemClock, TokenService};
use crate::federation::{Orchestrator, OrchestratorSettings};
use crate::imaging::ImageStore;
use crate::llm::LlmAdapter;
use crate::rate_limit::RateLimiter;
use crate::scrub::PhiScrubber;
use crate::session::SessionStore;
use crate::tools::client::ClientSettings;
use crate::tools::ToolPool;

/// Concrete orchestrator wiring used by the service.
pub type AppOrchestrator = Orchestrator<Arc<ToolPool>, LlmAdapter>;

/// Errors preventing the context from being built.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Audit sink failed to start: {0}")]
    Audit(#[from] std::io::Error),
}

/// Shared state for all routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Arc<AppConfig>,
    pub scrubber: PhiScrubber,
    pub audit: AuditSink,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub pool: Arc<ToolPool>,
    pub images: Arc<ImageStore>,
    pub orchestrator: Arc<AppOrchestrator>,
    pub started_at: Instant,
}

impl ApiContext {
    /// Wire every component from configuration.
    pub fn build(config: AppConfig) -> Result<Self, BuildError> {
        let scrubber = PhiScrubber::with_aliases(&config.phi_field_aliases);

        let audit = AuditSink::start(
            &config.audit_log_dir,
            config.audit_max_file_bytes,
            config.audit_max_files,
            scrubber.clone(),
        )?;

        let clock = Arc::new(SystemClock);
        let tokens = TokenService::with_clock(&config.jwt_secret, clock.clone());
        let sessions = Arc::new(SessionStore::new(
            tokens,
            clock,
            config.session_ttl_secs,
            audit.clone(),
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_window_ms,
            config.rate_max_general,
            config.rate_max_medical,
            audit.clone(),
        ));

        let pool = Arc::new(ToolPool::from_config(
            &config.tool_providers,
            ClientSettings {
                pending_cap: config.tool_pending_cap,
                max_reconnects: config.tool_max_reconnects,
                ..ClientSettings::default()
            },
        ));

        let images = Arc::new(ImageStore::new(
            &config.image_scratch_dir,
            config.max_image_bytes,
            config.supported_image_formats.clone(),
            Duration::from_secs(config.image_ttl_secs),
        )?);

        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            LlmAdapter::new(&config),
            scrubber.clone(),
            audit.clone(),
            OrchestratorSettings {
                request_deadline: Duration::from_secs(config.request_deadline_secs),
                confidence_threshold: config.confidence_threshold,
                require_disclaimer: config.require_disclaimer,
                ..OrchestratorSettings::default()
            },
        ));

        Ok(Self {
            config: Arc::new(config),
            scrubber,
            audit,
            sessions,
            rate_limiter,
            pool,
            images,
            orchestrator,
            started_at: Instant::now(),
        })
    }
}

/// Validated session identity, injected into request extensions by
/// the auth middleware.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub expires_at: i64,
}
