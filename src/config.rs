//! Environment-derived configuration.
//!
//! Everything tunable comes in through environment variables; the two
//! secrets (`ENCRYPTION_KEY`, `JWT_SECRET`) are required and their
//! absence is a startup failure — the process refuses to serve any
//! medical endpoint without them.

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// Application-level constants
pub const APP_NAME: &str = "Meridian";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "info,meridian=debug"
}

/// Errors raised while assembling configuration at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required secret {0} is not set")]
    MissingSecret(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Which LLM provider the adapter tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreference {
    Primary,
    Fallback,
}

/// One LLM provider endpoint (OpenAI-style chat completions contract).
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Launch description for one tool provider subprocess.
#[derive(Debug, Clone)]
pub struct ToolProviderConfig {
    /// Closed-vocabulary tool name (validated by the pool at startup).
    pub name: String,
    /// Path to the provider executable.
    pub path: PathBuf,
    /// Environment variable names forwarded to the child; everything
    /// else is stripped from its environment.
    pub env_passthrough: Vec<String>,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,

    /// 32-byte AES key derived from ENCRYPTION_KEY.
    pub encryption_key: [u8; 32],
    pub jwt_secret: String,

    pub hipaa_audit_enabled: bool,
    pub audit_log_dir: PathBuf,
    pub audit_max_file_bytes: u64,
    pub audit_max_files: usize,

    pub model_preference: ModelPreference,
    pub confidence_threshold: f64,
    pub require_disclaimer: bool,
    pub primary_llm: Option<LlmProviderConfig>,
    pub fallback_llm: Option<LlmProviderConfig>,
    pub llm_timeout_secs: u64,

    pub max_image_bytes: u64,
    pub supported_image_formats: Vec<String>,
    pub image_scratch_dir: PathBuf,
    pub image_ttl_secs: u64,

    pub rate_window_ms: u64,
    pub rate_max_general: u32,
    pub rate_max_medical: u32,

    pub session_ttl_secs: u64,

    pub tool_providers: Vec<ToolProviderConfig>,
    pub tool_pending_cap: usize,
    pub tool_max_reconnects: u32,

    pub phi_field_aliases: Vec<String>,
    pub request_deadline_secs: u64,
}

/// Tool provider names and the env vars that configure them.
const TOOL_PATH_VARS: &[(&str, &str)] = &[
    ("literature-index", "LITERATURE_INDEX_TOOL_PATH"),
    ("citations", "CITATIONS_TOOL_PATH"),
    ("clinical-trials", "CLINICAL_TRIALS_TOOL_PATH"),
    ("knowledge-base", "KNOWLEDGE_BASE_TOOL_PATH"),
    ("imaging", "IMAGING_TOOL_PATH"),
];

impl AppConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_lookup(&|key| vars.get(key).cloned())
    }

    /// Build configuration from an arbitrary lookup function.
    ///
    /// Separated from `from_env` so tests can supply variables without
    /// mutating process-global state.
    pub fn from_lookup(
        get: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let encryption_key_raw = get("ENCRYPTION_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingSecret("ENCRYPTION_KEY"))?;
        let jwt_secret = get("JWT_SECRET")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingSecret("JWT_SECRET"))?;

        let max_image_mb = parse_or("MAX_IMAGE_SIZE_MB", get, 50u64)?;

        let mut tool_providers = Vec::new();
        for (name, var) in TOOL_PATH_VARS {
            if let Some(path) = get(var).filter(|v| !v.trim().is_empty()) {
                // Per-tool env needs: <VAR>_ENV is a comma list of names
                // forwarded into the child's filtered environment.
                let env_passthrough = get(&format!("{var}_ENV"))
                    .map(|v| split_list(&v))
                    .unwrap_or_default();
                tool_providers.push(ToolProviderConfig {
                    name: (*name).to_string(),
                    path: PathBuf::from(path),
                    env_passthrough,
                });
            }
        }

        let primary_llm =
            llm_provider(get, "PRIMARY_LLM_URL", "PRIMARY_LLM_KEY", "PRIMARY_LLM_MODEL");
        let fallback_llm =
            llm_provider(get, "FALLBACK_LLM_URL", "FALLBACK_LLM_KEY", "FALLBACK_LLM_MODEL");

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or("PORT", get, 8080u16)?,
            cors_origins: get("CORS_ORIGINS").map(|v| split_list(&v)).unwrap_or_default(),

            encryption_key: derive_key(&encryption_key_raw),
            jwt_secret,

            hipaa_audit_enabled: parse_bool_or("HIPAA_AUDIT_ENABLED", get, true),
            audit_log_dir: get("AUDIT_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("audit-logs")),
            audit_max_file_bytes: parse_or("AUDIT_MAX_FILE_BYTES", get, 10 * 1024 * 1024u64)?,
            audit_max_files: parse_or("AUDIT_MAX_FILES", get, 10usize)?,

            model_preference: match get("AI_MODEL_PREFERENCE").as_deref() {
                Some("fallback") => ModelPreference::Fallback,
                _ => ModelPreference::Primary,
            },
            confidence_threshold: parse_or("AI_CONFIDENCE_THRESHOLD", get, 0.6f64)?,
            require_disclaimer: parse_bool_or("REQUIRE_MEDICAL_DISCLAIMER", get, true),
            primary_llm,
            fallback_llm,
            llm_timeout_secs: parse_or("LLM_TIMEOUT_SECS", get, 30u64)?,

            max_image_bytes: max_image_mb * 1024 * 1024,
            supported_image_formats: get("SUPPORTED_IMAGE_FORMATS")
                .map(|v| split_list(&v))
                .unwrap_or_else(|| {
                    ["jpg", "jpeg", "png", "tiff", "tif", "bmp", "webp", "dcm"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect()
                }),
            image_scratch_dir: get("IMAGE_SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scratch/images")),
            image_ttl_secs: parse_or("IMAGE_TTL_SECS", get, 3600u64)?,

            rate_window_ms: parse_or("API_RATE_LIMIT_WINDOW_MS", get, 60_000u64)?,
            rate_max_general: parse_or("API_RATE_LIMIT_MAX_REQUESTS", get, 100u32)?,
            rate_max_medical: parse_or("MEDICAL_API_RATE_LIMIT_MAX", get, 20u32)?,

            session_ttl_secs: parse_or("SESSION_TTL_SECS", get, 30 * 60u64)?,

            tool_providers,
            tool_pending_cap: parse_or("TOOL_PENDING_CAP", get, 64usize)?,
            tool_max_reconnects: parse_or("TOOL_MAX_RECONNECTS", get, 3u32)?,

            phi_field_aliases: get("PHI_FIELD_ALIASES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            request_deadline_secs: parse_or("REQUEST_DEADLINE_SECS", get, 60u64)?,
        })
    }
}

/// Derive a fixed-length AES key from an arbitrary secret string.
fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

fn llm_provider(
    get: &dyn Fn(&str) -> Option<String>,
    url_var: &str,
    key_var: &str,
    model_var: &str,
) -> Option<LlmProviderConfig> {
    let base_url = get(url_var).filter(|v| !v.trim().is_empty())?;
    Some(LlmProviderConfig {
        base_url,
        api_key: get(key_var).unwrap_or_default(),
        model: get(model_var).unwrap_or_else(|| "default".to_string()),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    get: &dyn Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn parse_bool_or(
    name: &str,
    get: &dyn Fn(&str) -> Option<String>,
    default: bool,
) -> bool {
    match get(name).as_deref().map(str::trim) {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}
