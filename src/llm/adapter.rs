//! Primary/fallback LLM calls over an OpenAI-style chat contract.
//!
//! The adapter owns one HTTP client with a connection timeout; each
//! call additionally runs under its own wall-clock deadline. The
//! preferred provider is tried first and the other takes over on any
//! error or deadline. Both failing returns the last typed error —
//! never a panic; the orchestrator decides what the user sees.

use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{AppConfig, LlmProviderConfig, ModelPreference};

use super::parse::{parse_output, ParsedResponse};
use super::{GenerationParams, LlmError, ResponseHint};

/// Which configured provider answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderRole {
    Primary,
    Fallback,
}

impl ProviderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderRole::Primary => "primary",
            ProviderRole::Fallback => "fallback",
        }
    }
}

/// A parsed reply plus its provenance.
#[derive(Debug, Clone)]
pub struct LlmOutcome {
    pub parsed: ParsedResponse,
    pub provider: ProviderRole,
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

pub struct LlmAdapter {
    http: reqwest::Client,
    primary: Option<LlmProviderConfig>,
    fallback: Option<LlmProviderConfig>,
    preference: ModelPreference,
    params: GenerationParams,
}

impl LlmAdapter {
    pub fn new(config: &AppConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            primary: config.primary_llm.clone(),
            fallback: config.fallback_llm.clone(),
            preference: config.model_preference,
            params: GenerationParams::default(),
        }
    }

    /// Providers in try-order under the configured preference.
    fn provider_order(&self) -> Vec<(ProviderRole, &LlmProviderConfig)> {
        let primary = self.primary.as_ref().map(|p| (ProviderRole::Primary, p));
        let fallback = self.fallback.as_ref().map(|p| (ProviderRole::Fallback, p));
        match self.preference {
            ModelPreference::Primary => [primary, fallback],
            ModelPreference::Fallback => [fallback, primary],
        }
        .into_iter()
        .flatten()
        .collect()
    }

    /// Text generation with a structure hint and a deadline.
    pub async fn generate(
        &self,
        system: &str,
        prompt: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError> {
        self.run(system, prompt, None, hint, deadline).await
    }

    /// Vision analysis over normalized image bytes.
    pub async fn analyze_image(
        &self,
        system: &str,
        prompt: &str,
        image_bytes: &[u8],
        image_mime: &str,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError> {
        self.run(
            system,
            prompt,
            Some((image_bytes, image_mime)),
            hint,
            deadline,
        )
        .await
    }

    async fn run(
        &self,
        system: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        hint: ResponseHint,
        deadline: Duration,
    ) -> Result<LlmOutcome, LlmError> {
        let order = self.provider_order();
        if order.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        let mut last_error = LlmError::NotConfigured;
        for (role, provider) in order {
            match self
                .call_provider(provider, system, prompt, image, deadline)
                .await
            {
                Ok(raw) => {
                    return Ok(LlmOutcome {
                        parsed: parse_output(&raw, hint),
                        provider: role,
                        model: provider.model.clone(),
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        provider = role.as_str(),
                        error = %e,
                        "LLM provider failed; trying next"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn call_provider(
        &self,
        provider: &LlmProviderConfig,
        system: &str,
        prompt: &str,
        image: Option<(&[u8], &str)>,
        deadline: Duration,
    ) -> Result<String, LlmError> {
        let user_content: Value = match image {
            None => json!(prompt),
            Some((bytes, mime)) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url",
                     "image_url": {"url": format!("data:{mime};base64,{encoded}")}},
                ])
            }
        };

        let body = json!({
            "model": provider.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content},
            ],
            "temperature": self.params.temperature,
            "top_p": self.params.top_p,
            "max_tokens": self.params.max_tokens,
        });

        let url = format!(
            "{}/v1/chat/completions",
            provider.base_url.trim_end_matches('/')
        );
        let mut request = self.http.post(&url).json(&body);
        if !provider.api_key.is_empty() {
            request = request.bearer_auth(&provider.api_key);
        }

        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| LlmError::Timeout)?
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Unavailable(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| LlmError::BadResponse(e.to_string()))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices".to_string()))
    }
}
