//! Credential and signaling relay.
//!
//! Validates relay requests, applies configured defaults and forwards them to
//! the upstream provider. Rate limiting happens before a request reaches this
//! layer, in `middleware::rate_limit`.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::core::upstream::{UpstreamClient, UpstreamSessionRequest};
use crate::errors::{RelayError, RelayResult};

/// Body of `POST /realtime/session`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialRequest {
    pub model: Option<String>,
    pub voice: Option<String>,
}

/// Body of `POST /realtime/sessions`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
}

/// Body of `POST /realtime/ws`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiateRequest {
    pub ephemeral_key: Option<String>,
    pub model: Option<String>,
    pub sdp: Option<String>,
}

/// Treat empty strings as missing.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

pub struct Relay {
    upstream: UpstreamClient,
    api_key: Option<String>,
    default_model: String,
    default_voice: String,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("upstream", &self.upstream.base_url())
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("default_model", &self.default_model)
            .field("default_voice", &self.default_voice)
            .finish()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.api_key {
            key.zeroize();
        }
    }
}

impl Relay {
    pub fn from_config(config: &ServerConfig) -> RelayResult<Self> {
        let upstream = UpstreamClient::new(&config.openai_base_url, config.upstream_timeout())?;
        Ok(Self {
            upstream,
            api_key: config.api_key().map(str::to_string),
            default_model: config.default_model.clone(),
            default_voice: config.default_voice.clone(),
        })
    }

    fn api_key(&self) -> RelayResult<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            RelayError::Configuration("OpenAI API key not configured in server environment".into())
        })
    }

    /// Issue an ephemeral credential, falling back to the configured model and voice.
    pub async fn issue_credential(&self, request: &CredentialRequest) -> RelayResult<Value> {
        let api_key = self.api_key()?;
        let model = present(&request.model).unwrap_or(self.default_model.as_str());
        let voice = present(&request.voice).unwrap_or(self.default_voice.as_str());

        let payload = self
            .upstream
            .create_session(
                api_key,
                &UpstreamSessionRequest {
                    model,
                    voice,
                    instructions: None,
                },
            )
            .await?;

        info!(model, voice, "Issued ephemeral realtime credential");
        Ok(payload)
    }

    /// Create an upstream session. `model` is required.
    pub async fn create_session(&self, request: &SessionRequest) -> RelayResult<Value> {
        let model = present(&request.model)
            .ok_or_else(|| RelayError::Validation("Model is required".into()))?;
        let api_key = self.api_key()?;
        let voice = present(&request.voice).unwrap_or(self.default_voice.as_str());

        let payload = self
            .upstream
            .create_session(
                api_key,
                &UpstreamSessionRequest {
                    model,
                    voice,
                    instructions: present(&request.instructions),
                },
            )
            .await?;

        info!(model, voice, "Created realtime session");
        Ok(payload)
    }

    /// Forward an SDP offer with the ephemeral credential and return the answer.
    pub async fn negotiate(&self, request: &NegotiateRequest) -> RelayResult<String> {
        let (Some(ephemeral_key), Some(model), Some(sdp)) = (
            present(&request.ephemeral_key),
            present(&request.model),
            present(&request.sdp),
        ) else {
            return Err(RelayError::Validation("Missing required parameters".into()));
        };

        let answer = self.upstream.negotiate(ephemeral_key, model, sdp).await?;
        debug!(model, answer_len = answer.len(), "SDP negotiation complete");
        Ok(answer)
    }
}
