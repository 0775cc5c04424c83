//! Client side of the credential and signaling relay.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Value, json};
use tracing::debug;
use zeroize::Zeroize;

use super::base::{RealtimeError, RealtimeResult};

// =============================================================================
// Session Credential
// =============================================================================

/// Ephemeral credential for one connection attempt.
///
/// The token is redacted from `Debug` output and wiped on drop.
#[derive(Clone)]
pub struct SessionCredential {
    token: String,
    /// Unix timestamp (seconds) after which the token is no longer accepted
    pub expires_at: Option<u64>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

impl SessionCredential {
    pub fn new(token: impl Into<String>, expires_at: Option<u64>) -> Self {
        Self {
            token: token.into(),
            expires_at,
            model: None,
            voice: None,
        }
    }

    /// Parse the relay's credential payload.
    ///
    /// Expects `client_secret.value` and optionally `client_secret.expires_at`,
    /// `model` and `voice`.
    pub fn from_payload(payload: &Value) -> RealtimeResult<Self> {
        let secret = &payload["client_secret"];
        let token = secret["value"]
            .as_str()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                RealtimeError::Credential("Response did not contain a client secret".to_string())
            })?;

        Ok(Self {
            token: token.to_string(),
            expires_at: secret["expires_at"].as_u64(),
            model: payload["model"].as_str().map(str::to_string),
            voice: payload["voice"].as_str().map(str::to_string),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// `true` once the expiry has passed. Credentials without expiry never expire.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let now = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        now >= expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }
}

impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .finish()
    }
}

impl Drop for SessionCredential {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

// =============================================================================
// Signaling
// =============================================================================

/// Credential issuance and SDP exchange, as seen by the session client.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Obtain an ephemeral credential for `model` / `voice`.
    async fn fetch_credential(&self, model: &str, voice: &str) -> RealtimeResult<SessionCredential>;

    /// Exchange `sdp_offer` for the provider's SDP answer.
    async fn negotiate(
        &self,
        credential: &SessionCredential,
        model: &str,
        sdp_offer: &str,
    ) -> RealtimeResult<String>;
}

/// [`Signaling`] over HTTP against a running relay.
///
/// Calls `POST {relay}/realtime/session` and `POST {relay}/realtime/ws`.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> RealtimeResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RealtimeError::Credential(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Turn a non-2xx relay response into [`RealtimeError::Upstream`].
    async fn ensure_success(response: reqwest::Response) -> RealtimeResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| match &v["error"] {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("message").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .unwrap_or(body);

        Err(RealtimeError::Upstream {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Signaling for RelayClient {
    async fn fetch_credential(&self, model: &str, voice: &str) -> RealtimeResult<SessionCredential> {
        let url = format!("{}/realtime/session", self.base_url);
        debug!(model, voice, "Requesting session credential");

        let response = self
            .http
            .post(&url)
            .json(&json!({ "model": model, "voice": voice }))
            .send()
            .await
            .map_err(|e| RealtimeError::Credential(e.to_string()))?;

        let payload: Value = Self::ensure_success(response)
            .await?
            .json()
            .await
            .map_err(|e| RealtimeError::Credential(format!("Invalid credential payload: {e}")))?;

        SessionCredential::from_payload(&payload)
    }

    async fn negotiate(
        &self,
        credential: &SessionCredential,
        model: &str,
        sdp_offer: &str,
    ) -> RealtimeResult<String> {
        let url = format!("{}/realtime/ws", self.base_url);
        debug!(model, offer_len = sdp_offer.len(), "Sending SDP offer to relay");

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "ephemeralKey": credential.token(),
                "model": model,
                "sdp": sdp_offer,
            }))
            .send()
            .await
            .map_err(|e| RealtimeError::Negotiation(e.to_string()))?;

        let response = Self::ensure_success(response).await?;

        let is_sdp = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/sdp"));
        if !is_sdp {
            debug!("Relay answered without an application/sdp content type");
        }

        let answer = response
            .text()
            .await
            .map_err(|e| RealtimeError::Negotiation(format!("Failed to read SDP answer: {e}")))?;

        if answer.trim().is_empty() {
            return Err(RealtimeError::Negotiation("Empty SDP answer".to_string()));
        }
        Ok(answer)
    }
}
