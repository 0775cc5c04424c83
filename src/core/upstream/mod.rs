//! HTTP client for the hosted realtime provider.
//!
//! Two calls are relayed:
//! - `POST {base}/realtime/sessions` mints an ephemeral session credential
//!   using the long-lived provider key.
//! - `POST {base}/realtime?model=<model>` exchanges an SDP offer for an SDP
//!   answer, authorized by the ephemeral credential.
//!
//! Neither key is ever written to logs.

use std::time::Duration;

use axum::http::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{RelayError, RelayResult};

/// Default provider REST base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model used when a credential request omits one.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default voice used when a credential request omits one.
pub const DEFAULT_REALTIME_VOICE: &str = "verse";

/// Default timeout for each upstream call.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Session creation payload forwarded upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamSessionRequest<'a> {
    pub model: &'a str,
    pub voice: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<&'a str>,
}

/// Provider client shared by all relay handlers.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RelayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Mint an ephemeral session credential.
    ///
    /// Returns the upstream JSON payload unchanged.
    pub async fn create_session(
        &self,
        api_key: &str,
        request: &UpstreamSessionRequest<'_>,
    ) -> RelayResult<Value> {
        let url = format!("{}/realtime/sessions", self.base_url);
        debug!(model = request.model, voice = request.voice, "Requesting realtime session");

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!("Realtime session request failed: {}", e);
                RelayError::Internal(format!("Failed to reach realtime provider: {e}"))
            })?;

        let response = Self::ensure_success(response).await?;

        response
            .json::<Value>()
            .await
            .map_err(|e| RelayError::Internal(format!("Invalid session payload: {e}")))
    }

    /// Exchange an SDP offer for the provider's SDP answer.
    pub async fn negotiate(
        &self,
        ephemeral_key: &str,
        model: &str,
        sdp_offer: &str,
    ) -> RelayResult<String> {
        let url = format!("{}/realtime", self.base_url);
        debug!(model, offer_len = sdp_offer.len(), "Forwarding SDP offer");

        let response = self
            .http
            .post(&url)
            .query(&[("model", model)])
            .header(AUTHORIZATION, format!("Bearer {ephemeral_key}"))
            .header(CONTENT_TYPE, "application/sdp")
            .body(sdp_offer.to_string())
            .send()
            .await
            .map_err(|e| {
                warn!("SDP negotiation request failed: {}", e);
                RelayError::Internal(format!("Failed to reach realtime provider: {e}"))
            })?;

        let response = Self::ensure_success(response).await?;

        response
            .text()
            .await
            .map_err(|e| RelayError::Internal(format!("Failed to read SDP answer: {e}")))
    }

    /// Convert a non-2xx upstream response into a passthrough error.
    async fn ensure_success(response: reqwest::Response) -> RelayResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        warn!(status = status.as_u16(), "Realtime provider rejected request");

        Err(RelayError::Upstream {
            status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> UpstreamClient {
        UpstreamClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_create_session_forwards_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime/sessions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "sess_1",
                "client_secret": {"value": "ek_1", "expires_at": 1700000000}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let payload = client(&server)
            .create_session(
                "sk-test",
                &UpstreamSessionRequest {
                    model: "m",
                    voice: "verse",
                    instructions: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(payload["client_secret"]["value"], "ek_1");
    }

    #[tokio::test]
    async fn test_create_session_passes_through_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime/sessions"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_raw(r#"{"error":"bad key"}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .create_session(
                "sk-bad",
                &UpstreamSessionRequest {
                    model: "m",
                    voice: "verse",
                    instructions: None,
                },
            )
            .await
            .unwrap_err();

        match err {
            RelayError::Upstream { status, body, .. } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("bad key"));
            }
            other => panic!("Expected Upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_negotiate_returns_answer_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime"))
            .and(query_param("model", "m"))
            .and(header("authorization", "Bearer ek_1"))
            .and(header("content-type", "application/sdp"))
            .and(body_string("v=0 offer"))
            .respond_with(ResponseTemplate::new(201).set_body_string("v=0 answer"))
            .mount(&server)
            .await;

        let answer = client(&server)
            .negotiate("ek_1", "m", "v=0 offer")
            .await
            .unwrap();

        assert_eq!(answer, "v=0 answer");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            UpstreamClient::new("https://example.com/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "https://example.com/v1");
    }
}
