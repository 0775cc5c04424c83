use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::relay::{CredentialRequest, NegotiateRequest, SessionRequest};
use crate::errors::{RelayError, RelayResult};
use crate::state::AppState;

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Decode a JSON body. An empty body decodes to the request's defaults so the
/// relay can answer with its own validation message.
fn parse_body<T>(body: &Bytes, invalid_message: &str) -> RelayResult<T>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(body).map_err(|e| {
        debug!(error = %e, "Rejecting malformed request body");
        RelayError::Validation(invalid_message.to_string())
    })
}

/// `POST /realtime/session`
pub async fn create_credential(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> RelayResult<Json<Value>> {
    let request: CredentialRequest = parse_body(&body, "Invalid request body")?;
    let payload = state.relay.issue_credential(&request).await?;
    Ok(Json(payload))
}

/// `POST /realtime/sessions`
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> RelayResult<Json<Value>> {
    let request: SessionRequest = parse_body(&body, "Model is required")?;
    let payload = state.relay.create_session(&request).await?;
    Ok(Json(payload))
}

/// `POST /realtime/ws`
pub async fn negotiate(State(state): State<Arc<AppState>>, body: Bytes) -> RelayResult<Response> {
    let request: NegotiateRequest = parse_body(&body, "Missing required parameters")?;
    let answer = state.relay.negotiate(&request).await?;
    Ok(([(header::CONTENT_TYPE, SDP_CONTENT_TYPE)], answer).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_uses_defaults() {
        let request: NegotiateRequest = parse_body(&Bytes::from_static(b"  "), "bad").unwrap();
        assert!(request.sdp.is_none());
    }

    #[test]
    fn test_malformed_body_is_validation_error() {
        let err = parse_body::<NegotiateRequest>(
            &Bytes::from_static(b"{not json"),
            "Missing required parameters",
        )
        .unwrap_err();

        assert!(matches!(err, RelayError::Validation(ref m) if m == "Missing required parameters"));
    }

    #[test]
    fn test_camel_case_fields() {
        let request: NegotiateRequest = parse_body(
            &Bytes::from_static(br#"{"ephemeralKey":"ek","model":"m","sdp":"v=0"}"#),
            "bad",
        )
        .unwrap();
        assert_eq!(request.ephemeral_key.as_deref(), Some("ek"));
    }
}
