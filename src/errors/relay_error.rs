use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors returned by the relay endpoints.
///
/// Every variant is rendered as a structured HTTP response; nothing is thrown
/// past the HTTP boundary.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The upstream provider secret is not configured
    #[error("{0}")]
    Configuration(String),

    /// A required request field is missing or malformed
    #[error("{0}")]
    Validation(String),

    /// The client exceeded the endpoint's rate ceiling
    #[error("Too many requests, please try again later")]
    Throttled { retry_after_secs: u64 },

    /// The upstream provider rejected the call; status and body are passed through
    #[error("Upstream returned {status}")]
    Upstream {
        status: StatusCode,
        body: String,
        content_type: Option<String>,
    },

    /// Transport or decoding failure while talking to the upstream provider
    #[error("{0}")]
    Internal(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Configuration(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::Upstream { status, .. } => *status,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            RelayError::Throttled { retry_after_secs } => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": "Too many requests, please try again later",
                        "retryAfter": retry_after_secs,
                    })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            RelayError::Upstream {
                body, content_type, ..
            } => {
                let mut response = (status, body).into_response();
                let content_type = content_type
                    .as_deref()
                    .and_then(|value| HeaderValue::from_str(value).ok())
                    .unwrap_or_else(|| HeaderValue::from_static("application/json"));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type);
                response
            }
            other => (status, Json(json!({ "error": other.to_string() }))).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::Configuration("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RelayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Throttled {
                retry_after_secs: 3
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RelayError::Upstream {
                status: StatusCode::UNAUTHORIZED,
                body: String::new(),
                content_type: None,
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_throttled_response_has_retry_after_header() {
        let response = RelayError::Throttled {
            retry_after_secs: 42,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }

    #[test]
    fn test_upstream_response_keeps_content_type() {
        let response = RelayError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            body: "bad gateway".to_string(),
            content_type: Some("text/plain".to_string()),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }
}
