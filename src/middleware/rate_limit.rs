//! Per-endpoint fixed-window rate limiting middleware
//!
//! Each protected route is wrapped with its own [`RateLimiter`]:
//!
//! ```ignore
//! use axum::{Router, routing::post};
//! use realtime_relay::middleware::{RouteLimit, rate_limit_middleware};
//!
//! let app = Router::new()
//!     .route("/realtime/sessions", post(create_session)
//!         .layer(axum::middleware::from_fn_with_state(
//!             RouteLimit::new(state.sessions_limiter.clone(), false),
//!             rate_limit_middleware,
//!         )));
//! ```
//!
//! The server must be started with
//! `into_make_service_with_connect_info::<SocketAddr>()` so the peer address
//! is available.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::rate_limit::{RateLimitDecision, RateLimiter};
use crate::errors::RelayError;

/// Key used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Middleware state for one protected route.
#[derive(Debug, Clone)]
pub struct RouteLimit {
    pub limiter: Arc<RateLimiter>,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when identifying the client
    pub trust_forwarded: bool,
}

impl RouteLimit {
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded: bool) -> Self {
        Self {
            limiter,
            trust_forwarded,
        }
    }
}

/// Derive the client key for rate limiting.
///
/// The socket peer IP is used unless `trust_forwarded` is set, in which case
/// the first `X-Forwarded-For` hop, then `X-Real-IP`, take precedence.
pub fn client_key(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> String {
    if trust_forwarded && let Some(ip) = forwarded_client(headers) {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_client(headers: &HeaderMap) -> Option<&str> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

/// Middleware that consults the route's limiter before the handler runs.
///
/// Over-ceiling requests are rejected with 429, a `Retry-After` header and
/// `{"error", "retryAfter"}`; they are never queued.
pub async fn rate_limit_middleware(
    State(route): State<RouteLimit>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), peer, route.trust_forwarded);

    match route.limiter.check(&key) {
        RateLimitDecision::Allow => next.run(request).await,
        RateLimitDecision::Throttle { retry_after_secs } => {
            tracing::warn!(
                limiter = route.limiter.name(),
                client_key = %key,
                retry_after_secs,
                "Rejecting request: rate limit exceeded"
            );
            RelayError::Throttled { retry_after_secs }.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rate_limit::RateLimitPolicy;
    use axum::{Router, http::StatusCode, routing::post};
    use std::time::Duration;
    use tower::ServiceExt;

    fn spoofed_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        headers
    }

    #[test]
    fn test_client_key_uses_peer_by_default() {
        let peer: SocketAddr = "192.0.2.10:443".parse().unwrap();
        assert_eq!(client_key(&spoofed_headers(), Some(peer), false), "192.0.2.10");
        assert_eq!(client_key(&spoofed_headers(), None, false), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_client_key_trusted_proxy_order() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_key(&spoofed_headers(), Some(peer), true), "203.0.113.7");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(client_key(&headers, Some(peer), true), "198.51.100.2");

        assert_eq!(client_key(&HeaderMap::new(), Some(peer), true), "127.0.0.1");
        assert_eq!(client_key(&HeaderMap::new(), None, true), UNKNOWN_CLIENT);
    }

    fn limited_app(max_requests: u32, trust_forwarded: bool) -> Router {
        let limiter = Arc::new(RateLimiter::new(
            "test",
            RateLimitPolicy::new(max_requests, Duration::from_secs(300)),
        ));
        Router::new().route(
            "/limited",
            post(|| async { "ok" }).layer(axum::middleware::from_fn_with_state(
                RouteLimit::new(limiter, trust_forwarded),
                rate_limit_middleware,
            )),
        )
    }

    fn request_from(peer: &str, forwarded_for: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/limited");
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    #[tokio::test]
    async fn test_middleware_rejects_over_ceiling() {
        let app = limited_app(2, false);

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("10.1.1.1", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from("10.1.1.1", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));

        // A different client is unaffected
        let response = app.oneshot(request_from("10.1.1.2", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_is_still_throttled() {
        let app = limited_app(3, false);

        let mut allowed = 0;
        for i in 0..20 {
            let spoofed = format!("1.2.3.{i}");
            let response = app
                .clone()
                .oneshot(request_from("198.51.100.9", Some(&spoofed)))
                .await
                .unwrap();
            if response.status() == StatusCode::OK {
                allowed += 1;
            } else {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
        }

        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn test_trusted_proxy_keys_on_forwarded_client() {
        let app = limited_app(1, true);

        // Same proxy peer, two distinct forwarded clients
        let response = app
            .clone()
            .oneshot(request_from("10.0.0.254", Some("203.0.113.1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(request_from("10.0.0.254", Some("203.0.113.2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request_from("10.0.0.254", Some("203.0.113.1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
