//! Realtime relay route configuration

use axum::{Router, middleware::from_fn_with_state, routing::post};
use tower_http::trace::TraceLayer;

use crate::handlers::realtime::{create_credential, create_session, negotiate};
use crate::middleware::{RouteLimit, rate_limit_middleware};
use crate::state::AppState;
use std::sync::Arc;

/// Create the realtime relay router
///
/// # Endpoints
///
/// - `POST /realtime/session` - ephemeral credential, limited by `session_limiter`
/// - `POST /realtime/sessions` - upstream session, limited by `sessions_limiter`
/// - `POST /realtime/ws` - SDP exchange, limited by `negotiate_limiter`
///
/// Each route carries its own limiter so counters are never shared between
/// endpoints. Clients are keyed by socket peer IP unless the config trusts
/// forwarding headers.
pub fn create_realtime_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let trust_forwarded = state.config.trust_forwarded_headers;

    Router::new()
        .route(
            "/realtime/session",
            post(create_credential).layer(from_fn_with_state(
                RouteLimit::new(state.session_limiter.clone(), trust_forwarded),
                rate_limit_middleware,
            )),
        )
        .route(
            "/realtime/sessions",
            post(create_session).layer(from_fn_with_state(
                RouteLimit::new(state.sessions_limiter.clone(), trust_forwarded),
                rate_limit_middleware,
            )),
        )
        .route(
            "/realtime/ws",
            post(negotiate).layer(from_fn_with_state(
                RouteLimit::new(state.negotiate_limiter.clone(), trust_forwarded),
                rate_limit_middleware,
            )),
        )
        .layer(TraceLayer::new_for_http())
}

/// Full application router without the outer CORS, security header and
/// burst layers that `main` adds.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    crate::routes::api::create_api_router()
        .merge(create_realtime_router(&state))
        .with_state(state)
}
