use axum::{Router, routing::get};

use crate::handlers::api::health_check;
use crate::state::AppState;
use std::sync::Arc;

/// Public routes: no rate limiting.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(health_check))
}
