use axum::response::Json;
use serde_json::{Value, json};

/// Liveness probe. Public and not rate-limited.
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}
