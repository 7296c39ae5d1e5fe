//! Liveness and readiness probes.

use axum::Json;
use serde_json::{json, Value};

pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// Always ready for now; store connectivity is verified at startup.
pub async fn readiness() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}
