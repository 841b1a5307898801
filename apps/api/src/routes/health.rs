use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::state::AppState;

/// GET /health
/// Returns service status plus queue depth; a queue outage reports `degraded`.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let (status, queue) = match state.queue.counts().await {
        Ok(counts) => ("ok", json!(counts)),
        Err(e) => {
            warn!("Health check could not read queue counts: {e}");
            ("degraded", Value::Null)
        }
    };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME"),
        "queue": queue
    }))
}
