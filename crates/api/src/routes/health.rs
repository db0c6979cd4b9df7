//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Always 200; `status` turns `degraded` when the queue store is unreachable.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (status, queue) = match state.queue.ping().await {
        Ok(()) => ("ok", "up".to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            ("degraded", e.to_string())
        }
    };

    Json(json!({
        "status": status,
        "service": "axionsync-notification-api",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": queue,
        "queue_prefix": state.config.queue_key_prefix
    }))
}
