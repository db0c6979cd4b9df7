//! Queue inspection and operator recovery endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use axion_common::error::AppError;
use axion_common::types::{DeadLetterEntry, QueueStats};

use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;
const DEFAULT_STALE_SECS: u64 = 300;
const STALE_REQUEUE_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/queue/stats", get(stats))
        .route("/api/queue/jobs/{id}", get(job_location))
        .route("/api/queue/dead-letter", get(list_dead_letters))
        .route("/api/queue/dead-letter/{id}/requeue", post(requeue_dead_letter))
        .route("/api/queue/processing/requeue-stale", post(requeue_stale))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct StaleQuery {
    older_than_secs: Option<u64>,
}

async fn stats(State(state): State<AppState>) -> Result<Json<QueueStats>, AppError> {
    Ok(Json(state.queue.stats().await?))
}

async fn job_location(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let location = state
        .queue
        .location(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} is not queued", id)))?;

    Ok(Json(json!({ "notification_id": id, "location": location })))
}

async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeadLetterEntry>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    Ok(Json(state.queue.dead_letters(limit).await?))
}

async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.queue.requeue_dead_letter(id).await? {
        return Err(AppError::NotFound(format!(
            "Notification {} is not dead-lettered",
            id
        )));
    }

    tracing::info!(notification_id = id, "Dead-lettered job requeued by operator");
    Ok(Json(json!({ "notification_id": id, "requeued": true })))
}

async fn requeue_stale(
    State(state): State<AppState>,
    Query(query): Query<StaleQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let older_than_secs = query.older_than_secs.unwrap_or(DEFAULT_STALE_SECS);
    let cutoff = i64::try_from(older_than_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .ok_or_else(|| AppError::Validation("older_than_secs is out of range".to_string()))?;

    let requeued = state.queue.requeue_stale(cutoff, STALE_REQUEUE_LIMIT).await?;
    if requeued > 0 {
        tracing::warn!(requeued, older_than_secs, "Stale processing jobs requeued by operator");
    }

    Ok(Json(json!({ "requeued": requeued, "older_than_secs": older_than_secs })))
}
