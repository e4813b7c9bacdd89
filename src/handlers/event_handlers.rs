//! Intake for storage-change notifications.
//!
//! The event source redelivers at-least-once and the worker is idempotent,
//! so this endpoint only filters and schedules. It never waits for the
//! transform pass to finish.

use crate::{
    errors::AppError,
    services::transform::{StorageEvent, TransformWorker},
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use tracing::warn;

/// `POST /events/object-created` — body: `{ "bucket": ..., "key": ... }`.
pub async fn object_created(
    State(state): State<AppState>,
    Json(event): Json<StorageEvent>,
) -> Result<impl IntoResponse, AppError> {
    if !TransformWorker::accepts(&event.key) {
        return Ok((StatusCode::OK, Json(json!({ "status": "skipped" }))));
    }

    let worker = state.worker.clone();
    tokio::spawn(async move {
        let key = event.key.clone();
        if let Err(err) = worker.handle_event(&event).await {
            // No internal retry: redelivery of the event is the retry path.
            warn!(%key, error = %err, "transform pass failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}
