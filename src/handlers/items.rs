//! Item control endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::models::{EVENT_REPROCESSED, ProcessingStepType};
use crate::services::ProcessingLogger;
use crate::store::{EventRepository, ItemRepository};
use crate::utils::ApiError;

/// POST /api/items/:id/reprocess
///
/// Flags the item for another LLM pass and pushes it onto the fresh queue so
/// the leader picks it up ahead of the backlog.
pub async fn reprocess(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let items = ItemRepository::new(state.db.clone());
    if !items.mark_for_reprocessing(id).await? {
        return Err(ApiError::not_found(format!("Item {} not found", id)));
    }

    let events = EventRepository::new(state.db.clone());
    events
        .record(id, EVENT_REPROCESSED, Some(&json!({"source": "admin"})))
        .await?;

    let plogger = ProcessingLogger::new(state.db.clone());
    if let Err(e) = plogger.step(ProcessingStepType::Reprocess).item(id).save().await {
        tracing::warn!("Failed to log reprocess for item {}: {}", id, e);
    }

    // Best effort: a full (or absent) queue just means the backlog scan picks
    // the item up instead.
    let enqueued = state.fresh_tx.try_send(id).is_ok();

    Ok(Json(json!({"item_id": id, "queued_fresh": enqueued})))
}
