//! Worker status and control endpoints.
//!
//! Control never reaches the workers directly: commands go through the
//! `worker_commands` rows, which the leader's workers poll and execute.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::AppState;
use crate::models::{WORKER_CLASSIFIER, WORKER_LLM, WORKER_SCHEDULER, WorkerAction};
use crate::utils::ApiError;

/// GET /api/workers/status
///
/// Merged view of the `worker_state` and `worker_stats` rows, plus the GPU
/// power state when power management is active on this process and a live
/// availability probe of the LLM provider chain.
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let states = state.worker_status.all_states().await?;

    let mut workers = serde_json::Map::new();
    for worker_state in states {
        let stats = state.worker_status.stats_blob(&worker_state.worker).await?;
        workers.insert(
            worker_state.worker.clone(),
            json!({
                "running": worker_state.running,
                "paused": worker_state.paused,
                "stopped_due_to_errors": worker_state.stopped_due_to_errors,
                "updated_at": worker_state.updated_at,
                "stats": stats,
            }),
        );
    }

    let gpu = match &state.gpu_power {
        Some(power) => Some(power.status().await),
        None => None,
    };

    let llm_providers: serde_json::Map<String, serde_json::Value> = state
        .llm
        .check_availability()
        .await
        .into_iter()
        .map(|(name, available)| (name.to_string(), json!(available)))
        .collect();

    Ok(Json(json!({
        "is_leader": state.is_leader,
        "workers": workers,
        "gpu": gpu,
        "llm_providers": llm_providers,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
}

/// POST /api/workers/:name/command
pub async fn issue_command(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if ![WORKER_SCHEDULER, WORKER_CLASSIFIER, WORKER_LLM].contains(&name.as_str()) {
        return Err(ApiError::not_found(format!("Unknown worker: {}", name)));
    }

    let action = WorkerAction::parse_action(&request.action)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown action: {}", request.action)))?;

    state.worker_status.issue_command(&name, action).await?;

    Ok(Json(json!({"worker": name, "action": action.as_str(), "queued": true})))
}
