//! Connector and channel endpoints: registry listing, config validation,
//! on-demand fetches.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;
use crate::models::ConnectorType;
use crate::services::FetchError;
use crate::utils::ApiError;

/// GET /api/connectors
pub async fn list_connectors(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.list()))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub connector_type: String,
    pub config: Value,
}

/// POST /api/channels/validate
///
/// Cheap reachability + schema check for a connector config; configuration
/// errors come back synchronously as 400s.
pub async fn validate_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ValidateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let connector_type = ConnectorType::parse_type(&request.connector_type)
        .ok_or_else(|| {
            ApiError::bad_request(format!("Unknown connector type: {}", request.connector_type))
        })?;

    let connector = state
        .registry
        .get(connector_type)
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "No connector registered for type: {}",
                request.connector_type
            ))
        })?;

    let (ok, message) = connector.validate(&request.config).await;
    Ok(Json(json!({"ok": ok, "message": message})))
}

/// POST /api/channels/:id/fetch
///
/// Synchronous on-demand fetch. Returns the inserted count or the connector
/// error.
pub async fn fetch_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.scheduler.fetch_channel(id).await {
        Ok(inserted) => Ok(Json(json!({"channel_id": id, "inserted": inserted}))),
        Err(FetchError::ChannelNotFound(_)) => {
            Err(ApiError::not_found(format!("Channel {} not found", id)))
        },
        Err(e @ FetchError::ChannelDisabled(_)) => Err(ApiError::bad_request(e.to_string())),
        Err(e @ FetchError::AlreadyFetching(_)) => Err(ApiError::bad_request(e.to_string())),
        Err(FetchError::Connector(e)) => Err(ApiError::bad_request(e.to_string())),
        Err(e) => Err(ApiError::internal(e.to_string())),
    }
}
