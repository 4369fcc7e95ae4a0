use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::db::execution_repo;
use crate::engine::{EngineError, EngineStatus, StatsSnapshot};
use crate::errors::AppError;
use crate::AppState;

use super::ApiResponse;

#[derive(Serialize)]
pub struct RelayStatsResponse {
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    /// Persisted record counts by status, when a database is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted: Option<BTreeMap<String, i64>>,
}

/// GET /api/relays
pub async fn list(State(state): State<AppState>) -> Json<ApiResponse<Vec<EngineStatus>>> {
    Json(ApiResponse::ok(state.registry.statuses().await))
}

/// GET /api/relays/:leader_id/status
pub async fn status(
    State(state): State<AppState>,
    Path(leader_id): Path<String>,
) -> Result<Json<ApiResponse<EngineStatus>>, AppError> {
    let engine = state
        .registry
        .get(&leader_id)
        .await
        .ok_or(EngineError::UnknownRelay(leader_id))?;
    Ok(Json(ApiResponse::ok(engine.status().await)))
}

/// GET /api/relays/:leader_id/stats
pub async fn stats(
    State(state): State<AppState>,
    Path(leader_id): Path<String>,
) -> Result<Json<ApiResponse<RelayStatsResponse>>, AppError> {
    let stats = state.registry.stats(&leader_id).await?;

    let persisted = match &state.db {
        Some(db) => Some(
            execution_repo::count_by_status(db, &leader_id)
                .await?
                .into_iter()
                .collect(),
        ),
        None => None,
    };

    Ok(Json(ApiResponse::ok(RelayStatsResponse { stats, persisted })))
}

/// POST /api/relays/:leader_id/start
pub async fn start(
    State(state): State<AppState>,
    Path(leader_id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    state.registry.start(&leader_id).await?;
    tracing::info!(leader = %leader_id, "Relay started via API");
    Ok(Json(ApiResponse::ok(json!({ "leader_id": leader_id, "status": "starting" }))))
}

/// POST /api/relays/:leader_id/stop
pub async fn stop(
    State(state): State<AppState>,
    Path(leader_id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    state.registry.stop(&leader_id).await?;
    tracing::warn!(leader = %leader_id, "Relay stopped via API");
    Ok(Json(ApiResponse::ok(json!({ "leader_id": leader_id, "status": "stopped" }))))
}

/// POST /api/relays/:leader_id/clear-signals
pub async fn clear_signals(
    State(state): State<AppState>,
    Path(leader_id): Path<String>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let engine = state
        .registry
        .get(&leader_id)
        .await
        .ok_or_else(|| EngineError::UnknownRelay(leader_id.clone()))?;
    let cleared = engine.clear_processed_signals().await;
    Ok(Json(ApiResponse::ok(json!({ "leader_id": leader_id, "cleared": cleared }))))
}
