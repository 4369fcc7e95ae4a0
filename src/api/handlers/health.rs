use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let relays = state.registry.len().await;

    let Some(db) = &state.db else {
        return (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "relays": relays, "db": "disabled" })),
        );
    };

    if sqlx::query("SELECT 1").execute(db).await.is_ok() {
        (
            StatusCode::OK,
            Json(json!({ "status": "healthy", "relays": relays })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "db": "disconnected" })),
        )
    }
}
