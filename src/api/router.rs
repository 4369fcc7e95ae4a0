use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;
use super::auth::require_auth;
use super::handlers;

pub fn create_router(state: AppState) -> Router {
    // Public routes, no authentication required
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Protected API routes, Bearer token when API_TOKEN is set
    let protected = Router::new()
        .route("/api/relays", get(handlers::relays::list))
        .route("/api/relays/:leader_id/status", get(handlers::relays::status))
        .route("/api/relays/:leader_id/stats", get(handlers::relays::stats))
        .route("/api/relays/:leader_id/start", post(handlers::relays::start))
        .route("/api/relays/:leader_id/stop", post(handlers::relays::stop))
        .route(
            "/api/relays/:leader_id/clear-signals",
            post(handlers::relays::clear_signals),
        )
        // WebSocket
        .route("/ws", get(handlers::ws::handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
