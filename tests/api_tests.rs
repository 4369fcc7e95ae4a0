mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast;
use tower::ServiceExt;

use copybot::api::router::create_router;
use copybot::config::AppConfig;
use copybot::engine::{EngineState, RelayEngine, RelayEvent, RelayRegistry};
use copybot::execution::CopyMode;
use copybot::ingestion::ConnectorMode;
use copybot::models::FollowerLink;
use copybot::AppState;

use common::{credential, fast_config, wait_for_state, MockExchange, MockWsServer};

const LEADER: &str = "leader";

fn test_config(api_token: Option<&str>) -> AppConfig {
    AppConfig {
        database_url: "postgres://unused".into(),
        host: "127.0.0.1".into(),
        port: 0,
        exchange_rest_url: "http://127.0.0.1:1".into(),
        exchange_ws_url: "ws://127.0.0.1:1".into(),
        connector_mode: ConnectorMode::Stream,
        poll_interval_ms: 2_000,
        auth_timeout_secs: 2,
        heartbeat_interval_secs: 30,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        max_order_retries: 1,
        order_retry_delay_ms: 5,
        order_timeout_secs: 2,
        max_concurrent_orders: 4,
        dedup_capacity: 100,
        dry_run: false,
        leader_ids: vec![LEADER.into()],
        api_token: api_token.map(str::to_string),
    }
}

async fn build_test_app(ws_url: &str, api_token: Option<&str>) -> (axum::Router, Arc<RelayRegistry>) {
    let (events, _) = broadcast::channel::<RelayEvent>(64);
    let registry = Arc::new(RelayRegistry::new());

    let engine = RelayEngine::builder(LEADER, fast_config(ws_url), MockExchange::new())
        .events(events.clone())
        .build();
    engine
        .set_links(vec![FollowerLink::new(
            credential("follower-a"),
            LEADER,
            CopyMode::FixedLot(Decimal::ONE),
        )])
        .await
        .unwrap();
    registry.register(Arc::new(engine), credential(LEADER)).await;

    let state = AppState {
        registry: Arc::clone(&registry),
        config: test_config(api_token),
        events,
        metrics_handle: copybot::metrics::test_handle(),
        db: None,
    };
    (create_router(state), registry)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", None).await;

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["relays"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", Some("secret")).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_list_relays() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", None).await;

    let response = app.oneshot(get("/api/relays")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    let relays = json["data"].as_array().unwrap();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0]["leader_id"], LEADER);
    assert_eq!(relays[0]["state"]["state"], "idle");
    assert_eq!(relays[0]["followers"], 1);
}

#[tokio::test]
async fn test_unknown_relay_is_404() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", None).await;

    let response = app.oneshot(get("/api/relays/nobody/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_stats_start_empty() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", None).await;

    let response = app
        .oneshot(get(&format!("/api/relays/{LEADER}/stats")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["total_signals"], 0);
    assert_eq!(json["data"]["success_rate"], 0.0);
    assert!(json["data"].get("persisted").is_none());
}

#[tokio::test]
async fn test_start_and_stop_relay() {
    let server = MockWsServer::start().await;
    let (app, registry) = build_test_app(&server.url, None).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/api/relays/{LEADER}/start")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let engine = registry.get(LEADER).await.unwrap();
    wait_for_state(&engine, EngineState::Monitoring).await;

    // Already running
    let response = app
        .clone()
        .oneshot(post(&format!("/api/relays/{LEADER}/start")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/relays/{LEADER}/status")))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["state"]["state"], "monitoring");
    assert_eq!(json["data"]["authenticated"], true);

    let response = app
        .oneshot(post(&format!("/api/relays/{LEADER}/stop")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
async fn test_clear_signals() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", None).await;

    let response = app
        .oneshot(post(&format!("/api/relays/{LEADER}/clear-signals")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["cleared"], 0);
}

#[tokio::test]
async fn test_auth_required_when_token_set() {
    let (app, _) = build_test_app("ws://127.0.0.1:1", Some("secret")).await;

    let response = app.clone().oneshot(get("/api/relays")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong = Request::builder()
        .uri("/api/relays")
        .header("authorization", "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(wrong).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/api/relays")
        .header("authorization", "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(right).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
