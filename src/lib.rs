pub mod api;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod services;
pub mod tracking;

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::engine::{RelayEvent, RelayRegistry};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RelayRegistry>,
    pub config: AppConfig,
    pub events: broadcast::Sender<RelayEvent>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    /// Absent when running without persistence (tests).
    pub db: Option<sqlx::PgPool>,
}
