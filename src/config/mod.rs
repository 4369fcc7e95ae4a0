use std::env;
use std::time::Duration;

use anyhow::Context;

use crate::engine::RelayConfig;
use crate::exchange::rest_client::DEFAULT_REST_BASE;
use crate::execution::{DispatcherConfig, RetryPolicy};
use crate::ingestion::connector::DEFAULT_WS_URL;
use crate::ingestion::{ConnectorConfig, ConnectorMode};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Exchange
    pub exchange_rest_url: String,
    pub exchange_ws_url: String,

    // Connector
    pub connector_mode: ConnectorMode,
    pub poll_interval_ms: u64,
    pub auth_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,

    // Execution
    pub max_order_retries: u32,
    pub order_retry_delay_ms: u64,
    pub order_timeout_secs: u64,
    pub max_concurrent_orders: usize,
    pub dedup_capacity: usize,
    pub dry_run: bool,

    /// Leaders to run; empty means every leader with a link in the database.
    pub leader_ids: Vec<String>,
    /// Bearer token for `/api/*`; unset disables auth.
    pub api_token: Option<String>,
}

fn var_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        _ => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: var_or("PORT", 8080)?,

            exchange_rest_url: env::var("EXCHANGE_REST_URL")
                .unwrap_or_else(|_| DEFAULT_REST_BASE.into()),
            exchange_ws_url: env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.into()),

            connector_mode: ConnectorMode::from_str(
                &env::var("CONNECTOR_MODE").unwrap_or_else(|_| "stream".into()),
            ),
            poll_interval_ms: var_or("POLL_INTERVAL_MS", 2_000)?,
            auth_timeout_secs: var_or("AUTH_TIMEOUT_SECS", 10)?,
            heartbeat_interval_secs: var_or("HEARTBEAT_INTERVAL_SECS", 30)?,
            max_reconnect_attempts: var_or("MAX_RECONNECT_ATTEMPTS", 5)?,
            reconnect_base_delay_ms: var_or("RECONNECT_BASE_DELAY_MS", 1_000)?,
            reconnect_max_delay_ms: var_or("RECONNECT_MAX_DELAY_MS", 30_000)?,

            max_order_retries: var_or("MAX_ORDER_RETRIES", 3)?,
            order_retry_delay_ms: var_or("ORDER_RETRY_DELAY_MS", 1_000)?,
            order_timeout_secs: var_or("ORDER_TIMEOUT_SECS", 15)?,
            max_concurrent_orders: var_or("MAX_CONCURRENT_ORDERS", 8)?,
            dedup_capacity: var_or("DEDUP_CAPACITY", 10_000)?,
            dry_run: var_or("DRY_RUN", false)?,

            leader_ids: split_list(&env::var("LEADER_IDS").unwrap_or_default()),
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    /// Engine configuration derived from the environment.
    pub fn relay_config(&self) -> RelayConfig {
        let connector = ConnectorConfig {
            mode: self.connector_mode,
            ws_url: self.exchange_ws_url.clone(),
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(100)),
            ..ConnectorConfig::default()
        };
        let dispatcher = DispatcherConfig {
            retry: RetryPolicy {
                max_retries: self.max_order_retries,
                retry_delay: Duration::from_millis(self.order_retry_delay_ms),
            },
            order_timeout: self.order_timeout(),
            max_concurrent_orders: self.max_concurrent_orders.max(1),
            dry_run: self.dry_run,
            ..DispatcherConfig::default()
        };
        RelayConfig {
            connector,
            dispatcher,
            dedup_capacity: self.dedup_capacity.max(1),
            ..RelayConfig::default()
        }
    }
}
