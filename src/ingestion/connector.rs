use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::exchange::{ExchangeApi, ExchangeError, FillRecord, OrderUpdate, PositionRecord};
use crate::models::AccountCredential;

use super::poller::PollingConnector;
use super::stream::StreamConnector;

pub const DEFAULT_WS_URL: &str = "wss://socket.india.delta.exchange";

/// How long `close()` waits for the connector task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Raw leader record, routed by channel but not yet normalized.
#[derive(Debug, Clone)]
pub enum RawMessage {
    Fill(FillRecord),
    Order(OrderUpdate),
    Position(PositionRecord),
    /// Every open position of the account. Symbols missing from it are flat.
    PositionSnapshot(Vec<PositionRecord>),
}

#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// Transport is up; authentication not yet confirmed.
    Connected,
    /// Authenticated and subscribed.
    Authenticated,
    Message(RawMessage),
    /// `auth_failure` marks a credential or handshake rejection.
    Disconnected { reason: String, auth_failure: bool },
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget spent; the connector has stopped.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("authentication timed out after {0:?}")]
    AuthTimeout(Duration),

    #[error("connection exhausted after {attempts} reconnect attempts")]
    ConnectionExhausted { attempts: u32 },
}

impl From<ExchangeError> for ConnectorError {
    fn from(err: ExchangeError) -> Self {
        if err.is_auth() {
            ConnectorError::Auth(err.to_string())
        } else {
            ConnectorError::Transport(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Live flags of one connector session. Everything resets on reconnect.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    connected: AtomicBool,
    authenticated: AtomicBool,
    subscribed: AtomicBool,
}

impl ConnectionStatus {
    pub fn reset(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.authenticated.store(false, Ordering::Relaxed);
        self.subscribed.store(false, Ordering::Relaxed);
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Relaxed);
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Relaxed);
    }

    pub fn set_subscribed(&self, value: bool) {
        self.subscribed.store(value, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorMode {
    Stream,
    Polling,
}

impl ConnectorMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "polling" | "poll" => ConnectorMode::Polling,
            _ => ConnectorMode::Stream,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub mode: ConnectorMode,
    pub ws_url: String,
    /// Symbol filter sent with every subscription.
    pub symbols: Vec<String>,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            mode: ConnectorMode::Stream,
            ws_url: DEFAULT_WS_URL.into(),
            symbols: vec!["all".into()],
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// Exponential backoff with cap: `base × 2^attempt`, at most `max`.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

/// Resolves once shutdown is requested or the controlling side is gone.
pub(crate) async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Connector contract
// ---------------------------------------------------------------------------

/// A strategy for observing one account's trading activity.
///
/// `run` owns reconnection: it only returns on shutdown (`Ok`) or once the
/// reconnect budget is spent (`ConnectionExhausted`).
#[async_trait]
pub trait LeaderConnector: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn run(
        &self,
        credential: AccountCredential,
        events: mpsc::Sender<ConnectorEvent>,
        status: Arc<ConnectionStatus>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError>;
}

pub fn build_connector(
    config: &ConnectorConfig,
    api: Arc<dyn ExchangeApi>,
) -> Arc<dyn LeaderConnector> {
    match config.mode {
        ConnectorMode::Stream => Arc::new(StreamConnector::new(config.clone())),
        ConnectorMode::Polling => Arc::new(PollingConnector::new(config.clone(), api)),
    }
}

/// A running connector for one account.
pub struct ConnectorSession {
    events: mpsc::Receiver<ConnectorEvent>,
    status: Arc<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ConnectorError>>,
}

impl ConnectorSession {
    pub fn connect(
        connector: Arc<dyn LeaderConnector>,
        credential: AccountCredential,
        buffer: usize,
    ) -> Self {
        let (tx, events) = mpsc::channel(buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status = Arc::new(ConnectionStatus::default());

        tracing::info!(
            account = %credential.id,
            connector = connector.kind(),
            "Starting connector session"
        );

        let task_status = Arc::clone(&status);
        let task = tokio::spawn(async move {
            let account = credential.id.clone();
            let result = connector.run(credential, tx, task_status, shutdown_rx).await;
            if let Err(e) = &result {
                tracing::error!(account = %account, error = %e, "Connector stopped");
            }
            result
        });

        Self {
            events,
            status,
            shutdown_tx,
            task,
        }
    }

    /// Next event; `None` once the connector task has ended.
    pub async fn next_event(&mut self) -> Option<ConnectorEvent> {
        self.events.recv().await
    }

    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    /// Stop the connector and wait for its task, aborting it after a grace period.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        match tokio::time::timeout(CLOSE_GRACE, &mut task).await {
            Ok(_) => {}
            Err(_) => {
                tracing::warn!("Connector did not stop in time, aborting");
                task.abort();
            }
        }
        self.status.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(reconnect_delay(base, max, 0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(base, max, 1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(base, max, 3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(base, max, 5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(base, max, 40), Duration::from_secs(30));
    }

    #[test]
    fn status_reset_clears_all_flags() {
        let status = ConnectionStatus::default();
        status.set_connected(true);
        status.set_authenticated(true);
        status.set_subscribed(true);
        status.reset();
        assert!(!status.is_connected());
        assert!(!status.is_authenticated());
        assert!(!status.is_subscribed());
    }

    #[test]
    fn connector_mode_parses() {
        assert_eq!(ConnectorMode::from_str("polling"), ConnectorMode::Polling);
        assert_eq!(ConnectorMode::from_str("stream"), ConnectorMode::Stream);
        assert_eq!(ConnectorMode::from_str("anything"), ConnectorMode::Stream);
    }

    #[tokio::test]
    async fn shutdown_signal_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown_signal(&mut rx))
            .await
            .expect("should resolve");
    }
}
