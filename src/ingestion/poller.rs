use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::exchange::{ExchangeApi, PositionRecord};
use crate::models::AccountCredential;

use super::connector::{
    reconnect_delay, shutdown_signal, ConnectionStatus, ConnectorConfig, ConnectorError,
    ConnectorEvent, LeaderConnector, RawMessage,
};

/// What the previous poll saw.
#[derive(Debug, Default)]
struct PollCursor {
    /// Fill ids in the last page. `None` until the first successful poll,
    /// whose fills are history and are not forwarded.
    seen_fills: Option<HashSet<String>>,
}

/// Observes an account through periodic REST snapshots instead of a
/// stream. Used where the streaming endpoint is unavailable.
pub struct PollingConnector {
    config: ConnectorConfig,
    api: Arc<dyn ExchangeApi>,
}

impl PollingConnector {
    pub fn new(config: ConnectorConfig, api: Arc<dyn ExchangeApi>) -> Self {
        Self { config, api }
    }

    /// One poll: forward new fills (oldest first), then the position list.
    /// Returns `Ok(false)` when the receiver is gone.
    async fn poll_once(
        &self,
        credential: &AccountCredential,
        tx: &mpsc::Sender<ConnectorEvent>,
        cursor: &mut PollCursor,
    ) -> Result<bool, ConnectorError> {
        let fills = self.api.fetch_recent_fills(credential).await?;
        let positions = self.api.fetch_positions(credential).await?;

        let page_ids: HashSet<String> = fills.iter().filter_map(|f| f.id.clone()).collect();
        if let Some(seen) = &cursor.seen_fills {
            // Page is newest first
            for fill in fills.into_iter().rev() {
                let is_new = fill.id.as_ref().is_some_and(|id| !seen.contains(id));
                if is_new && tx.send(ConnectorEvent::Message(RawMessage::Fill(fill))).await.is_err() {
                    return Ok(false);
                }
            }
        } else {
            tracing::info!(
                account = %credential.id,
                baseline_fills = page_ids.len(),
                "Polling baseline established"
            );
        }
        cursor.seen_fills = Some(page_ids);

        // Symbols missing from the list are flat; the engine diffs it
        let snapshot = positions
            .into_iter()
            .map(|p| PositionRecord {
                action: Some("snapshot".into()),
                product_symbol: Some(p.symbol),
                symbol: None,
                size: Some(p.size),
                entry_price: Some(p.entry_price),
            })
            .collect();
        Ok(tx
            .send(ConnectorEvent::Message(RawMessage::PositionSnapshot(snapshot)))
            .await
            .is_ok())
    }
}

#[async_trait]
impl LeaderConnector for PollingConnector {
    fn kind(&self) -> &'static str {
        "polling"
    }

    async fn run(
        &self,
        credential: AccountCredential,
        tx: mpsc::Sender<ConnectorEvent>,
        status: Arc<ConnectionStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut cursor = PollCursor::default();
        let mut failures: u32 = 0;
        let mut healthy = false;

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signal(&mut shutdown) => {
                    status.reset();
                    return Ok(());
                }
            }

            let result = tokio::select! {
                res = self.poll_once(&credential, &tx, &mut cursor) => res,
                _ = shutdown_signal(&mut shutdown) => {
                    status.reset();
                    return Ok(());
                }
            };

            match result {
                Ok(false) => return Ok(()),
                Ok(true) => {
                    failures = 0;
                    if !healthy {
                        healthy = true;
                        status.set_connected(true);
                        status.set_authenticated(true);
                        status.set_subscribed(true);
                        tracing::info!(account = %credential.id, "Polling connector healthy");
                        if tx.send(ConnectorEvent::Connected).await.is_err()
                            || tx.send(ConnectorEvent::Authenticated).await.is_err()
                        {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    let auth_failure = matches!(e, ConnectorError::Auth(_));
                    if auth_failure {
                        counter!("auth_failures_total").increment(1);
                    }
                    tracing::warn!(account = %credential.id, error = %e, "Poll failed");
                    if healthy {
                        healthy = false;
                        status.reset();
                    }
                    if tx
                        .send(ConnectorEvent::Disconnected {
                            reason: e.to_string(),
                            auth_failure,
                        })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }

                    failures += 1;
                    if failures > self.config.max_reconnect_attempts {
                        let attempts = self.config.max_reconnect_attempts;
                        tracing::error!(account = %credential.id, attempts, "Poll retries exhausted");
                        let _ = tx.send(ConnectorEvent::Exhausted { attempts }).await;
                        return Err(ConnectorError::ConnectionExhausted { attempts });
                    }

                    let delay = reconnect_delay(
                        self.config.reconnect_base_delay,
                        self.config.reconnect_max_delay,
                        failures - 1,
                    );
                    counter!("connector_reconnects_total").increment(1);
                    if tx
                        .send(ConnectorEvent::Reconnecting { attempt: failures, delay })
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown_signal(&mut shutdown) => return Ok(()),
                    }
                }
            }
        }
    }
}
