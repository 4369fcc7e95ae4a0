use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::exchange::{ExchangeApi, ExchangeError, PlacedOrder};
use crate::models::{AccountCredential, FollowerOrder};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order placement failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Linear backoff: attempt `n` waits `retry_delay × n` before retrying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Places follower orders through the exchange API.
///
/// Concurrency across all followers is bounded by a shared permit pool.
/// In dry-run mode orders are logged and reported as placed.
pub struct OrderExecutor {
    api: Arc<dyn ExchangeApi>,
    retry: RetryPolicy,
    call_timeout: Duration,
    permits: Arc<Semaphore>,
    dry_run: bool,
}

impl OrderExecutor {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        retry: RetryPolicy,
        call_timeout: Duration,
        max_concurrent: usize,
        dry_run: bool,
    ) -> Self {
        Self {
            api,
            retry,
            call_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            dry_run,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Place `order`, retrying on failure. `retries` is the entry's retry
    /// counter and is advanced in place.
    pub async fn execute(
        &self,
        account: &AccountCredential,
        order: &FollowerOrder,
        retries: &mut u32,
    ) -> Result<PlacedOrder, ExecutionError> {
        if self.dry_run {
            tracing::info!(
                follower = %account.id,
                symbol = %order.symbol,
                side = %order.side,
                size = %order.size,
                reduce_only = order.reduce_only,
                client_order_id = %order.client_order_id,
                "[DRY-RUN] Would place order"
            );
            return Ok(PlacedOrder::default());
        }

        loop {
            let attempt = *retries + 1;
            match self.place_once(account, order).await {
                Ok(placed) => {
                    tracing::info!(
                        follower = %account.id,
                        order = %order,
                        exchange_order_id = ?placed.order_id,
                        attempt,
                        "Order placed"
                    );
                    return Ok(placed);
                }
                Err(e) => {
                    if *retries >= self.retry.max_retries {
                        tracing::error!(
                            follower = %account.id,
                            order = %order,
                            attempts = attempt,
                            error = %e,
                            "Order placement failed, retries exhausted"
                        );
                        return Err(ExecutionError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    *retries += 1;
                    let delay = self.retry.retry_delay * *retries;
                    tracing::warn!(
                        follower = %account.id,
                        client_order_id = %order.client_order_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Order placement failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn place_once(
        &self,
        account: &AccountCredential,
        order: &FollowerOrder,
    ) -> Result<PlacedOrder, ExchangeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ExchangeError::Unexpected(e.to_string()))?;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.call_timeout, self.api.place_order(account, order)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.call_timeout)),
        };
        histogram!("order_placement_seconds").record(started.elapsed().as_secs_f64());
        result
    }
}
