use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::engine::events::Reporter;
use crate::engine::state::SharedState;
use crate::exchange::ExchangeApi;
use crate::ingestion::connector::shutdown_signal;
use crate::models::{ExecutionKind, ExecutionRecord, FollowerLink, TradeSignal};

use super::order_executor::{ExecutionError, OrderExecutor, RetryPolicy};
use super::risk_manager::{compute_close_order, compute_follower_order, FollowerExposure};

/// How long `shutdown()` lets a worker finish its in-flight entry.
const WORKER_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the execution dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    pub order_timeout: Duration,
    pub max_concurrent_orders: usize,
    /// Bound of each follower's FIFO queue.
    pub queue_capacity: usize,
    /// Asset whose balance sizes `percentage_balance` links.
    pub settlement_asset: String,
    pub dry_run: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            order_timeout: Duration::from_secs(15),
            max_concurrent_orders: 8,
            queue_capacity: 256,
            settlement_asset: "USD".into(),
            dry_run: false,
        }
    }
}

/// Leader position went flat (or flipped); followers should flatten too.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub close_id: String,
    pub symbol: String,
    pub previous_size: Decimal,
}

#[derive(Debug, Clone)]
pub enum ExecutionJob {
    Mirror(TradeSignal),
    Close(CloseRequest),
}

impl ExecutionJob {
    pub fn id(&self) -> &str {
        match self {
            ExecutionJob::Mirror(s) => &s.signal_id,
            ExecutionJob::Close(c) => &c.close_id,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            ExecutionJob::Mirror(s) => &s.symbol,
            ExecutionJob::Close(c) => &c.symbol,
        }
    }

    pub fn kind(&self) -> ExecutionKind {
        match self {
            ExecutionJob::Mirror(_) => ExecutionKind::Mirror,
            ExecutionJob::Close(_) => ExecutionKind::Close,
        }
    }
}

/// One pending job in a follower's queue.
#[derive(Debug, Clone)]
pub struct ExecutionQueueEntry {
    pub job: ExecutionJob,
    pub link: FollowerLink,
    pub retries: u32,
}

struct FollowerWorker {
    tx: mpsc::Sender<ExecutionQueueEntry>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared by every worker of one dispatcher.
struct WorkerContext {
    leader_id: String,
    executor: OrderExecutor,
    api: Arc<dyn ExchangeApi>,
    state: SharedState,
    reporter: Reporter,
    settlement_asset: String,
    queue_depth: AtomicUsize,
}

/// Fans leader signals out to per-follower FIFO workers.
///
/// Each follower has one bounded queue drained by one task, so a follower's
/// orders are placed in arrival order and never concurrently. Followers run
/// in parallel, bounded by the executor's permit pool.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    workers: Mutex<HashMap<String, FollowerWorker>>,
    queue_capacity: usize,
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        api: Arc<dyn ExchangeApi>,
        state: SharedState,
        reporter: Reporter,
    ) -> Self {
        let executor = OrderExecutor::new(
            Arc::clone(&api),
            config.retry,
            config.order_timeout,
            config.max_concurrent_orders,
            config.dry_run,
        );
        Self {
            ctx: Arc::new(WorkerContext {
                leader_id: reporter.leader_id().to_string(),
                executor,
                api,
                state,
                reporter,
                settlement_asset: config.settlement_asset.clone(),
                queue_depth: AtomicUsize::new(0),
            }),
            workers: Mutex::new(HashMap::new()),
            queue_capacity: config.queue_capacity.max(1),
        }
    }

    /// Entries queued or in flight across all followers.
    pub fn queue_depth(&self) -> usize {
        self.ctx.queue_depth.load(Ordering::Relaxed)
    }

    /// Queue a mirror of `signal` for every enabled link of its leader.
    /// Returns how many followers it was queued for.
    pub async fn dispatch(&self, signal: &TradeSignal, links: &[FollowerLink]) -> usize {
        let targets = self
            .claim(&signal.signal_id, links, |l| {
                l.enabled && l.leader_id == signal.account_id
            })
            .await;

        for link in &targets {
            self.enqueue(ExecutionQueueEntry {
                job: ExecutionJob::Mirror(signal.clone()),
                link: link.clone(),
                retries: 0,
            })
            .await;
        }
        targets.len()
    }

    /// Queue a close for every enabled link that copies position closes.
    pub async fn dispatch_close(&self, request: &CloseRequest, links: &[FollowerLink]) -> usize {
        let leader_id = self.ctx.leader_id.clone();
        let targets = self
            .claim(&request.close_id, links, |l| {
                l.enabled && l.copy_position_close && l.leader_id == leader_id
            })
            .await;

        for link in &targets {
            self.enqueue(ExecutionQueueEntry {
                job: ExecutionJob::Close(request.clone()),
                link: link.clone(),
                retries: 0,
            })
            .await;
        }
        targets.len()
    }

    /// Stop a follower's worker. Its in-flight entry completes; queued ones
    /// are discarded.
    pub async fn remove_follower(&self, follower_id: &str) {
        if let Some(worker) = self.workers.lock().await.remove(follower_id) {
            let _ = worker.cancel.send(true);
            tracing::info!(follower = %follower_id, "Follower worker removed");
        }
    }

    /// Stop every worker, discarding pending entries.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, FollowerWorker)> = self.workers.lock().await.drain().collect();
        for (_, worker) in &workers {
            let _ = worker.cancel.send(true);
        }
        for (follower_id, worker) in workers {
            drop(worker.tx);
            let mut handle = worker.handle;
            if tokio::time::timeout(WORKER_GRACE, &mut handle).await.is_err() {
                tracing::warn!(follower = %follower_id, "Worker did not stop in time, aborting");
                handle.abort();
            }
        }
        self.ctx.publish_depth();
    }

    /// Filter `links` and mark each remaining (job, follower) pair as
    /// dispatched. Pairs seen before are dropped.
    async fn claim(
        &self,
        job_id: &str,
        links: &[FollowerLink],
        eligible: impl Fn(&FollowerLink) -> bool,
    ) -> Vec<FollowerLink> {
        let mut state = self.ctx.state.lock().await;
        links
            .iter()
            .filter(|l| eligible(l))
            .filter(|l| {
                let fresh = state.mark_dispatched(job_id, l.follower_id());
                if !fresh {
                    tracing::debug!(job_id, follower = %l.follower_id(), "Already dispatched, ignoring");
                }
                fresh
            })
            .cloned()
            .collect()
    }

    async fn enqueue(&self, entry: ExecutionQueueEntry) {
        let follower_id = entry.link.follower_id().to_string();
        let tx = {
            let mut workers = self.workers.lock().await;
            let stale = workers
                .get(&follower_id)
                .is_some_and(|w| w.handle.is_finished());
            if stale {
                workers.remove(&follower_id);
            }
            workers
                .entry(follower_id.clone())
                .or_insert_with(|| self.spawn_worker(&follower_id))
                .tx
                .clone()
        };

        self.ctx.queue_depth.fetch_add(1, Ordering::Relaxed);
        self.ctx.publish_depth();
        if let Err(e) = tx.send(entry).await {
            self.ctx.finish_entry();
            tracing::warn!(
                follower = %follower_id,
                job_id = %e.0.job.id(),
                "Follower worker gone, entry dropped"
            );
        }
    }

    fn spawn_worker(&self, follower_id: &str) -> FollowerWorker {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (cancel, cancel_rx) = watch::channel(false);
        let ctx = Arc::clone(&self.ctx);
        let id = follower_id.to_string();
        tracing::debug!(follower = %id, "Spawning follower worker");
        let handle = tokio::spawn(async move { ctx.run_worker(id, rx, cancel_rx).await });
        FollowerWorker { tx, cancel, handle }
    }
}

impl WorkerContext {
    fn publish_depth(&self) {
        gauge!("execution_queue_depth", "leader" => self.leader_id.clone())
            .set(self.queue_depth.load(Ordering::Relaxed) as f64);
    }

    fn finish_entry(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
        self.publish_depth();
    }

    async fn run_worker(
        &self,
        follower_id: String,
        mut rx: mpsc::Receiver<ExecutionQueueEntry>,
        mut cancel: watch::Receiver<bool>,
    ) {
        loop {
            let entry = tokio::select! {
                biased;
                _ = shutdown_signal(&mut cancel) => break,
                entry = rx.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            let record = self.process(entry).await;
            self.reporter.report(record).await;
            self.finish_entry();
        }

        rx.close();
        let mut discarded = 0usize;
        while rx.try_recv().is_ok() {
            discarded += 1;
            self.finish_entry();
        }
        if discarded > 0 {
            tracing::warn!(follower = %follower_id, discarded, "Pending entries discarded");
        }
        tracing::debug!(follower = %follower_id, "Follower worker stopped");
    }

    async fn process(&self, mut entry: ExecutionQueueEntry) -> ExecutionRecord {
        match entry.job.clone() {
            ExecutionJob::Mirror(signal) => self.mirror(&signal, &entry.link, &mut entry.retries).await,
            ExecutionJob::Close(request) => self.close(&request, &entry.link, &mut entry.retries).await,
        }
    }

    async fn mirror(&self, signal: &TradeSignal, link: &FollowerLink, retries: &mut u32) -> ExecutionRecord {
        let follower_id = link.follower_id();

        let available_balance = if link.copy_mode.needs_balance() {
            match self
                .api
                .fetch_available_balance(&link.follower, &self.settlement_asset)
                .await
            {
                Ok(balance) => Some(balance),
                Err(e) => {
                    tracing::warn!(follower = %follower_id, error = %e, "Balance lookup failed");
                    return ExecutionRecord::failed_before_order(
                        &signal.signal_id,
                        &self.leader_id,
                        follower_id,
                        ExecutionKind::Mirror,
                        &signal.symbol,
                        format!("balance lookup failed: {e}"),
                    );
                }
            }
        } else {
            None
        };

        let decision = {
            let mut state = self.state.lock().await;
            let exposure = FollowerExposure {
                held: state.tracker.size_of(follower_id, &signal.symbol),
                open_positions: state.tracker.open_count(follower_id),
                available_balance,
            };
            let daily = state.daily_risk_mut(follower_id).clone();
            compute_follower_order(signal, link, &exposure, &daily)
        };

        let order = match decision {
            Ok(order) => order,
            Err(rejection) => {
                tracing::info!(
                    follower = %follower_id,
                    signal = %signal,
                    reason = %rejection,
                    "Mirror skipped"
                );
                return ExecutionRecord::skipped(
                    &signal.signal_id,
                    &self.leader_id,
                    follower_id,
                    ExecutionKind::Mirror,
                    &signal.symbol,
                    rejection.code(),
                );
            }
        };

        match self.executor.execute(&link.follower, &order, retries).await {
            Ok(placed) => {
                let fill_price = placed.average_fill_price.unwrap_or(signal.price);
                {
                    let mut state = self.state.lock().await;
                    let pnl = state
                        .tracker
                        .apply_fill(follower_id, &order.symbol, order.side, order.size, fill_price);
                    let daily = state.daily_risk_mut(follower_id);
                    daily.record_pnl(pnl);
                    if !order.reduce_only {
                        daily.record_trade();
                    }
                }
                tracing::info!(follower = %follower_id, order = %order, signal_id = %signal.signal_id, "Order mirrored");
                ExecutionRecord::success(
                    &signal.signal_id,
                    &self.leader_id,
                    ExecutionKind::Mirror,
                    &order,
                    *retries + 1,
                    placed.order_id,
                )
            }
            Err(ExecutionError::RetriesExhausted { attempts, last_error }) => ExecutionRecord::failed(
                &signal.signal_id,
                &self.leader_id,
                ExecutionKind::Mirror,
                &order,
                attempts,
                last_error,
            ),
        }
    }

    async fn close(&self, request: &CloseRequest, link: &FollowerLink, retries: &mut u32) -> ExecutionRecord {
        let follower_id = link.follower_id();

        // Size from the follower's own position, fresh if possible
        let position = match self.api.fetch_positions(&link.follower).await {
            Ok(positions) => {
                let current = positions.into_iter().find(|p| p.symbol == request.symbol);
                let size = current.as_ref().map(|p| p.size).unwrap_or(Decimal::ZERO);
                let entry = current.map(|p| p.entry_price);
                let mut state = self.state.lock().await;
                state.tracker.observe(follower_id, &request.symbol, size, entry);
                size
            }
            Err(e) => {
                tracing::warn!(
                    follower = %follower_id,
                    symbol = %request.symbol,
                    error = %e,
                    "Position fetch failed, using tracked snapshot"
                );
                self.state.lock().await.tracker.size_of(follower_id, &request.symbol)
            }
        };

        let Some(order) = compute_close_order(&request.close_id, &request.symbol, link, position) else {
            tracing::info!(follower = %follower_id, symbol = %request.symbol, "No follower position to close");
            return ExecutionRecord::skipped(
                &request.close_id,
                &self.leader_id,
                follower_id,
                ExecutionKind::Close,
                &request.symbol,
                "no_open_position",
            );
        };

        match self.executor.execute(&link.follower, &order, retries).await {
            Ok(placed) => {
                {
                    let mut state = self.state.lock().await;
                    match placed.average_fill_price {
                        Some(price) => {
                            let pnl = state
                                .tracker
                                .apply_fill(follower_id, &order.symbol, order.side, order.size, price);
                            state.daily_risk_mut(follower_id).record_pnl(pnl);
                        }
                        None => {
                            state.tracker.observe(follower_id, &order.symbol, Decimal::ZERO, None);
                        }
                    }
                }
                tracing::info!(follower = %follower_id, order = %order, close_id = %request.close_id, "Position close mirrored");
                ExecutionRecord::success(
                    &request.close_id,
                    &self.leader_id,
                    ExecutionKind::Close,
                    &order,
                    *retries + 1,
                    placed.order_id,
                )
            }
            Err(ExecutionError::RetriesExhausted { attempts, last_error }) => ExecutionRecord::failed(
                &request.close_id,
                &self.leader_id,
                ExecutionKind::Close,
                &order,
                attempts,
                last_error,
            ),
        }
    }
}
