use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::errors::ErrorKind;
use crate::exchange::{ExchangeApi, PositionRecord};
use crate::execution::dispatcher::{CloseRequest, Dispatcher, DispatcherConfig};
use crate::ingestion::connector::{
    build_connector, shutdown_signal, ConnectionStatus, ConnectorConfig, ConnectorEvent,
    ConnectorSession, LeaderConnector, RawMessage,
};
use crate::ingestion::normalizer::DEFAULT_DEDUP_CAPACITY;
use crate::models::{
    AccountCredential, ExecutionRecord, FollowerLink, PositionEffect, PositionSnapshot, TradeSignal,
};
use crate::tracking::PositionTransition;

use super::events::{RelayEvent, RelayStats, Reporter, StatsSnapshot};
use super::lifecycle::{EngineState, Lifecycle};
use super::state::{RelayState, SharedState};
use super::EngineError;

/// How long `stop()` waits for the ingest task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub connector: ConnectorConfig,
    pub dispatcher: DispatcherConfig,
    pub dedup_capacity: usize,
    pub event_buffer: usize,
    /// Bound of the connector → engine channel.
    pub ingest_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            event_buffer: 1024,
            ingest_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub leader_id: String,
    pub state: EngineState,
    pub connected: bool,
    pub authenticated: bool,
    pub subscribed: bool,
    pub queue_depth: usize,
    pub processed_signals: usize,
    pub followers: usize,
    pub leader_positions: usize,
}

struct RunningSession {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    status: Arc<ConnectionStatus>,
}

impl RunningSession {
    async fn finish(self) {
        let _ = self.shutdown_tx.send(true);
        let mut task = self.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            tracing::warn!("Ingest task did not stop in time, aborting");
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct RelayEngineBuilder {
    leader_id: String,
    config: RelayConfig,
    api: Arc<dyn ExchangeApi>,
    connector: Option<Arc<dyn LeaderConnector>>,
    events: Option<broadcast::Sender<RelayEvent>>,
    records: Option<mpsc::Sender<ExecutionRecord>>,
}

impl RelayEngineBuilder {
    /// Use a specific connector instead of the one `config.connector.mode` selects.
    pub fn connector(mut self, connector: Arc<dyn LeaderConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Publish on a shared event bus instead of a private one.
    pub fn events(mut self, events: broadcast::Sender<RelayEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Where terminal execution records are sent for persistence.
    pub fn records(mut self, records: mpsc::Sender<ExecutionRecord>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn build(self) -> RelayEngine {
        let connector = self
            .connector
            .unwrap_or_else(|| build_connector(&self.config.connector, Arc::clone(&self.api)));
        let events = self
            .events
            .unwrap_or_else(|| broadcast::channel(self.config.event_buffer.max(1)).0);
        let reporter = Reporter::new(
            self.leader_id.clone(),
            events,
            self.records,
            Arc::new(RelayStats::default()),
        );
        let state = RelayState::new(&self.leader_id, self.config.dedup_capacity).shared();
        let dispatcher = Arc::new(Dispatcher::new(
            &self.config.dispatcher,
            Arc::clone(&self.api),
            Arc::clone(&state),
            reporter.clone(),
        ));

        RelayEngine {
            leader_id: self.leader_id,
            config: self.config,
            api: self.api,
            connector,
            state,
            dispatcher,
            reporter,
            lifecycle: Arc::new(Lifecycle::new()),
            session: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Mirrors one leader account's trades onto its linked followers.
///
/// `Idle → Connecting → Monitoring ⇄ Degraded → Stopped`, restartable from
/// `Stopped`. Leader activity is forwarded only while `Monitoring` or
/// `Degraded`.
pub struct RelayEngine {
    leader_id: String,
    config: RelayConfig,
    api: Arc<dyn ExchangeApi>,
    connector: Arc<dyn LeaderConnector>,
    state: SharedState,
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
    lifecycle: Arc<Lifecycle>,
    session: Mutex<Option<RunningSession>>,
}

impl RelayEngine {
    pub fn builder(
        leader_id: impl Into<String>,
        config: RelayConfig,
        api: Arc<dyn ExchangeApi>,
    ) -> RelayEngineBuilder {
        RelayEngineBuilder {
            leader_id: leader_id.into(),
            config,
            api,
            connector: None,
            events: None,
            records: None,
        }
    }

    pub fn leader_id(&self) -> &str {
        &self.leader_id
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.current()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.lifecycle.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.reporter.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.reporter.stats().snapshot()
    }

    pub async fn status(&self) -> EngineStatus {
        let (connected, authenticated, subscribed) = match self.session.lock().await.as_ref() {
            Some(s) => (
                s.status.is_connected(),
                s.status.is_authenticated(),
                s.status.is_subscribed(),
            ),
            None => (false, false, false),
        };
        let state = self.state.lock().await;
        EngineStatus {
            leader_id: self.leader_id.clone(),
            state: self.lifecycle.current(),
            connected,
            authenticated,
            subscribed,
            queue_depth: self.dispatcher.queue_depth(),
            processed_signals: state.normalizer.processed_count(),
            followers: state.links.len(),
            leader_positions: state.tracker.open_count(&self.leader_id),
        }
    }

    /// Start monitoring the leader with `credential`.
    pub async fn start(&self, credential: AccountCredential) -> Result<(), EngineError> {
        if credential.id != self.leader_id {
            return Err(EngineError::LeaderMismatch {
                expected: self.leader_id.clone(),
                got: credential.id,
            });
        }

        let mut session = self.session.lock().await;
        if self.lifecycle.current().is_running() {
            return Err(EngineError::AlreadyRunning(self.leader_id.clone()));
        }
        // Left over from a connection that exhausted its retries
        if let Some(previous) = session.take() {
            previous.finish().await;
        }

        self.transition(EngineState::Connecting)?;
        self.seed_positions(&credential).await;

        let connector_session = ConnectorSession::connect(
            Arc::clone(&self.connector),
            credential,
            self.config.ingest_buffer.max(1),
        );
        let status = connector_session.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = Ingest {
            leader_id: self.leader_id.clone(),
            state: Arc::clone(&self.state),
            dispatcher: Arc::clone(&self.dispatcher),
            reporter: self.reporter.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
        };
        let task = tokio::spawn(ingest.run(connector_session, shutdown_rx));

        *session = Some(RunningSession {
            shutdown_tx,
            task,
            status,
        });
        tracing::info!(leader = %self.leader_id, connector = self.connector.kind(), "Relay started");
        Ok(())
    }

    /// Stop monitoring. Pending follower entries are discarded.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        if let Some(running) = session.take() {
            running.finish().await;
        }
        self.dispatcher.shutdown().await;

        if self.lifecycle.current() != EngineState::Stopped {
            self.transition(EngineState::Stopped)?;
        }
        tracing::info!(leader = %self.leader_id, "Relay stopped");
        Ok(())
    }

    /// Replace all links. Followers no longer linked lose their workers.
    pub async fn set_links(&self, links: Vec<FollowerLink>) -> Result<(), EngineError> {
        for link in &links {
            self.validate_link(link)?;
        }
        let removed: Vec<String> = {
            let mut state = self.state.lock().await;
            let removed = state
                .links
                .keys()
                .filter(|id| !links.iter().any(|l| l.follower_id() == id.as_str()))
                .cloned()
                .collect();
            state.links = links
                .into_iter()
                .map(|l| (l.follower_id().to_string(), l))
                .collect();
            removed
        };
        for follower_id in removed {
            self.dispatcher.remove_follower(&follower_id).await;
        }
        Ok(())
    }

    /// Add or replace one link. A follower added while running has its
    /// positions seeded first.
    pub async fn upsert_link(&self, link: FollowerLink) -> Result<(), EngineError> {
        self.validate_link(&link)?;
        if self.lifecycle.current().is_running() {
            self.seed_follower(&link.follower).await;
        }
        let mut state = self.state.lock().await;
        tracing::info!(leader = %self.leader_id, follower = %link.follower_id(), mode = %link.copy_mode, "Follower link updated");
        state.links.insert(link.follower_id().to_string(), link);
        Ok(())
    }

    /// Returns whether a link was removed.
    pub async fn remove_link(&self, follower_id: &str) -> bool {
        let removed = self.state.lock().await.links.remove(follower_id).is_some();
        if removed {
            self.dispatcher.remove_follower(follower_id).await;
            tracing::info!(leader = %self.leader_id, follower = %follower_id, "Follower link removed");
        }
        removed
    }

    pub async fn links(&self) -> Vec<FollowerLink> {
        let state = self.state.lock().await;
        let mut links: Vec<FollowerLink> = state.links.values().cloned().collect();
        links.sort_by(|a, b| a.follower_id().cmp(b.follower_id()));
        links
    }

    /// Forget processed signal ids so that replays are mirrored again.
    /// Returns how many ids were dropped.
    pub async fn clear_processed_signals(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.normalizer.processed_count();
        state.normalizer.clear();
        state.dispatched.clear();
        tracing::info!(leader = %self.leader_id, cleared, "Processed signals cleared");
        cleared
    }

    /// Tracked positions of the leader (or of a follower).
    pub async fn positions(&self, account_id: &str) -> Vec<PositionSnapshot> {
        self.state.lock().await.tracker.positions_for(account_id)
    }

    fn validate_link(&self, link: &FollowerLink) -> Result<(), EngineError> {
        if link.leader_id != self.leader_id {
            return Err(EngineError::ForeignLink {
                follower_id: link.follower_id().to_string(),
                leader_id: link.leader_id.clone(),
            });
        }
        if link.follower_id() == self.leader_id {
            return Err(EngineError::SelfFollow(self.leader_id.clone()));
        }
        Ok(())
    }

    fn transition(&self, next: EngineState) -> Result<(), EngineError> {
        self.lifecycle.transition(next)?;
        self.reporter.emit(RelayEvent::StateChanged {
            leader_id: self.leader_id.clone(),
            state: next,
        });
        Ok(())
    }

    async fn seed_positions(&self, leader: &AccountCredential) {
        match self.api.fetch_positions(leader).await {
            Ok(positions) => {
                tracing::info!(leader = %self.leader_id, count = positions.len(), "Leader positions seeded");
                self.state.lock().await.tracker.seed(&leader.id, positions);
            }
            Err(e) => {
                tracing::warn!(leader = %self.leader_id, error = %e, "Failed to seed leader positions");
            }
        }

        let followers: Vec<AccountCredential> = {
            let state = self.state.lock().await;
            state.links.values().map(|l| l.follower.clone()).collect()
        };
        for follower in &followers {
            self.seed_follower(follower).await;
        }
    }

    async fn seed_follower(&self, follower: &AccountCredential) {
        match self.api.fetch_positions(follower).await {
            Ok(positions) => {
                tracing::debug!(follower = %follower.id, count = positions.len(), "Follower positions seeded");
                self.state.lock().await.tracker.seed(&follower.id, positions);
            }
            Err(e) => {
                tracing::warn!(follower = %follower.id, error = %e, "Failed to seed follower positions");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest task
// ---------------------------------------------------------------------------

/// Consumes connector events for one running session.
struct Ingest {
    leader_id: String,
    state: SharedState,
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
    lifecycle: Arc<Lifecycle>,
}

impl Ingest {
    async fn run(self, mut session: ConnectorSession, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal(&mut shutdown) => {
                    session.close().await;
                    break;
                }
                event = session.next_event() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tracing::warn!(leader = %self.leader_id, "Connector ended");
                        if self.lifecycle.current().is_running() {
                            self.set_state(EngineState::Stopped);
                        }
                        break;
                    }
                },
            }
        }
    }

    fn set_state(&self, next: EngineState) {
        match self.lifecycle.transition(next) {
            Ok(previous) => {
                tracing::info!(leader = %self.leader_id, from = %previous, to = %next, "Relay state changed");
                self.reporter.emit(RelayEvent::StateChanged {
                    leader_id: self.leader_id.clone(),
                    state: next,
                });
            }
            Err(e) => tracing::debug!(leader = %self.leader_id, error = %e, "State change ignored"),
        }
    }

    async fn handle_event(&self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Connected => {
                tracing::debug!(leader = %self.leader_id, "Connector transport up");
            }
            ConnectorEvent::Authenticated => self.set_state(EngineState::Monitoring),
            ConnectorEvent::Disconnected { reason, auth_failure } => {
                if self.lifecycle.current() == EngineState::Monitoring {
                    self.set_state(EngineState::Degraded { attempt: 0 });
                }
                let kind = if auth_failure {
                    ErrorKind::AuthError
                } else {
                    ErrorKind::TransportError
                };
                self.reporter.error(kind, None, None, reason);
            }
            ConnectorEvent::Reconnecting { attempt, delay } => {
                tracing::info!(leader = %self.leader_id, attempt, delay_ms = delay.as_millis() as u64, "Relay reconnecting");
                if matches!(self.lifecycle.current(), EngineState::Degraded { .. }) {
                    self.set_state(EngineState::Degraded { attempt });
                }
            }
            ConnectorEvent::Exhausted { attempts } => {
                self.set_state(EngineState::Stopped);
                self.reporter.error(
                    ErrorKind::ConnectionExhausted,
                    None,
                    None,
                    format!("gave up after {attempts} reconnect attempts"),
                );
            }
            ConnectorEvent::Message(raw) => self.handle_raw(raw).await,
        }
    }

    async fn handle_raw(&self, raw: RawMessage) {
        if !self.lifecycle.current().forwards_signals() {
            tracing::debug!(leader = %self.leader_id, "Relay not monitoring, message dropped");
            return;
        }

        let raw = match raw {
            RawMessage::Position(record) => return self.handle_positions(vec![record], false).await,
            RawMessage::PositionSnapshot(records) => return self.handle_positions(records, true).await,
            other => other,
        };

        // Classified in the same critical section as dedup so fills of
        // one symbol are applied to the leader position in arrival order
        let (plan, links) = {
            let mut state = self.state.lock().await;
            match state.normalizer.try_normalize(&raw) {
                Ok(Some(signal)) => {
                    let transition = state.tracker.record_fill(
                        &self.leader_id,
                        &signal.symbol,
                        signal.side,
                        signal.size,
                        signal.price,
                    );
                    tracing::debug!(leader = %self.leader_id, signal_id = %signal.signal_id, transition = ?transition, "Leader fill classified");
                    (MirrorPlan::classify(signal, transition), state.active_links())
                }
                Ok(None) => return,
                Err(e) => {
                    drop(state);
                    counter!("signals_malformed_total").increment(1);
                    tracing::warn!(leader = %self.leader_id, error = %e, raw = ?raw, "Dropping malformed leader record");
                    self.reporter.error(ErrorKind::MalformedSignal, None, None, e.to_string());
                    return;
                }
            }
        };

        let signal = plan.signal();
        counter!("signals_observed_total").increment(1);
        self.reporter.stats().record_signal();
        tracing::info!(leader = %self.leader_id, signal = %signal, effect = ?signal.effect, followers = links.len(), "Leader trade detected");
        self.reporter.emit(RelayEvent::SignalObserved(signal.clone()));

        match plan {
            MirrorPlan::Trade(signal) => {
                let queued = self.dispatcher.dispatch(&signal, &links).await;
                tracing::debug!(signal_id = %signal.signal_id, queued, "Signal dispatched");
            }
            MirrorPlan::Close { request, trim } => {
                self.announce_close(&request);
                self.dispatch_close_leg(&request, &trim, &links).await;
            }
            MirrorPlan::Flip { request, trim, open } => {
                self.announce_close(&request);
                // Same follower queues, so the close leg always runs first
                self.dispatch_close_leg(&request, &trim, &links).await;
                let queued = self.dispatcher.dispatch(&open, &links).await;
                tracing::debug!(signal_id = %open.signal_id, queued, "Flip entry dispatched");
            }
        }
    }

    /// Followers that copy closes are flattened; the rest trim their
    /// position by the mirrored size.
    async fn dispatch_close_leg(&self, request: &CloseRequest, trim: &TradeSignal, links: &[FollowerLink]) {
        let (closing, trimming): (Vec<FollowerLink>, Vec<FollowerLink>) =
            links.iter().cloned().partition(|l| l.copy_position_close);
        let closed = self.dispatcher.dispatch_close(request, &closing).await;
        let trimmed = self.dispatcher.dispatch(trim, &trimming).await;
        tracing::debug!(close_id = %request.close_id, closed, trimmed, "Close dispatched");
    }

    fn announce_close(&self, request: &CloseRequest) {
        tracing::info!(
            leader = %self.leader_id,
            symbol = %request.symbol,
            previous_size = %request.previous_size,
            "Leader position closed"
        );
        self.reporter.emit(RelayEvent::LeaderPositionClosed {
            leader_id: self.leader_id.clone(),
            symbol: request.symbol.clone(),
            previous_size: request.previous_size,
        });
    }

    /// Position reports. A snapshot lists every open position, so tracked
    /// leader symbols missing from it are observed as flat.
    async fn handle_positions(&self, records: Vec<PositionRecord>, snapshot: bool) {
        let mut reports: Vec<(String, Decimal, Option<Decimal>)> = Vec::with_capacity(records.len());
        for record in records {
            let Some(symbol) = record.symbol().map(str::to_string) else {
                tracing::debug!(leader = %self.leader_id, "Position record without symbol dropped");
                continue;
            };
            let Some(size) = record.size else {
                tracing::debug!(leader = %self.leader_id, symbol = %symbol, "Position record without size dropped");
                continue;
            };
            reports.push((symbol, size, record.entry_price));
        }

        let (requests, links) = {
            let mut state = self.state.lock().await;
            if snapshot {
                let listed: HashSet<String> = reports.iter().map(|(symbol, _, _)| symbol.clone()).collect();
                let missing: Vec<String> = state
                    .tracker
                    .positions_for(&self.leader_id)
                    .into_iter()
                    .map(|p| p.symbol)
                    .filter(|symbol| !listed.contains(symbol))
                    .collect();
                reports.extend(missing.into_iter().map(|symbol| (symbol, Decimal::ZERO, None)));
            }

            let mut requests = Vec::new();
            for (symbol, size, entry) in reports {
                let transition = state.tracker.observe_report(&self.leader_id, &symbol, size, entry);
                tracing::debug!(leader = %self.leader_id, symbol = %symbol, transition = ?transition, "Leader position observed");
                if let Some(previous_size) = transition.closed_size() {
                    requests.push(CloseRequest {
                        close_id: state.next_close_id(&symbol),
                        symbol,
                        previous_size,
                    });
                }
            }
            if requests.is_empty() {
                return;
            }
            (requests, state.active_links())
        };

        for request in requests {
            counter!("signals_observed_total").increment(1);
            self.reporter.stats().record_signal();
            self.announce_close(&request);
            let queued = self.dispatcher.dispatch_close(&request, &links).await;
            tracing::debug!(close_id = %request.close_id, queued, "Close dispatched");
        }
    }
}

/// How one leader fill is mirrored, decided from what it did to the
/// leader's own position.
#[derive(Debug)]
enum MirrorPlan {
    Trade(TradeSignal),
    /// The leader went flat. `trim` is the fill as a reduction, for
    /// followers that do not copy closes.
    Close { request: CloseRequest, trim: TradeSignal },
    /// The leader crossed zero: close leg first, then a fresh entry sized
    /// from the leader's new position.
    Flip {
        request: CloseRequest,
        trim: TradeSignal,
        open: TradeSignal,
    },
}

impl MirrorPlan {
    fn classify(mut signal: TradeSignal, transition: PositionTransition) -> Self {
        match transition {
            PositionTransition::Unchanged | PositionTransition::Opened { .. } => {
                signal.effect = PositionEffect::Open;
                MirrorPlan::Trade(signal)
            }
            PositionTransition::Increased { .. } => {
                signal.effect = PositionEffect::Increase;
                MirrorPlan::Trade(signal)
            }
            PositionTransition::Reduced { .. } => {
                signal.effect = PositionEffect::Reduce;
                MirrorPlan::Trade(signal)
            }
            PositionTransition::Closed { previous } => {
                signal.effect = PositionEffect::Reduce;
                let request = CloseRequest {
                    close_id: signal.signal_id.clone(),
                    symbol: signal.symbol.clone(),
                    previous_size: previous,
                };
                MirrorPlan::Close { request, trim: signal }
            }
            PositionTransition::Flipped { previous, current } => {
                let close_id = format!("{}:close", signal.signal_id);
                let request = CloseRequest {
                    close_id: close_id.clone(),
                    symbol: signal.symbol.clone(),
                    previous_size: previous,
                };
                let open = TradeSignal {
                    signal_id: format!("{}:open", signal.signal_id),
                    size: current.abs(),
                    reduce_only: false,
                    effect: PositionEffect::Open,
                    ..signal.clone()
                };
                let trim = TradeSignal {
                    signal_id: close_id,
                    size: previous.abs(),
                    effect: PositionEffect::Reduce,
                    ..signal
                };
                MirrorPlan::Flip { request, trim, open }
            }
        }
    }

    /// The leader trade as observed, tagged with its effect.
    fn signal(&self) -> &TradeSignal {
        match self {
            MirrorPlan::Trade(signal) => signal,
            MirrorPlan::Close { trim, .. } => trim,
            MirrorPlan::Flip { trim, .. } => trim,
        }
    }
}
