use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::errors::ErrorKind;
use crate::models::{ExecutionKind, ExecutionRecord, ExecutionStatus, TradeSignal};

use super::lifecycle::EngineState;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub leader_id: String,
    pub kind: ErrorKind,
    pub follower_id: Option<String>,
    pub signal_id: Option<String>,
    pub reason: String,
}

/// Everything observable about a running relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    SignalObserved(TradeSignal),
    LeaderPositionClosed {
        leader_id: String,
        symbol: String,
        previous_size: Decimal,
    },
    OrderMirrored(ExecutionRecord),
    PositionCloseMirrored(ExecutionRecord),
    MirrorSkipped(ExecutionRecord),
    StateChanged {
        leader_id: String,
        state: EngineState,
    },
    Error(ErrorEvent),
}

impl RelayEvent {
    pub fn leader_id(&self) -> &str {
        match self {
            RelayEvent::SignalObserved(s) => &s.account_id,
            RelayEvent::LeaderPositionClosed { leader_id, .. } => leader_id,
            RelayEvent::OrderMirrored(r)
            | RelayEvent::PositionCloseMirrored(r)
            | RelayEvent::MirrorSkipped(r) => &r.leader_id,
            RelayEvent::StateChanged { leader_id, .. } => leader_id,
            RelayEvent::Error(e) => &e.leader_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RelayStats {
    total_signals: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_signals: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    /// Successful placements over attempted placements, in percent.
    pub success_rate: f64,
}

impl RelayStats {
    pub fn record_signal(&self) {
        self.total_signals.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Success => &self.successes,
            ExecutionStatus::Failed => &self.failures,
            ExecutionStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let attempted = successes + failures;
        let success_rate = if attempted == 0 {
            0.0
        } else {
            successes as f64 / attempted as f64 * 100.0
        };
        StatsSnapshot {
            total_signals: self.total_signals.load(Ordering::Relaxed),
            successes,
            failures,
            skipped: self.skipped.load(Ordering::Relaxed),
            success_rate,
        }
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Fans terminal outcomes out to stats, metrics, the event bus and the
/// persistence sink.
#[derive(Clone)]
pub struct Reporter {
    leader_id: String,
    events: broadcast::Sender<RelayEvent>,
    records: Option<mpsc::Sender<ExecutionRecord>>,
    stats: Arc<RelayStats>,
}

impl Reporter {
    pub fn new(
        leader_id: impl Into<String>,
        events: broadcast::Sender<RelayEvent>,
        records: Option<mpsc::Sender<ExecutionRecord>>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            leader_id: leader_id.into(),
            events,
            records,
            stats,
        }
    }

    pub fn leader_id(&self) -> &str {
        &self.leader_id
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Broadcast an event. Having no subscribers is fine.
    pub fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    pub fn error(
        &self,
        kind: ErrorKind,
        follower_id: Option<&str>,
        signal_id: Option<&str>,
        reason: impl Into<String>,
    ) {
        self.emit(RelayEvent::Error(ErrorEvent {
            leader_id: self.leader_id.clone(),
            kind,
            follower_id: follower_id.map(str::to_string),
            signal_id: signal_id.map(str::to_string),
            reason: reason.into(),
        }));
    }

    /// Publish the one terminal record of a (signal, follower) pair.
    pub async fn report(&self, record: ExecutionRecord) {
        self.stats.record_outcome(record.status);

        match (record.status, record.kind) {
            (ExecutionStatus::Success, ExecutionKind::Mirror) => {
                counter!("orders_mirrored_total").increment(1);
                self.emit(RelayEvent::OrderMirrored(record.clone()));
            }
            (ExecutionStatus::Success, ExecutionKind::Close) => {
                counter!("position_closes_mirrored_total").increment(1);
                self.emit(RelayEvent::PositionCloseMirrored(record.clone()));
            }
            (ExecutionStatus::Skipped, _) => {
                counter!("mirrors_skipped_total").increment(1);
                self.emit(RelayEvent::MirrorSkipped(record.clone()));
            }
            (ExecutionStatus::Failed, _) => {
                counter!("orders_failed_total").increment(1);
                self.error(
                    ErrorKind::OrderPlacementError,
                    Some(&record.follower_id),
                    Some(&record.signal_id),
                    record.reason.clone().unwrap_or_default(),
                );
            }
        }

        if let Some(sink) = &self.records {
            if let Err(e) = sink.send(record).await {
                tracing::warn!(
                    signal_id = %e.0.signal_id,
                    follower = %e.0.follower_id,
                    "Execution record sink closed, record not persisted"
                );
            }
        }
    }
}
