use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::execution::risk_manager::{local_today, DailyRiskState};
use crate::ingestion::normalizer::{DedupSet, SignalNormalizer};
use crate::models::FollowerLink;
use crate::tracking::PositionTracker;

/// Mutable state of one relay engine.
///
/// Guarded by a single async mutex; never held across an exchange call.
#[derive(Debug)]
pub struct RelayState {
    pub normalizer: SignalNormalizer,
    pub tracker: PositionTracker,
    pub links: HashMap<String, FollowerLink>,
    pub daily_risk: HashMap<String, DailyRiskState>,
    /// `(signal_id, follower_id)` pairs already handed to a worker.
    pub dispatched: DedupSet,
    close_seq: u64,
}

pub type SharedState = Arc<Mutex<RelayState>>;

impl RelayState {
    pub fn new(leader_id: &str, dedup_capacity: usize) -> Self {
        Self {
            normalizer: SignalNormalizer::new(leader_id, dedup_capacity),
            tracker: PositionTracker::new(),
            links: HashMap::new(),
            daily_risk: HashMap::new(),
            // Each signal fans out to several followers
            dispatched: DedupSet::new(dedup_capacity.saturating_mul(4)),
            close_seq: 0,
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Enabled links, in a stable order.
    pub fn active_links(&self) -> Vec<FollowerLink> {
        let mut links: Vec<FollowerLink> = self.links.values().filter(|l| l.enabled).cloned().collect();
        links.sort_by(|a, b| a.follower_id().cmp(b.follower_id()));
        links
    }

    /// Today's risk counters for a follower, rolled over if the day changed.
    pub fn daily_risk_mut(&mut self, follower_id: &str) -> &mut DailyRiskState {
        let today = local_today();
        let state = self
            .daily_risk
            .entry(follower_id.to_string())
            .or_insert_with(|| DailyRiskState::new(today));
        state.roll(today);
        state
    }

    /// Marks the pair dispatched; `false` if it already was.
    pub fn mark_dispatched(&mut self, signal_id: &str, follower_id: &str) -> bool {
        self.dispatched.insert(&format!("{signal_id}|{follower_id}"))
    }

    pub fn next_close_id(&mut self, symbol: &str) -> String {
        self.close_seq += 1;
        format!(
            "close:{}:{}:{}-{}",
            self.normalizer.account_id(),
            symbol,
            chrono::Utc::now().timestamp_millis(),
            self.close_seq
        )
    }
}
