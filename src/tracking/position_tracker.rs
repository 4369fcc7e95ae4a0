use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{PositionSnapshot, Side};

/// Change between two successive observations of one (account, symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum PositionTransition {
    Unchanged,
    Opened { size: Decimal },
    Increased { previous: Decimal, current: Decimal },
    Reduced { previous: Decimal, current: Decimal },
    /// Went flat.
    Closed { previous: Decimal },
    /// Crossed zero in one observation.
    Flipped { previous: Decimal, current: Decimal },
}

impl PositionTransition {
    /// The previous position no longer exists (closed or flipped).
    pub fn closed_size(&self) -> Option<Decimal> {
        match self {
            PositionTransition::Closed { previous } => Some(*previous),
            PositionTransition::Flipped { previous, .. } => Some(*previous),
            _ => None,
        }
    }
}

fn classify(previous: Decimal, current: Decimal) -> PositionTransition {
    if previous == current {
        return PositionTransition::Unchanged;
    }
    if previous.is_zero() {
        return PositionTransition::Opened { size: current };
    }
    if current.is_zero() {
        return PositionTransition::Closed { previous };
    }
    if previous.is_sign_positive() != current.is_sign_positive() {
        return PositionTransition::Flipped { previous, current };
    }
    if current.abs() > previous.abs() {
        PositionTransition::Increased { previous, current }
    } else {
        PositionTransition::Reduced { previous, current }
    }
}

/// How long a reported position move waits for the fill that explains it.
const REPORT_MATCH_WINDOW_SECS: i64 = 10;

/// Position movement seen in a report before any fill accounted for it.
#[derive(Debug, Clone, Copy)]
struct UnmatchedMove {
    delta: Decimal,
    at: DateTime<Utc>,
}

/// Last known signed position per (account, symbol).
///
/// Flat positions are not stored. Updates are last-write-wins.
///
/// Fills and position reports arrive on separate channels in no fixed
/// order. Movement a report shows ahead of the fills is kept as
/// unmatched until a fill consumes it, so [`record_fill`] classifies every
/// fill against the position it actually started from.
///
/// [`record_fill`]: PositionTracker::record_fill
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: HashMap<(String, String), PositionSnapshot>,
    unmatched: HashMap<(String, String), UnmatchedMove>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an authoritative position and report how it changed.
    pub fn observe(
        &mut self,
        account_id: &str,
        symbol: &str,
        size: Decimal,
        entry_price: Option<Decimal>,
    ) -> PositionTransition {
        let key = (account_id.to_string(), symbol.to_string());
        let previous = self.positions.get(&key).map(|p| p.size).unwrap_or(Decimal::ZERO);
        let transition = classify(previous, size);

        if size.is_zero() {
            self.positions.remove(&key);
        } else {
            let entry = entry_price
                .or_else(|| self.positions.get(&key).map(|p| p.entry_price))
                .unwrap_or(Decimal::ZERO);
            self.positions
                .insert(key, PositionSnapshot::new(account_id, symbol, size, entry));
        }
        transition
    }

    /// Record a position report from the exchange. Any movement it shows
    /// beyond the fills seen so far is remembered for [`record_fill`].
    ///
    /// [`record_fill`]: PositionTracker::record_fill
    pub fn observe_report(
        &mut self,
        account_id: &str,
        symbol: &str,
        size: Decimal,
        entry_price: Option<Decimal>,
    ) -> PositionTransition {
        let now = Utc::now();
        let key = (account_id.to_string(), symbol.to_string());
        let moved = size - self.size_of(account_id, symbol);
        let transition = self.observe(account_id, symbol, size, entry_price);

        if !moved.is_zero() {
            let pending = self.pending_move(&key, now) + moved;
            if pending.is_zero() {
                self.unmatched.remove(&key);
            } else {
                self.unmatched.insert(key, UnmatchedMove { delta: pending, at: now });
            }
        }
        transition
    }

    /// Record a fill of the account itself and classify what it did to the
    /// position it started from.
    ///
    /// The part of the fill a report already showed is not applied twice.
    /// Unmatched movement in the other direction came from something other
    /// than a fill (liquidation, deleveraging) and is dropped.
    pub fn record_fill(
        &mut self,
        account_id: &str,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> PositionTransition {
        let key = (account_id.to_string(), symbol.to_string());
        let delta = side.signed(size);
        let mut pending = self.pending_move(&key, Utc::now());
        if !pending.is_zero() && pending.is_sign_positive() != delta.is_sign_positive() {
            pending = Decimal::ZERO;
        }

        let before = self.size_of(account_id, symbol) - pending;
        let after = before + delta;

        let matched = if pending.abs() < delta.abs() { pending } else { delta };
        let left = pending - matched;
        if left.is_zero() {
            self.unmatched.remove(&key);
        } else if let Some(entry) = self.unmatched.get_mut(&key) {
            entry.delta = left;
        }

        let unapplied = delta - matched;
        if !unapplied.is_zero() {
            self.apply_fill(account_id, symbol, side, unapplied.abs(), price);
        }
        classify(before, after)
    }

    /// Unmatched movement still inside the match window.
    fn pending_move(&mut self, key: &(String, String), now: DateTime<Utc>) -> Decimal {
        match self.unmatched.get(key) {
            Some(m) if now - m.at <= Duration::seconds(REPORT_MATCH_WINDOW_SECS) => m.delta,
            Some(_) => {
                self.unmatched.remove(key);
                Decimal::ZERO
            }
            None => Decimal::ZERO,
        }
    }

    /// Apply a follower's own executed order. Returns the realized PnL of
    /// the part that reduced an existing position (zero for pure entries).
    pub fn apply_fill(
        &mut self,
        account_id: &str,
        symbol: &str,
        side: Side,
        size: Decimal,
        price: Decimal,
    ) -> Decimal {
        let key = (account_id.to_string(), symbol.to_string());
        let (previous, entry) = self
            .positions
            .get(&key)
            .map(|p| (p.size, p.entry_price))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let delta = match side {
            Side::Buy => size,
            Side::Sell => -size,
        };
        let current = previous + delta;

        let same_direction = previous.is_zero() || previous.is_sign_positive() == delta.is_sign_positive();
        let (realized, new_entry) = if same_direction {
            // Weighted average entry
            let total = previous.abs() + size;
            let avg = if total.is_zero() {
                price
            } else {
                (entry * previous.abs() + price * size) / total
            };
            (Decimal::ZERO, avg)
        } else {
            let closed = size.min(previous.abs());
            let direction = if previous.is_sign_positive() { Decimal::ONE } else { -Decimal::ONE };
            let pnl = (price - entry) * closed * direction;
            let entry_after = if current.is_zero() || current.is_sign_positive() == previous.is_sign_positive() {
                entry
            } else {
                // Flipped through zero: the remainder opened at this price
                price
            };
            (pnl, entry_after)
        };

        if current.is_zero() {
            self.positions.remove(&key);
        } else {
            self.positions.insert(
                key,
                PositionSnapshot::new(account_id, symbol, current, new_entry.round_dp(8)),
            );
        }
        realized
    }

    pub fn get(&self, account_id: &str, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions.get(&(account_id.to_string(), symbol.to_string()))
    }

    /// Signed size, zero when flat or unknown.
    pub fn size_of(&self, account_id: &str, symbol: &str) -> Decimal {
        self.get(account_id, symbol).map(|p| p.size).unwrap_or(Decimal::ZERO)
    }

    pub fn open_count(&self, account_id: &str) -> usize {
        self.positions.keys().filter(|(a, _)| a == account_id).count()
    }

    pub fn positions_for(&self, account_id: &str) -> Vec<PositionSnapshot> {
        let mut out: Vec<PositionSnapshot> = self
            .positions
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        out
    }

    /// Replace everything known about an account with a fresh snapshot.
    pub fn seed(&mut self, account_id: &str, snapshots: Vec<PositionSnapshot>) {
        self.remove_account(account_id);
        for mut p in snapshots.into_iter().filter(|p| !p.is_flat()) {
            p.account_id = account_id.to_string();
            p.updated_at = Utc::now();
            self.positions.insert((account_id.to_string(), p.symbol.clone()), p);
        }
    }

    pub fn remove_account(&mut self, account_id: &str) {
        self.positions.retain(|(a, _), _| a != account_id);
        self.unmatched.retain(|(a, _), _| a != account_id);
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
