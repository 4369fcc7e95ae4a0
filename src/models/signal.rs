use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// Which raw shape a signal was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Fill,
    OrderUpdate,
    PositionClose,
}

/// What a leader trade did to the leader's own position in that symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEffect {
    /// Opened from flat, or the leader's position is unknown.
    #[default]
    Open,
    Increase,
    /// Made the position smaller without closing it.
    Reduce,
}

impl PositionEffect {
    pub fn is_reduction(self) -> bool {
        self == PositionEffect::Reduce
    }
}

/// A canonical leader trade, ready for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Stable identity derived from the exchange fill/order identifier.
    pub signal_id: String,
    /// Leader account the trade was observed on.
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Filled delta, always positive.
    pub size: Decimal,
    /// Fill price, always positive.
    pub price: Decimal,
    pub reduce_only: bool,
    /// Set by the engine from the leader's tracked position.
    #[serde(default)]
    pub effect: PositionEffect,
    pub source: SignalSource,
    pub observed_at: DateTime<Utc>,
}

impl fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signal[{}]: {} {} {} @ {}",
            self.signal_id, self.side, self.size, self.symbol, self.price,
        )
    }
}
