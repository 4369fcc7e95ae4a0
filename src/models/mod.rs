pub mod credential;
pub mod link;
pub mod order;
pub mod position;
pub mod record;
pub mod signal;

pub use credential::AccountCredential;
pub use link::FollowerLink;
pub use order::{FollowerOrder, OrderType};
pub use position::PositionSnapshot;
pub use record::{ExecutionKind, ExecutionRecord, ExecutionStatus};
pub use signal::{PositionEffect, SignalSource, TradeSignal};

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Side that flattens a position with the given signed size.
    pub fn closing(signed_size: rust_decimal::Decimal) -> Self {
        if signed_size.is_sign_negative() {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Signed position change of trading `size` on this side.
    pub fn signed(self, size: rust_decimal::Decimal) -> rust_decimal::Decimal {
        match self {
            Side::Buy => size,
            Side::Sell => -size,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
