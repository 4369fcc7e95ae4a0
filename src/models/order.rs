use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    /// Exchange spelling used by the order endpoint.
    pub fn as_api_str(self) -> &'static str {
        match self {
            OrderType::Market => "market_order",
            OrderType::Limit => "limit_order",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
        }
    }
}

/// A sized order for one follower account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowerOrder {
    pub follower_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub reduce_only: bool,
    /// Deterministic per (signal, follower), so a retried placement carries
    /// the same client id.
    pub client_order_id: String,
}

impl FollowerOrder {
    pub fn client_id_for(signal_id: &str, follower_id: &str) -> String {
        format!("copy_{signal_id}_{follower_id}")
    }
}

impl fmt::Display for FollowerOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}{}",
            self.side,
            self.size,
            self.symbol,
            self.order_type,
            if self.reduce_only { " reduce-only" } else { "" },
        )
    }
}
