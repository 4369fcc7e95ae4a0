use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{FollowerOrder, OrderType, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Mirror of a leader fill.
    Mirror,
    /// Flatten after the leader's position closed.
    Close,
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Mirror => write!(f, "mirror"),
            ExecutionKind::Close => write!(f, "close"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// Rejected by sizing/risk policy or nothing to close; no order placed.
    Skipped,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Terminal outcome of one (signal, follower) pair. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub signal_id: String,
    pub leader_id: String,
    pub follower_id: String,
    pub kind: ExecutionKind,
    pub symbol: String,
    pub side: Option<Side>,
    pub size: Option<Decimal>,
    pub order_type: Option<OrderType>,
    pub reduce_only: bool,
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub attempts: u32,
    pub exchange_order_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl ExecutionRecord {
    fn base(
        signal_id: &str,
        leader_id: &str,
        follower_id: &str,
        kind: ExecutionKind,
        symbol: &str,
        status: ExecutionStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal_id: signal_id.to_string(),
            leader_id: leader_id.to_string(),
            follower_id: follower_id.to_string(),
            kind,
            symbol: symbol.to_string(),
            side: None,
            size: None,
            order_type: None,
            reduce_only: false,
            status,
            reason: None,
            attempts: 0,
            exchange_order_id: None,
            executed_at: Utc::now(),
        }
    }

    fn with_order(mut self, order: &FollowerOrder) -> Self {
        self.side = Some(order.side);
        self.size = Some(order.size);
        self.order_type = Some(order.order_type);
        self.reduce_only = order.reduce_only;
        self
    }

    pub fn success(
        signal_id: &str,
        leader_id: &str,
        kind: ExecutionKind,
        order: &FollowerOrder,
        attempts: u32,
        exchange_order_id: Option<String>,
    ) -> Self {
        let mut record = Self::base(
            signal_id,
            leader_id,
            &order.follower_id,
            kind,
            &order.symbol,
            ExecutionStatus::Success,
        )
        .with_order(order);
        record.attempts = attempts;
        record.exchange_order_id = exchange_order_id;
        record
    }

    pub fn failed(
        signal_id: &str,
        leader_id: &str,
        kind: ExecutionKind,
        order: &FollowerOrder,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::base(
            signal_id,
            leader_id,
            &order.follower_id,
            kind,
            &order.symbol,
            ExecutionStatus::Failed,
        )
        .with_order(order);
        record.attempts = attempts;
        record.reason = Some(reason.into());
        record
    }

    pub fn skipped(
        signal_id: &str,
        leader_id: &str,
        follower_id: &str,
        kind: ExecutionKind,
        symbol: &str,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::base(
            signal_id,
            leader_id,
            follower_id,
            kind,
            symbol,
            ExecutionStatus::Skipped,
        );
        record.reason = Some(reason.into());
        record
    }

    /// Failure that happened before an order could be built, e.g. the
    /// balance lookup a sizing mode depends on.
    pub fn failed_before_order(
        signal_id: &str,
        leader_id: &str,
        follower_id: &str,
        kind: ExecutionKind,
        symbol: &str,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::base(
            signal_id,
            leader_id,
            follower_id,
            kind,
            symbol,
            ExecutionStatus::Failed,
        );
        record.reason = Some(reason.into());
        record
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
