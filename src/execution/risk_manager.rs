use chrono::{Local, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{FollowerLink, FollowerOrder, OrderType, Side, TradeSignal};

use super::position_sizer::{calculate_size, SizingRejection};

/// Configurable per-follower guardrails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Realized loss for the day at which new entries stop (default 500).
    /// Zero disables the check.
    pub max_daily_loss: Decimal,
    /// Max concurrent open positions (default 10).
    pub max_open_positions: usize,
    /// Max entries per day (default 100).
    pub max_daily_trades: u32,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: Decimal::from(500),
            max_open_positions: 10,
            max_daily_trades: 100,
        }
    }
}

/// Today's local calendar date; daily counters roll over at local midnight.
pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

/// Per-follower counters that reset every day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRiskState {
    pub day: NaiveDate,
    /// Sum of realized losses today, as a positive number.
    pub realized_loss: Decimal,
    pub trades: u32,
}

impl DailyRiskState {
    pub fn new(day: NaiveDate) -> Self {
        Self {
            day,
            realized_loss: Decimal::ZERO,
            trades: 0,
        }
    }

    /// Reset the counters if `today` is a new day.
    pub fn roll(&mut self, today: NaiveDate) {
        if today != self.day {
            *self = Self::new(today);
        }
    }

    pub fn record_trade(&mut self) {
        self.trades = self.trades.saturating_add(1);
    }

    pub fn record_pnl(&mut self, pnl: Decimal) {
        if pnl < Decimal::ZERO {
            self.realized_loss += -pnl;
        }
    }
}

/// Risk check violation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("daily loss limit reached: loss {loss}, limit {limit}")]
    DailyLossExceeded { loss: Decimal, limit: Decimal },

    #[error("position already open in {symbol}")]
    SymbolAlreadyHeld { symbol: String },

    #[error("too many open positions: {current}/{max}")]
    TooManyPositions { current: usize, max: usize },

    #[error("daily trade limit reached: {count}/{max}")]
    DailyTradeLimit { count: u32, max: u32 },
}

impl RiskViolation {
    pub fn code(&self) -> &'static str {
        match self {
            RiskViolation::DailyLossExceeded { .. } => "daily_loss_limit",
            RiskViolation::SymbolAlreadyHeld { .. } => "symbol_already_held",
            RiskViolation::TooManyPositions { .. } => "max_open_positions",
            RiskViolation::DailyTradeLimit { .. } => "daily_trade_limit",
        }
    }
}

/// Guardrails for a new entry. Reductions and closes are never blocked.
pub fn check_entry(
    symbol: &str,
    held: Decimal,
    open_positions: usize,
    state: &DailyRiskState,
    limits: &RiskLimits,
) -> Result<(), RiskViolation> {
    // 1. Daily loss
    if !limits.max_daily_loss.is_zero() && state.realized_loss >= limits.max_daily_loss {
        return Err(RiskViolation::DailyLossExceeded {
            loss: state.realized_loss,
            limit: limits.max_daily_loss,
        });
    }

    // 2. One position per symbol
    if !held.is_zero() {
        return Err(RiskViolation::SymbolAlreadyHeld {
            symbol: symbol.to_string(),
        });
    }

    // 3. Open position count
    if open_positions >= limits.max_open_positions {
        return Err(RiskViolation::TooManyPositions {
            current: open_positions,
            max: limits.max_open_positions,
        });
    }

    // 4. Daily trade count
    if state.trades >= limits.max_daily_trades {
        return Err(RiskViolation::DailyTradeLimit {
            count: state.trades,
            max: limits.max_daily_trades,
        });
    }

    Ok(())
}

/// Why a (signal, follower) pair produced no order.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderRejection {
    #[error(transparent)]
    Sizing(#[from] SizingRejection),

    #[error(transparent)]
    Risk(#[from] RiskViolation),

    #[error("no_position_to_reduce")]
    NothingToReduce,
}

impl OrderRejection {
    pub fn code(&self) -> &'static str {
        match self {
            OrderRejection::Sizing(SizingRejection::SizeBelowMinimum) => "size_below_minimum",
            OrderRejection::Sizing(SizingRejection::BalanceUnavailable) => "balance_unavailable",
            OrderRejection::Sizing(SizingRejection::InvalidPrice) => "invalid_price",
            OrderRejection::Risk(v) => v.code(),
            OrderRejection::NothingToReduce => "no_position_to_reduce",
        }
    }
}

/// What the follower currently has, read from the tracker.
#[derive(Debug, Clone)]
pub struct FollowerExposure {
    /// Signed position in the signal's symbol.
    pub held: Decimal,
    pub open_positions: usize,
    pub available_balance: Option<Decimal>,
}

/// Size and shape the follower's order for a leader signal.
///
/// A signal in the direction that reduces the follower's own position is a
/// reduction: it skips the entry guardrails, is sent reduce-only, and is
/// capped at what the follower holds. A leader trade that shrank the
/// leader's position may only ever reduce the follower; a follower with
/// nothing to reduce is skipped.
pub fn compute_follower_order(
    signal: &TradeSignal,
    link: &FollowerLink,
    exposure: &FollowerExposure,
    daily: &DailyRiskState,
) -> Result<FollowerOrder, OrderRejection> {
    let side = if link.reverse_direction {
        signal.side.opposite()
    } else {
        signal.side
    };

    let held = exposure.held;
    let reduces = !held.is_zero() && Side::closing(held) == side;

    let leader_reducing = signal.reduce_only || signal.effect.is_reduction();
    if leader_reducing && !reduces {
        return Err(OrderRejection::NothingToReduce);
    }
    if !reduces {
        check_entry(
            &signal.symbol,
            held,
            exposure.open_positions,
            daily,
            &link.risk_limits,
        )?;
    }

    let mut size = calculate_size(
        link.copy_mode,
        signal.size,
        signal.price,
        exposure.available_balance,
        link.min_lot,
        link.max_lot,
    )?;
    if reduces {
        size = size.min(held.abs());
    }

    Ok(FollowerOrder {
        follower_id: link.follower_id().to_string(),
        symbol: signal.symbol.clone(),
        side,
        size,
        order_type: OrderType::Market,
        limit_price: None,
        reduce_only: reduces,
        client_order_id: FollowerOrder::client_id_for(&signal.signal_id, link.follower_id()),
    })
}

/// Reduce-only market order that flattens `position`, or `None` when flat.
pub fn compute_close_order(
    close_id: &str,
    symbol: &str,
    link: &FollowerLink,
    position: Decimal,
) -> Option<FollowerOrder> {
    if position.is_zero() {
        return None;
    }
    Some(FollowerOrder {
        follower_id: link.follower_id().to_string(),
        symbol: symbol.to_string(),
        side: Side::closing(position),
        size: position.abs(),
        order_type: OrderType::Market,
        limit_price: None,
        reduce_only: true,
        client_order_id: FollowerOrder::client_id_for(close_id, link.follower_id()),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
