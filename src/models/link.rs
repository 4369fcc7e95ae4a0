use rust_decimal::Decimal;
use sqlx::FromRow;

use crate::execution::position_sizer::CopyMode;
use crate::execution::risk_manager::RiskLimits;

use super::AccountCredential;

/// Default lot bounds when a link does not configure its own.
pub const DEFAULT_MIN_LOT: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
pub const DEFAULT_MAX_LOT: Decimal = Decimal::from_parts(100, 0, 0, false, 0);

/// A follower's subscription to a leader, with its sizing and risk settings.
#[derive(Debug, Clone)]
pub struct FollowerLink {
    pub follower: AccountCredential,
    pub leader_id: String,
    pub copy_mode: CopyMode,
    pub min_lot: Decimal,
    pub max_lot: Decimal,
    pub risk_limits: RiskLimits,
    /// Mirror the inverse of the leader's side.
    pub reverse_direction: bool,
    /// Flatten the follower when the leader's position closes.
    pub copy_position_close: bool,
    pub enabled: bool,
}

impl FollowerLink {
    pub fn new(follower: AccountCredential, leader_id: impl Into<String>, copy_mode: CopyMode) -> Self {
        Self {
            follower,
            leader_id: leader_id.into(),
            copy_mode,
            min_lot: DEFAULT_MIN_LOT,
            max_lot: DEFAULT_MAX_LOT,
            risk_limits: RiskLimits::default(),
            reverse_direction: false,
            copy_position_close: true,
            enabled: true,
        }
    }

    pub fn follower_id(&self) -> &str {
        &self.follower.id
    }

    pub fn with_lot_bounds(mut self, min_lot: Decimal, max_lot: Decimal) -> Self {
        self.min_lot = min_lot;
        self.max_lot = max_lot;
        self
    }

    pub fn with_risk_limits(mut self, limits: RiskLimits) -> Self {
        self.risk_limits = limits;
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse_direction = true;
        self
    }
}

/// Row shape of `follower_links` joined with the follower's `accounts` row.
#[derive(Debug, Clone, FromRow)]
pub struct FollowerLinkRow {
    pub follower_id: String,
    pub follower_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub leader_id: String,
    pub copy_mode: String,
    pub mode_value: Decimal,
    pub min_lot: Option<Decimal>,
    pub max_lot: Option<Decimal>,
    pub max_daily_loss: Option<Decimal>,
    pub max_open_positions: Option<i32>,
    pub max_daily_trades: Option<i32>,
    pub reverse_direction: bool,
    pub copy_position_close: bool,
    pub enabled: bool,
}

impl TryFrom<FollowerLinkRow> for FollowerLink {
    type Error = anyhow::Error;

    fn try_from(row: FollowerLinkRow) -> Result<Self, Self::Error> {
        let copy_mode = CopyMode::from_parts(&row.copy_mode, row.mode_value).ok_or_else(|| {
            anyhow::anyhow!(
                "follower {} has unknown copy mode '{}'",
                row.follower_id,
                row.copy_mode
            )
        })?;

        let defaults = RiskLimits::default();
        let risk_limits = RiskLimits {
            max_daily_loss: row.max_daily_loss.unwrap_or(defaults.max_daily_loss),
            max_open_positions: row
                .max_open_positions
                .map(|n| n.max(0) as usize)
                .unwrap_or(defaults.max_open_positions),
            max_daily_trades: row
                .max_daily_trades
                .map(|n| n.max(0) as u32)
                .unwrap_or(defaults.max_daily_trades),
        };

        Ok(Self {
            follower: AccountCredential::new(
                row.follower_id,
                row.follower_name,
                row.api_key,
                row.api_secret,
            ),
            leader_id: row.leader_id,
            copy_mode,
            min_lot: row.min_lot.unwrap_or(DEFAULT_MIN_LOT),
            max_lot: row.max_lot.unwrap_or(DEFAULT_MAX_LOT),
            risk_limits,
            reverse_direction: row.reverse_direction,
            copy_position_close: row.copy_position_close,
            enabled: row.enabled,
        })
    }
}
