use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Smallest order size the exchange accepts.
pub const PLATFORM_MIN_LOT: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

/// Decimal places kept on every computed size.
const SIZE_DP: u32 = 8;

/// Sizing mode of a follower link, with its parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum CopyMode {
    /// Always trade this many contracts.
    FixedLot(Decimal),
    /// Leader size × multiplier.
    Multiplier(Decimal),
    /// This percentage of available balance, converted at the fill price.
    PercentageBalance(Decimal),
    /// Risk this notional amount per trade, converted at the fill price.
    FixedRisk(Decimal),
}

impl CopyMode {
    pub fn from_parts(mode: &str, value: Decimal) -> Option<Self> {
        match mode.to_lowercase().as_str() {
            "fixed_lot" | "fixed" => Some(CopyMode::FixedLot(value)),
            "multiplier" | "proportional" => Some(CopyMode::Multiplier(value)),
            "percentage_balance" | "percentage" => Some(CopyMode::PercentageBalance(value)),
            "fixed_risk" => Some(CopyMode::FixedRisk(value)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CopyMode::FixedLot(_) => "fixed_lot",
            CopyMode::Multiplier(_) => "multiplier",
            CopyMode::PercentageBalance(_) => "percentage_balance",
            CopyMode::FixedRisk(_) => "fixed_risk",
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            CopyMode::FixedLot(v)
            | CopyMode::Multiplier(v)
            | CopyMode::PercentageBalance(v)
            | CopyMode::FixedRisk(v) => *v,
        }
    }

    /// Modes that size from the follower's balance.
    pub fn needs_balance(&self) -> bool {
        matches!(self, CopyMode::PercentageBalance(_))
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingRejection {
    #[error("size_below_minimum")]
    SizeBelowMinimum,

    #[error("balance_unavailable")]
    BalanceUnavailable,

    #[error("invalid_price")]
    InvalidPrice,
}

/// Unclamped follower size for a leader fill.
pub fn raw_size(
    mode: CopyMode,
    leader_size: Decimal,
    price: Decimal,
    available_balance: Option<Decimal>,
) -> Result<Decimal, SizingRejection> {
    match mode {
        CopyMode::FixedLot(lot) => Ok(lot),
        CopyMode::Multiplier(m) => Ok(leader_size * m),
        CopyMode::PercentageBalance(pct) => {
            let balance = available_balance.ok_or(SizingRejection::BalanceUnavailable)?;
            if price <= Decimal::ZERO {
                return Err(SizingRejection::InvalidPrice);
            }
            Ok(balance * pct / Decimal::ONE_HUNDRED / price)
        }
        CopyMode::FixedRisk(amount) => {
            if price <= Decimal::ZERO {
                return Err(SizingRejection::InvalidPrice);
            }
            Ok(amount / price)
        }
    }
}

/// Clamp into `[max(min_lot, platform minimum), max_lot]` and round.
///
/// A non-positive raw size, or bounds that leave no valid size, reject
/// the order instead of clamping it up.
pub fn clamp_size(raw: Decimal, min_lot: Decimal, max_lot: Decimal) -> Result<Decimal, SizingRejection> {
    let effective_min = min_lot.max(PLATFORM_MIN_LOT);
    if raw <= Decimal::ZERO || max_lot < effective_min {
        return Err(SizingRejection::SizeBelowMinimum);
    }
    Ok(raw.max(effective_min).min(max_lot).round_dp(SIZE_DP))
}

/// Follower size for a leader fill under `mode` and the link's lot bounds.
pub fn calculate_size(
    mode: CopyMode,
    leader_size: Decimal,
    price: Decimal,
    available_balance: Option<Decimal>,
    min_lot: Decimal,
    max_lot: Decimal,
) -> Result<Decimal, SizingRejection> {
    let raw = raw_size(mode, leader_size, price, available_balance)?;
    clamp_size(raw, min_lot, max_lot)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_multiplier_size() {
        let size = calculate_size(
            CopyMode::Multiplier(dec("0.5")),
            dec("10"),
            dec("65000"),
            None,
            dec("0.001"),
            dec("100"),
        )
        .unwrap();
        assert_eq!(size, dec("5"));
    }

    #[test]
    fn test_fixed_lot_ignores_leader_size() {
        let size = calculate_size(
            CopyMode::FixedLot(dec("1.0")),
            dec("37"),
            dec("2800"),
            None,
            dec("0.001"),
            dec("100"),
        )
        .unwrap();
        assert_eq!(size, dec("1.0"));
    }

    #[test]
    fn test_small_size_clamped_up_to_min_lot() {
        let size = calculate_size(
            CopyMode::Multiplier(dec("0.0003")),
            dec("1"),
            dec("100"),
            None,
            dec("0.001"),
            dec("100"),
        )
        .unwrap();
        assert_eq!(size, dec("0.001"));
    }

    #[test]
    fn test_platform_minimum_wins_over_lower_min_lot() {
        assert_eq!(clamp_size(dec("0.0001"), dec("0.0001"), dec("1")).unwrap(), dec("0.001"));
    }

    #[test]
    fn test_max_lot_caps() {
        let size = calculate_size(
            CopyMode::Multiplier(dec("3")),
            dec("50"),
            dec("100"),
            None,
            dec("0.001"),
            dec("25"),
        )
        .unwrap();
        assert_eq!(size, dec("25"));
    }

    #[test]
    fn test_percentage_balance() {
        // 10% of 10_000 = 1_000 notional at price 2_000 → 0.5
        let size = calculate_size(
            CopyMode::PercentageBalance(dec("10")),
            dec("3"),
            dec("2000"),
            Some(dec("10000")),
            dec("0.001"),
            dec("100"),
        )
        .unwrap();
        assert_eq!(size, dec("0.5"));
    }

    #[test]
    fn test_fixed_risk_is_amount_over_price() {
        // 100 at 50 per unit, no wallet needed
        let size = calculate_size(
            CopyMode::FixedRisk(dec("100")),
            dec("1"),
            dec("50"),
            None,
            dec("0.001"),
            dec("100"),
        )
        .unwrap();
        assert_eq!(size, dec("2"));

        // A small balance does not shrink the risk amount
        let size = raw_size(CopyMode::FixedRisk(dec("100")), dec("1"), dec("50"), Some(dec("10"))).unwrap();
        assert_eq!(size, dec("2"));
    }

    #[test]
    fn test_only_percentage_balance_needs_balance() {
        assert_eq!(
            raw_size(CopyMode::PercentageBalance(dec("5")), dec("1"), dec("100"), None),
            Err(SizingRejection::BalanceUnavailable)
        );
        assert!(CopyMode::PercentageBalance(dec("1")).needs_balance());
        assert!(!CopyMode::FixedRisk(dec("1")).needs_balance());
        assert!(!CopyMode::Multiplier(dec("1")).needs_balance());
    }

    #[test]
    fn test_zero_price_rejected_for_notional_modes() {
        assert_eq!(
            raw_size(CopyMode::FixedRisk(dec("5")), dec("1"), Decimal::ZERO, None),
            Err(SizingRejection::InvalidPrice)
        );
        assert_eq!(
            raw_size(CopyMode::PercentageBalance(dec("5")), dec("1"), Decimal::ZERO, Some(dec("100"))),
            Err(SizingRejection::InvalidPrice)
        );
    }

    #[test]
    fn test_non_positive_or_inverted_bounds_rejected() {
        assert_eq!(
            clamp_size(Decimal::ZERO, dec("0.001"), dec("1")),
            Err(SizingRejection::SizeBelowMinimum)
        );
        assert_eq!(
            clamp_size(dec("1"), dec("5"), dec("2")),
            Err(SizingRejection::SizeBelowMinimum)
        );
    }

    #[test]
    fn test_rounds_to_eight_places() {
        let size = clamp_size(dec("1.123456789"), dec("0.001"), dec("100")).unwrap();
        assert_eq!(size, dec("1.12345679"));
    }

    #[test]
    fn test_copy_mode_from_parts() {
        assert_eq!(CopyMode::from_parts("fixed_lot", dec("2")), Some(CopyMode::FixedLot(dec("2"))));
        assert_eq!(
            CopyMode::from_parts("PERCENTAGE_BALANCE", dec("5")),
            Some(CopyMode::PercentageBalance(dec("5")))
        );
        assert_eq!(CopyMode::from_parts("kelly", dec("1")), None);
        assert_eq!(CopyMode::Multiplier(dec("0.5")).to_string(), "multiplier(0.5)");
    }
}
