use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Last known position for one (account, symbol) pair.
///
/// `size` is signed: positive is long, negative is short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub account_id: String,
    pub symbol: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl PositionSnapshot {
    pub fn new(
        account_id: impl Into<String>,
        symbol: impl Into<String>,
        size: Decimal,
        entry_price: Decimal,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            symbol: symbol.into(),
            size,
            entry_price,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }
}
