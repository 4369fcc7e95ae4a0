pub mod rest_client;
pub mod signer;
pub mod types;

pub use rest_client::RestClient;
pub use signer::{sign_message, RequestSigner, SignerError};
pub use types::{FillRecord, OrderUpdate, PositionRecord};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{AccountCredential, FollowerOrder, PositionSnapshot};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signing error: {0}")]
    Signer(#[from] SignerError),

    #[error("exchange returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl ExchangeError {
    /// Credential/signature problems, as opposed to transport or business errors.
    pub fn is_auth(&self) -> bool {
        match self {
            ExchangeError::Status { status, .. } => *status == 401 || *status == 403,
            ExchangeError::Signer(_) => true,
            _ => false,
        }
    }
}

/// Acknowledgement of an accepted order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlacedOrder {
    pub order_id: Option<String>,
    pub average_fill_price: Option<Decimal>,
}

/// Signed REST capability of the exchange, per account.
///
/// The relay only talks to the exchange through this trait so tests can
/// script responses without a network.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place_order(
        &self,
        account: &AccountCredential,
        order: &FollowerOrder,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn cancel_order(
        &self,
        account: &AccountCredential,
        order_id: &str,
        symbol: &str,
    ) -> Result<(), ExchangeError>;

    /// Open positions; flat symbols are omitted.
    async fn fetch_positions(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    async fn fetch_available_balance(
        &self,
        account: &AccountCredential,
        asset: &str,
    ) -> Result<Decimal, ExchangeError>;

    /// Most recent fills, newest first.
    async fn fetch_recent_fills(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<FillRecord>, ExchangeError>;
}
