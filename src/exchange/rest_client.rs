use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;

use crate::models::{AccountCredential, FollowerOrder, PositionSnapshot};

use super::signer::{unix_timestamp, RequestSigner};
use super::types::{
    ApiBalance, ApiEnvelope, ApiOrder, CancelOrderRequest, FillRecord, PlaceOrderRequest,
    PositionRecord,
};
use super::{ExchangeApi, ExchangeError, PlacedOrder};

pub const DEFAULT_REST_BASE: &str = "https://api.india.delta.exchange";
const API_PREFIX: &str = "/v2";
const USER_AGENT: &str = "copybot-rest-client";
const FILLS_PAGE_SIZE: &str = "50";

/// Signed REST client. Holds no credentials itself; every call is signed
/// with the account it is made for.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    timeout: Duration,
}

impl RestClient {
    pub fn new(http: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Build, sign and send one request, unwrapping the `{success, result}` envelope.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        account: &AccountCredential,
        method: Method,
        endpoint: &str,
        query: &[(&str, &str)],
        body: Option<String>,
    ) -> Result<T, ExchangeError> {
        let path = format!("{API_PREFIX}{endpoint}");
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| ExchangeError::Unexpected(format!("invalid url: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        let query_string = url.query().map(|q| format!("?{q}")).unwrap_or_default();
        let body = body.unwrap_or_default();

        let timestamp = unix_timestamp();
        let signer = RequestSigner::new(account);
        let signature = signer.sign(method.as_str(), &timestamp, &path, &query_string, &body)?;

        let mut req = self
            .http
            .request(method.clone(), url)
            .timeout(self.timeout)
            .header("api-key", signer.api_key())
            .header("timestamp", &timestamp)
            .header("signature", signature)
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json");
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout(self.timeout)
            } else {
                ExchangeError::Http(e)
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            tracing::warn!(
                account = %account.id,
                method = %method,
                path = %path,
                status = status.as_u16(),
                "Exchange request failed"
            );
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: ApiEnvelope<T> = resp.json().await?;
        if !envelope.success {
            let reason = envelope
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".into());
            return Err(ExchangeError::Rejected(reason));
        }

        envelope
            .result
            .ok_or_else(|| ExchangeError::Unexpected("response missing result".into()))
    }
}

#[async_trait]
impl ExchangeApi for RestClient {
    async fn place_order(
        &self,
        account: &AccountCredential,
        order: &FollowerOrder,
    ) -> Result<PlacedOrder, ExchangeError> {
        let request = PlaceOrderRequest {
            product_symbol: order.symbol.clone(),
            size: order.size,
            side: order.side.to_string(),
            order_type: order.order_type.as_api_str().to_string(),
            limit_price: order.limit_price.map(|p| p.to_string()),
            reduce_only: order.reduce_only,
            client_order_id: order.client_order_id.clone(),
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ExchangeError::Unexpected(e.to_string()))?;

        let placed: ApiOrder = self
            .signed_request(account, Method::POST, "/orders", &[], Some(body))
            .await?;

        tracing::info!(
            account = %account.id,
            order_id = ?placed.id,
            state = ?placed.state,
            "Order accepted by exchange"
        );

        Ok(PlacedOrder {
            order_id: placed.id,
            average_fill_price: placed.average_fill_price,
        })
    }

    async fn cancel_order(
        &self,
        account: &AccountCredential,
        order_id: &str,
        symbol: &str,
    ) -> Result<(), ExchangeError> {
        let request = CancelOrderRequest {
            id: order_id.to_string(),
            product_symbol: symbol.to_string(),
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| ExchangeError::Unexpected(e.to_string()))?;
        let _: serde_json::Value = self
            .signed_request(account, Method::DELETE, "/orders", &[], Some(body))
            .await?;
        tracing::info!(account = %account.id, order_id, "Order cancelled");
        Ok(())
    }

    async fn fetch_positions(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        let records: Vec<PositionRecord> = self
            .signed_request(account, Method::GET, "/positions/margined", &[], None)
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|p| {
                let symbol = p.symbol()?.to_string();
                let size = p.size.unwrap_or(Decimal::ZERO);
                if size.is_zero() {
                    return None;
                }
                Some(PositionSnapshot::new(
                    account.id.clone(),
                    symbol,
                    size,
                    p.entry_price.unwrap_or(Decimal::ZERO),
                ))
            })
            .collect())
    }

    async fn fetch_available_balance(
        &self,
        account: &AccountCredential,
        asset: &str,
    ) -> Result<Decimal, ExchangeError> {
        let balances: Vec<ApiBalance> = self
            .signed_request(account, Method::GET, "/wallet/balances", &[], None)
            .await?;

        let balance = balances
            .iter()
            .find(|b| {
                b.asset_symbol
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(asset))
            })
            .and_then(|b| b.available_balance.or(b.balance))
            .unwrap_or(Decimal::ZERO);

        Ok(balance)
    }

    async fn fetch_recent_fills(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<FillRecord>, ExchangeError> {
        self.signed_request(
            account,
            Method::GET,
            "/fills",
            &[("page_size", FILLS_PAGE_SIZE)],
            None,
        )
        .await
    }
}
