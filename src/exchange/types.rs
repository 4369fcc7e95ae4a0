use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Lenient field decoding
// ---------------------------------------------------------------------------

/// The exchange sends sizes and prices as either JSON numbers or strings,
/// and identifiers as either numbers or strings.
mod lenient {
    use super::*;
    use std::str::FromStr;

    pub fn decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::String(s)) if !s.trim().is_empty() => Decimal::from_str(s.trim()).ok(),
            Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
                .ok()
                .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
            _ => None,
        })
    }

    pub fn string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn boolean<'de, D>(deserializer: D) -> Result<bool, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
    }
}

// ---------------------------------------------------------------------------
// Streaming: outbound frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WsAuthPayload {
    #[serde(rename = "api-key")]
    pub api_key: String,
    pub signature: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsAuthRequest {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub payload: WsAuthPayload,
}

impl WsAuthRequest {
    pub fn new(api_key: &str, signature: String, timestamp: String) -> Self {
        Self {
            msg_type: "auth",
            payload: WsAuthPayload {
                api_key: api_key.to_string(),
                signature,
                timestamp,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WsChannel {
    pub name: String,
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsChannels {
    pub channels: Vec<WsChannel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribe {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub payload: WsChannels,
}

impl WsSubscribe {
    /// Subscribe to one channel for a symbol filter (`["all"]` for every symbol).
    /// Format: {"type":"subscribe","payload":{"channels":[{"name":"orders","symbols":["all"]}]}}
    pub fn channel(name: &str, symbols: &[String]) -> Self {
        Self {
            msg_type: "subscribe",
            payload: WsChannels {
                channels: vec![WsChannel {
                    name: name.to_string(),
                    symbols: symbols.to_vec(),
                }],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming / REST: inbound records
// ---------------------------------------------------------------------------

/// One execution, as delivered by the `fills` channel or `GET /v2/fills`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FillRecord {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub product_symbol: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub reduce_only: bool,
    #[serde(default, deserialize_with = "lenient::string")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub timestamp: Option<String>,
}

impl FillRecord {
    pub fn symbol(&self) -> Option<&str> {
        self.product_symbol.as_deref().or(self.symbol.as_deref())
    }

    pub fn time(&self) -> Option<&str> {
        self.created_at.as_deref().or(self.timestamp.as_deref())
    }
}

/// Order lifecycle update from the `orders` channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OrderUpdate {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub product_symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub unfilled_size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub average_fill_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub limit_price: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::boolean")]
    pub reduce_only: bool,
}

impl OrderUpdate {
    pub fn order_ref(&self) -> Option<&str> {
        self.order_id.as_deref().or(self.id.as_deref())
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref().or(self.product_symbol.as_deref())
    }

    /// Best available execution price: average fill, then order price.
    pub fn fill_price(&self) -> Option<Decimal> {
        self.average_fill_price
            .or(self.price)
            .or(self.limit_price)
    }
}

/// Position record from the `positions` channel or `GET /v2/positions/margined`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PositionRecord {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub product_symbol: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub entry_price: Option<Decimal>,
}

impl PositionRecord {
    pub fn symbol(&self) -> Option<&str> {
        self.product_symbol.as_deref().or(self.symbol.as_deref())
    }
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

/// Every REST response is wrapped as `{"success": bool, "result": ..., "error": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBalance {
    #[serde(default)]
    pub asset_symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub available_balance: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub balance: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub product_symbol: String,
    pub size: Decimal,
    pub side: String,
    pub order_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<String>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOrderRequest {
    pub id: String,
    pub product_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrder {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient::decimal")]
    pub average_fill_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_update_accepts_numbers_and_strings() {
        let json = r#"{
            "type": "orders", "action": "update", "reason": "fill",
            "order_id": 98765, "symbol": "BTCUSD", "side": "buy",
            "size": 10, "unfilled_size": "4", "average_fill_price": "65000.5",
            "reduce_only": "false"
        }"#;
        let update: OrderUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.order_ref(), Some("98765"));
        assert_eq!(update.size, Some(Decimal::from(10)));
        assert_eq!(update.unfilled_size, Some(Decimal::from(4)));
        assert_eq!(update.average_fill_price, Some(Decimal::new(650005, 1)));
        assert!(!update.reduce_only);
    }

    #[test]
    fn fill_record_accepts_symbol_alias() {
        let json = r#"{"id": "f-1", "order_id": "o-1", "symbol": "ETHUSD",
                       "side": "sell", "size": "2", "price": 2800}"#;
        let fill: FillRecord = serde_json::from_str(json).unwrap();
        assert_eq!(fill.symbol(), Some("ETHUSD"));
        assert_eq!(fill.price, Some(Decimal::from(2800)));
    }

    #[test]
    fn subscribe_frame_shape() {
        let sub = WsSubscribe::channel("fills", &["all".to_string()]);
        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["payload"]["channels"][0]["name"], "fills");
        assert_eq!(json["payload"]["channels"][0]["symbols"][0], "all");
    }

    #[test]
    fn auth_frame_uses_dashed_key_field() {
        let auth = WsAuthRequest::new("k", "sig".into(), "1".into());
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["type"], "auth");
        assert_eq!(json["payload"]["api-key"], "k");
    }
}
