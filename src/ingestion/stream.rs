use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::exchange::signer::{unix_timestamp, RequestSigner};
use crate::exchange::types::{WsAuthRequest, WsSubscribe};
use crate::exchange::{FillRecord, OrderUpdate, PositionRecord};
use crate::models::AccountCredential;

use super::connector::{
    reconnect_delay, shutdown_signal, ConnectionStatus, ConnectorConfig, ConnectorError,
    ConnectorEvent, LeaderConnector, RawMessage,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Private channels every session subscribes to.
const CHANNELS: [&str; 3] = ["orders", "positions", "fills"];

/// How a session that got past authentication ended.
enum SessionEnd {
    Closed(String),
    /// The event receiver is gone; nobody is listening any more.
    ReceiverGone,
}

/// Parsed inbound frame.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    Authenticated,
    Error(String),
    Orders(Vec<OrderUpdate>),
    Fills(Vec<FillRecord>),
    Positions(Vec<PositionRecord>),
    /// Full position list, sent on subscribe and after every reconnect.
    PositionSnapshot(Vec<PositionRecord>),
    /// Subscription acks, heartbeats and other frames with no trading content.
    Control(String),
    Unknown(String),
}

/// Route a text frame by its `type` field.
pub(crate) fn parse_frame(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let msg_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let frame = match msg_type.as_str() {
        "success" => {
            let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
            if message.eq_ignore_ascii_case("authenticated") {
                InboundFrame::Authenticated
            } else {
                InboundFrame::Control(msg_type)
            }
        }
        "error" => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            InboundFrame::Error(message)
        }
        "orders" => InboundFrame::Orders(records(value)?),
        "fills" | "v2/fills" | "user_trades" | "v2/user_trades" => {
            InboundFrame::Fills(records(value)?)
        }
        "positions" => {
            let snapshot = value.get("action").and_then(Value::as_str) == Some("snapshot");
            let mut positions: Vec<PositionRecord> = records(value)?;
            for p in positions.iter_mut() {
                if p.action.as_deref() == Some("delete") {
                    p.size = Some(Decimal::ZERO);
                }
            }
            if snapshot {
                InboundFrame::PositionSnapshot(positions)
            } else {
                InboundFrame::Positions(positions)
            }
        }
        "subscriptions" | "heartbeat" | "pong" | "auth" | "unsubscribe" => {
            InboundFrame::Control(msg_type)
        }
        _ => InboundFrame::Unknown(msg_type),
    };
    Ok(frame)
}

/// A frame either carries its records in a `result` array (snapshots) or is
/// itself a single record.
fn records<T: serde::de::DeserializeOwned>(mut value: Value) -> Result<Vec<T>, serde_json::Error> {
    let action = value.get("action").cloned();
    match value.get_mut("result").map(Value::take) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|mut item| {
                if let (Some(action), Some(obj)) = (&action, item.as_object_mut()) {
                    obj.entry("action").or_insert_with(|| action.clone());
                }
                serde_json::from_value(item)
            })
            .collect(),
        _ => Ok(vec![serde_json::from_value(value)?]),
    }
}

/// Authenticated WebSocket subscription to one account's private channels.
pub struct StreamConnector {
    config: ConnectorConfig,
}

impl StreamConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    /// One connection lifetime. Errors are returned only for failures before
    /// authentication completed.
    async fn run_session(
        &self,
        credential: &AccountCredential,
        tx: &mpsc::Sender<ConnectorEvent>,
        status: &ConnectionStatus,
    ) -> Result<SessionEnd, ConnectorError> {
        tracing::info!(url = %self.config.ws_url, account = %credential.id, "Connecting to exchange WebSocket...");

        let (ws_stream, _response) = connect_async(self.config.ws_url.as_str())
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;
        status.set_connected(true);
        if tx.send(ConnectorEvent::Connected).await.is_err() {
            return Ok(SessionEnd::ReceiverGone);
        }

        let (mut write, mut read) = ws_stream.split();

        // Authenticate
        let ts = unix_timestamp();
        let signer = RequestSigner::new(credential);
        let signature = signer
            .sign_ws_challenge(&ts)
            .map_err(|e| ConnectorError::Auth(e.to_string()))?;
        let auth = serde_json::to_string(&WsAuthRequest::new(signer.api_key(), signature, ts))
            .map_err(|e| ConnectorError::Auth(e.to_string()))?;
        write
            .send(Message::Text(auth.into()))
            .await
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        match timeout(self.config.auth_timeout, await_auth(&mut read, &mut write)).await {
            Err(_) => return Err(ConnectorError::AuthTimeout(self.config.auth_timeout)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }
        status.set_authenticated(true);
        tracing::info!(account = %credential.id, "WebSocket authenticated");

        for channel in CHANNELS {
            let sub = WsSubscribe::channel(channel, &self.config.symbols);
            let msg = serde_json::to_string(&sub)
                .map_err(|e| ConnectorError::Transport(e.to_string()))?;
            if let Err(e) = write.send(Message::Text(msg.into())).await {
                return Ok(SessionEnd::Closed(format!("subscribe failed: {e}")));
            }
        }
        status.set_subscribed(true);
        tracing::info!(
            account = %credential.id,
            channels = ?CHANNELS,
            symbols = ?self.config.symbols,
            "Subscribed to private channels"
        );

        if tx.send(ConnectorEvent::Authenticated).await.is_err() {
            return Ok(SessionEnd::ReceiverGone);
        }

        let mut ping_timer = interval(self.config.heartbeat_interval);
        ping_timer.tick().await; // consume the first immediate tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !route_frame(text.as_ref(), tx).await {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return Ok(SessionEnd::Closed(format!("failed to send pong: {e}")));
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            return Ok(SessionEnd::Closed("server sent close frame".into()));
                        }
                        Some(Ok(_)) => {} // Binary, Pong, Frame
                        Some(Err(e)) => {
                            return Ok(SessionEnd::Closed(format!("read error: {e}")));
                        }
                        None => {
                            return Ok(SessionEnd::Closed("stream ended".into()));
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                        return Ok(SessionEnd::Closed(format!("failed to send ping: {e}")));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LeaderConnector for StreamConnector {
    fn kind(&self) -> &'static str {
        "stream"
    }

    async fn run(
        &self,
        credential: AccountCredential,
        tx: mpsc::Sender<ConnectorEvent>,
        status: Arc<ConnectionStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut attempt: u32 = 0;

        loop {
            status.reset();
            let outcome = tokio::select! {
                res = self.run_session(&credential, &tx, &status) => res,
                _ = shutdown_signal(&mut shutdown) => {
                    status.reset();
                    tracing::info!(account = %credential.id, "WebSocket connector shut down");
                    return Ok(());
                }
            };
            status.reset();

            let (reason, auth_failure) = match outcome {
                Ok(SessionEnd::ReceiverGone) => return Ok(()),
                Ok(SessionEnd::Closed(reason)) => {
                    // The session was healthy, so the budget starts over.
                    attempt = 0;
                    tracing::warn!(account = %credential.id, reason = %reason, "WebSocket disconnected");
                    (reason, false)
                }
                Err(e) => {
                    let auth_failure = matches!(e, ConnectorError::Auth(_) | ConnectorError::AuthTimeout(_));
                    if auth_failure {
                        counter!("auth_failures_total").increment(1);
                    }
                    tracing::error!(account = %credential.id, error = %e, "WebSocket session failed");
                    (e.to_string(), auth_failure)
                }
            };

            if tx
                .send(ConnectorEvent::Disconnected { reason, auth_failure })
                .await
                .is_err()
            {
                return Ok(());
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                let attempts = self.config.max_reconnect_attempts;
                tracing::error!(account = %credential.id, attempts, "Reconnect attempts exhausted");
                let _ = tx.send(ConnectorEvent::Exhausted { attempts }).await;
                return Err(ConnectorError::ConnectionExhausted { attempts });
            }

            let delay = reconnect_delay(
                self.config.reconnect_base_delay,
                self.config.reconnect_max_delay,
                attempt - 1,
            );
            counter!("connector_reconnects_total").increment(1);
            tracing::info!(account = %credential.id, delay_ms = delay.as_millis() as u64, attempt, "Reconnecting...");
            if tx
                .send(ConnectorEvent::Reconnecting { attempt, delay })
                .await
                .is_err()
            {
                return Ok(());
            }

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_signal(&mut shutdown) => return Ok(()),
            }
        }
    }
}

/// Read frames until the server confirms authentication.
async fn await_auth(read: &mut WsRead, write: &mut WsWrite) -> Result<(), ConnectorError> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_frame(text.as_ref()) {
                Ok(InboundFrame::Authenticated) => return Ok(()),
                Ok(InboundFrame::Error(message)) => return Err(ConnectorError::Auth(message)),
                Ok(other) => {
                    tracing::trace!(frame = ?other, "Frame ignored while authenticating");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Unparseable frame while authenticating");
                }
            },
            Some(Ok(Message::Ping(data))) => {
                write
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| ConnectorError::Transport(e.to_string()))?;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnectorError::Transport(
                    "connection closed during authentication".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ConnectorError::Transport(e.to_string())),
        }
    }
}

/// Forward the trading content of one frame. Returns `false` once the
/// receiving side is gone.
async fn route_frame(text: &str, tx: &mpsc::Sender<ConnectorEvent>) -> bool {
    let messages: Vec<RawMessage> = match parse_frame(text) {
        Ok(InboundFrame::Orders(orders)) => orders.into_iter().map(RawMessage::Order).collect(),
        Ok(InboundFrame::Fills(fills)) => fills.into_iter().map(RawMessage::Fill).collect(),
        Ok(InboundFrame::Positions(positions)) => {
            positions.into_iter().map(RawMessage::Position).collect()
        }
        Ok(InboundFrame::Error(message)) => {
            tracing::warn!(message = %message, "Exchange sent error frame");
            Vec::new()
        }
        Ok(InboundFrame::PositionSnapshot(positions)) => vec![RawMessage::PositionSnapshot(positions)],
        Ok(InboundFrame::Control(msg_type)) => {
            tracing::trace!(msg_type = %msg_type, "Control frame");
            Vec::new()
        }
        Ok(InboundFrame::Authenticated) => Vec::new(),
        Ok(InboundFrame::Unknown(msg_type)) => {
            tracing::debug!(msg_type = %msg_type, "Dropping frame of unknown type");
            Vec::new()
        }
        Err(e) => {
            tracing::debug!(error = %e, raw = %text, "Dropping unparseable frame");
            Vec::new()
        }
    };

    for message in messages {
        if tx.send(ConnectorEvent::Message(message)).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_success() {
        let frame = parse_frame(r#"{"type":"success","message":"Authenticated"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Authenticated));
    }

    #[test]
    fn parses_error_frame() {
        let frame = parse_frame(r#"{"type":"error","message":"Invalid signature"}"#).unwrap();
        match frame {
            InboundFrame::Error(m) => assert_eq!(m, "Invalid signature"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn splits_fill_snapshot_into_records() {
        let text = r#"{"type":"fills","action":"snapshot","result":[
            {"id":"1","order_id":"a","product_symbol":"BTCUSD","side":"buy","size":"1","price":"100"},
            {"id":"2","order_id":"a","product_symbol":"BTCUSD","side":"buy","size":"2","price":"101"}
        ]}"#;
        match parse_frame(text).unwrap() {
            InboundFrame::Fills(fills) => {
                assert_eq!(fills.len(), 2);
                assert_eq!(fills[1].id.as_deref(), Some("2"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn position_delete_means_flat() {
        let text = r#"{"type":"positions","action":"delete","product_symbol":"ETHUSD","size":"3","entry_price":"2800"}"#;
        match parse_frame(text).unwrap() {
            InboundFrame::Positions(p) => {
                assert_eq!(p.len(), 1);
                assert_eq!(p[0].size, Some(Decimal::ZERO));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn position_snapshot_stays_whole() {
        let text = r#"{"type":"positions","action":"snapshot","result":[
            {"product_symbol":"BTCUSD","size":"1","entry_price":"100"},
            {"product_symbol":"ETHUSD","size":"-2","entry_price":"2800"}
        ]}"#;
        match parse_frame(text).unwrap() {
            InboundFrame::PositionSnapshot(p) => {
                assert_eq!(p.len(), 2);
                assert_eq!(p[0].action.as_deref(), Some("snapshot"));
                assert_eq!(p[1].symbol(), Some("ETHUSD"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn empty_position_snapshot_means_all_flat() {
        let text = r#"{"type":"positions","action":"snapshot","result":[]}"#;
        assert!(matches!(parse_frame(text).unwrap(), InboundFrame::PositionSnapshot(p) if p.is_empty()));
    }

    #[test]
    fn unknown_type_is_reported_not_failed() {
        let frame = parse_frame(r#"{"type":"v2/ticker","symbol":"BTCUSD"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Unknown(t) if t == "v2/ticker"));
    }

    #[test]
    fn subscription_ack_is_control() {
        let frame = parse_frame(r#"{"type":"subscriptions","channels":[]}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Control(t) if t == "subscriptions"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(parse_frame("not json").is_err());
    }
}
