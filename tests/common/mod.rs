use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use copybot::engine::{EngineState, RelayConfig, RelayEngine, RelayEvent};
use copybot::exchange::{ExchangeApi, ExchangeError, FillRecord, PlacedOrder};
use copybot::execution::RetryPolicy;
use copybot::models::{AccountCredential, FollowerOrder, PositionSnapshot, Side};

pub const WAIT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub fn credential(id: &str) -> AccountCredential {
    AccountCredential::new(id, format!("{id} account"), format!("{id}-api-key"), format!("{id}-secret"))
}

/// Engine configuration with short delays so tests run fast.
#[allow(dead_code)]
pub fn fast_config(ws_url: &str) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.connector.ws_url = ws_url.to_string();
    config.connector.auth_timeout = Duration::from_secs(2);
    config.connector.max_reconnect_attempts = 3;
    config.connector.reconnect_base_delay = Duration::from_millis(10);
    config.connector.reconnect_max_delay = Duration::from_millis(50);
    config.connector.poll_interval = Duration::from_millis(20);
    config.dispatcher.retry = RetryPolicy {
        max_retries: 2,
        retry_delay: Duration::from_millis(5),
    };
    config.dispatcher.order_timeout = Duration::from_secs(2);
    config
}

/// Wait until the engine reaches `target`.
#[allow(dead_code)]
pub async fn wait_for_state(engine: &RelayEngine, target: EngineState) {
    let mut rx = engine.watch_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("engine never reached {target}, stuck in {}", engine.state()))
        .expect("state channel closed");
}

/// Receive events until one matches `pred`.
#[allow(dead_code)]
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<RelayEvent>, mut pred: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ---------------------------------------------------------------------------
// Scripted exchange
// ---------------------------------------------------------------------------

/// In-memory `ExchangeApi`. Placed orders move the account's position.
#[derive(Default)]
pub struct MockExchange {
    placed: Mutex<Vec<(String, FollowerOrder)>>,
    positions: Mutex<HashMap<String, Vec<PositionSnapshot>>>,
    balances: Mutex<HashMap<String, Decimal>>,
    fills: Mutex<HashMap<String, Vec<FillRecord>>>,
    fail_next: Mutex<HashMap<String, u32>>,
    place_calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_position(&self, account: &str, symbol: &str, size: Decimal, entry: Decimal) {
        let mut positions = self.positions.lock().unwrap();
        let list = positions.entry(account.to_string()).or_default();
        list.retain(|p| p.symbol != symbol);
        if !size.is_zero() {
            list.push(PositionSnapshot::new(account, symbol, size, entry));
        }
    }

    pub fn position(&self, account: &str, symbol: &str) -> Decimal {
        self.positions
            .lock()
            .unwrap()
            .get(account)
            .and_then(|list| list.iter().find(|p| p.symbol == symbol))
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn set_balance(&self, account: &str, balance: Decimal) {
        self.balances.lock().unwrap().insert(account.to_string(), balance);
    }

    /// Newest first, like the exchange.
    pub fn push_fill(&self, account: &str, fill: FillRecord) {
        self.fills
            .lock()
            .unwrap()
            .entry(account.to_string())
            .or_default()
            .insert(0, fill);
    }

    /// Fail the next `n` placements for `account`.
    pub fn fail_next(&self, account: &str, n: u32) {
        self.fail_next.lock().unwrap().insert(account.to_string(), n);
    }

    pub fn placed(&self) -> Vec<(String, FollowerOrder)> {
        self.placed.lock().unwrap().clone()
    }

    pub fn placed_for(&self, account: &str) -> Vec<FollowerOrder> {
        self.placed
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, o)| o.clone())
            .collect()
    }

    pub fn place_calls(&self) -> usize {
        self.place_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_order(
        &self,
        account: &AccountCredential,
        order: &FollowerOrder,
    ) -> Result<PlacedOrder, ExchangeError> {
        let call = self.place_calls.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut failures = self.fail_next.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&account.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ExchangeError::Status {
                        status: 503,
                        message: "service unavailable".into(),
                    });
                }
            }
        }

        let delta = match order.side {
            Side::Buy => order.size,
            Side::Sell => -order.size,
        };
        let current = self.position(&account.id, &order.symbol);
        self.set_position(&account.id, &order.symbol, current + delta, Decimal::ONE);
        self.placed.lock().unwrap().push((account.id.clone(), order.clone()));

        Ok(PlacedOrder {
            order_id: Some(format!("ord-{call}")),
            average_fill_price: None,
        })
    }

    async fn cancel_order(
        &self,
        _account: &AccountCredential,
        _order_id: &str,
        _symbol: &str,
    ) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn fetch_positions(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        Ok(self
            .positions
            .lock()
            .unwrap()
            .get(&account.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_available_balance(
        &self,
        account: &AccountCredential,
        _asset: &str,
    ) -> Result<Decimal, ExchangeError> {
        self.balances
            .lock()
            .unwrap()
            .get(&account.id)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected("no wallet".into()))
    }

    async fn fetch_recent_fills(
        &self,
        account: &AccountCredential,
    ) -> Result<Vec<FillRecord>, ExchangeError> {
        Ok(self
            .fills
            .lock()
            .unwrap()
            .get(&account.id)
            .cloned()
            .unwrap_or_default())
    }
}

#[allow(dead_code)]
pub fn fill_record(id: &str, symbol: &str, side: &str, size: Decimal, price: Decimal) -> FillRecord {
    FillRecord {
        id: Some(id.to_string()),
        order_id: Some(format!("order-{id}")),
        product_symbol: Some(symbol.to_string()),
        side: Some(side.to_string()),
        size: Some(size),
        price: Some(price),
        ..FillRecord::default()
    }
}

#[allow(dead_code)]
pub fn fill_frame(id: &str, symbol: &str, side: &str, size: &str, price: &str) -> Value {
    json!({
        "type": "fills",
        "id": id,
        "order_id": format!("order-{id}"),
        "product_symbol": symbol,
        "side": side,
        "size": size,
        "price": price,
    })
}

#[allow(dead_code)]
pub fn position_frame(symbol: &str, size: &str) -> Value {
    json!({
        "type": "positions",
        "action": "update",
        "product_symbol": symbol,
        "size": size,
        "entry_price": "100",
    })
}

// ---------------------------------------------------------------------------
// Mock WebSocket server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum ServerCommand {
    Frame(String),
    DropConnections,
}

/// Local exchange socket: answers auth frames, records everything the
/// client sends and pushes frames on demand.
#[allow(dead_code)]
pub struct MockWsServer {
    pub url: String,
    commands: broadcast::Sender<ServerCommand>,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    reject_auth: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

#[allow(dead_code)]
impl MockWsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (commands, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let reject_auth = Arc::new(AtomicBool::new(false));

        let accept_task = {
            let commands = commands.clone();
            let connections = Arc::clone(&connections);
            let received = Arc::clone(&received);
            let reject_auth = Arc::clone(&reject_auth);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        stream,
                        commands.subscribe(),
                        Arc::clone(&received),
                        Arc::clone(&reject_auth),
                    ));
                }
            })
        };

        Self {
            url,
            commands,
            connections,
            received,
            reject_auth,
            accept_task,
        }
    }

    pub fn push(&self, frame: Value) {
        let _ = self.commands.send(ServerCommand::Frame(frame.to_string()));
    }

    /// Drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::DropConnections);
    }

    /// Stop accepting and drop open connections; later connects are refused.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }

    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

async fn serve_connection(
    stream: TcpStream,
    mut commands: broadcast::Receiver<ServerCommand>,
    received: Arc<Mutex<Vec<Value>>>,
    reject_auth: Arc<AtomicBool>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
                    let is_auth = value["type"] == "auth";
                    received.lock().unwrap().push(value);
                    if is_auth {
                        let reply = if reject_auth.load(Ordering::SeqCst) {
                            json!({ "type": "error", "message": "invalid api key" })
                        } else {
                            json!({ "type": "success", "message": "Authenticated" })
                        };
                        if write.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(ServerCommand::Frame(text)) => {
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(ServerCommand::DropConnections) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(_)) => {}
            },
        }
    }
}
