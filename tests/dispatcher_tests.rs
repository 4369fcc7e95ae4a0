mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};

use copybot::engine::{RelayState, RelayStats, Reporter, SharedState};
use copybot::execution::{CloseRequest, CopyMode, Dispatcher, DispatcherConfig, RetryPolicy};
use copybot::models::{
    ExecutionKind, ExecutionRecord, ExecutionStatus, FollowerLink, OrderType, PositionEffect,
    PositionSnapshot, Side, SignalSource, TradeSignal,
};

use common::{credential, MockExchange, WAIT};

const LEADER: &str = "leader";

struct Harness {
    exchange: Arc<MockExchange>,
    state: SharedState,
    dispatcher: Dispatcher,
    records: mpsc::Receiver<ExecutionRecord>,
}

fn harness(config: DispatcherConfig) -> Harness {
    let exchange = MockExchange::new();
    let state = RelayState::new(LEADER, 1_000).shared();
    let (events, _) = broadcast::channel(64);
    let (sink, records) = mpsc::channel(64);
    let reporter = Reporter::new(LEADER, events, Some(sink), Arc::new(RelayStats::default()));
    let dispatcher = Dispatcher::new(&config, exchange.clone(), Arc::clone(&state), reporter);
    Harness {
        exchange,
        state,
        dispatcher,
        records,
    }
}

fn fast_dispatcher() -> DispatcherConfig {
    DispatcherConfig {
        retry: RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
        },
        ..DispatcherConfig::default()
    }
}

fn signal(id: &str, symbol: &str, side: Side, size: Decimal, price: Decimal) -> TradeSignal {
    TradeSignal {
        signal_id: id.to_string(),
        account_id: LEADER.to_string(),
        symbol: symbol.to_string(),
        side,
        size,
        price,
        reduce_only: false,
        effect: PositionEffect::Open,
        source: SignalSource::Fill,
        observed_at: Utc::now(),
    }
}

fn link(follower: &str, mode: CopyMode) -> FollowerLink {
    FollowerLink::new(credential(follower), LEADER, mode)
}

async fn collect(records: &mut mpsc::Receiver<ExecutionRecord>, n: usize) -> Vec<ExecutionRecord> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let record = tokio::time::timeout(WAIT, records.recv())
            .await
            .expect("timed out waiting for execution record")
            .expect("record channel closed");
        out.push(record);
    }
    out.sort_by(|a, b| a.follower_id.cmp(&b.follower_id));
    out
}

#[tokio::test]
async fn eth_buy_is_mirrored_to_both_followers() {
    let mut h = harness(fast_dispatcher());
    let links = vec![
        link("follower-a", CopyMode::Multiplier(Decimal::new(5, 1))),
        link("follower-b", CopyMode::FixedLot(Decimal::ONE)),
    ];

    let sig = signal("fill:eth-1", "ETHUSD", Side::Buy, Decimal::from(2), Decimal::from(2800));
    assert_eq!(h.dispatcher.dispatch(&sig, &links).await, 2);

    let records = collect(&mut h.records, 2).await;
    for record in &records {
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.side, Some(Side::Buy));
        assert_eq!(record.size, Some(Decimal::ONE));
        assert_eq!(record.order_type, Some(OrderType::Market));
        assert_eq!(record.signal_id, "fill:eth-1");
    }

    let placed = h.exchange.placed();
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|(_, o)| o.symbol == "ETHUSD" && o.size == Decimal::ONE));
}

#[tokio::test]
async fn every_follower_gets_exactly_one_record() {
    let mut h = harness(fast_dispatcher());
    // follower-b already holds BTCUSD, so its entry is refused
    h.state.lock().await.tracker.seed(
        "follower-b",
        vec![PositionSnapshot::new("follower-b", "BTCUSD", Decimal::ONE, Decimal::from(60_000))],
    );
    let links = vec![
        link("follower-a", CopyMode::FixedLot(Decimal::ONE)),
        link("follower-b", CopyMode::FixedLot(Decimal::ONE)),
        link("follower-c", CopyMode::Multiplier(Decimal::from(2))),
    ];

    let sig = signal("fill:btc-1", "BTCUSD", Side::Buy, Decimal::new(5, 1), Decimal::from(61_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 3).await;
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[1].status, ExecutionStatus::Skipped);
    assert_eq!(records[1].reason.as_deref(), Some("symbol_already_held"));
    assert_eq!(records[2].status, ExecutionStatus::Success);
    assert_eq!(records[2].size, Some(Decimal::ONE));

    // The guardrail never reached the exchange
    assert!(h.exchange.placed_for("follower-b").is_empty());
    assert_eq!(h.exchange.place_calls(), 2);
}

#[tokio::test]
async fn same_signal_is_dispatched_once_per_follower() {
    let mut h = harness(fast_dispatcher());
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::ONE))];
    let sig = signal("fill:dup", "BTCUSD", Side::Buy, Decimal::ONE, Decimal::from(60_000));

    assert_eq!(h.dispatcher.dispatch(&sig, &links).await, 1);
    assert_eq!(h.dispatcher.dispatch(&sig, &links).await, 0);

    collect(&mut h.records, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.records.try_recv().is_err());
    assert_eq!(h.exchange.placed().len(), 1);
}

#[tokio::test]
async fn follower_orders_keep_arrival_order_under_retry() {
    let mut h = harness(fast_dispatcher());
    h.exchange.fail_next("follower-a", 1);
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::new(1, 1)))];

    let symbols = ["BTCUSD", "ETHUSD", "SOLUSD"];
    for (i, symbol) in symbols.iter().enumerate() {
        let sig = signal(&format!("fill:{i}"), symbol, Side::Buy, Decimal::ONE, Decimal::from(100));
        h.dispatcher.dispatch(&sig, &links).await;
    }

    let records = collect(&mut h.records, 3).await;
    assert!(records.iter().all(|r| r.status == ExecutionStatus::Success));

    let placed: Vec<String> = h
        .exchange
        .placed_for("follower-a")
        .into_iter()
        .map(|o| o.symbol)
        .collect();
    assert_eq!(placed, vec!["BTCUSD", "ETHUSD", "SOLUSD"]);

    let first = records.iter().find(|r| r.signal_id == "fill:0").unwrap();
    assert_eq!(first.attempts, 2);
}

#[tokio::test]
async fn exhausted_retries_produce_a_failed_record() {
    let mut h = harness(fast_dispatcher());
    h.exchange.fail_next("follower-a", 10);
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::ONE))];

    let sig = signal("fill:fail", "BTCUSD", Side::Buy, Decimal::ONE, Decimal::from(60_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(records[0].attempts, 3);
    assert!(records[0].reason.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(h.exchange.place_calls(), 3);
}

#[tokio::test]
async fn one_failing_follower_does_not_block_others() {
    let mut h = harness(fast_dispatcher());
    h.exchange.fail_next("follower-a", 10);
    let links = vec![
        link("follower-a", CopyMode::FixedLot(Decimal::ONE)),
        link("follower-b", CopyMode::FixedLot(Decimal::ONE)),
    ];

    let sig = signal("fill:iso", "BTCUSD", Side::Sell, Decimal::ONE, Decimal::from(60_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 2).await;
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert_eq!(records[1].status, ExecutionStatus::Success);
    assert_eq!(records[1].side, Some(Side::Sell));
}

#[tokio::test]
async fn close_is_sized_to_each_followers_own_position() {
    let mut h = harness(fast_dispatcher());
    h.exchange.set_position("follower-a", "BTCUSD", Decimal::from(2), Decimal::from(60_000));
    h.exchange.set_position("follower-b", "BTCUSD", Decimal::new(-5, 1), Decimal::from(60_000));
    let links = vec![
        link("follower-a", CopyMode::FixedLot(Decimal::ONE)),
        link("follower-b", CopyMode::FixedLot(Decimal::ONE)),
        link("follower-c", CopyMode::FixedLot(Decimal::ONE)),
    ];

    let request = CloseRequest {
        close_id: "close:leader:BTCUSD:1".into(),
        symbol: "BTCUSD".into(),
        previous_size: Decimal::from(5),
    };
    assert_eq!(h.dispatcher.dispatch_close(&request, &links).await, 3);

    let records = collect(&mut h.records, 3).await;
    assert!(records.iter().all(|r| r.kind == ExecutionKind::Close));

    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].side, Some(Side::Sell));
    assert_eq!(records[0].size, Some(Decimal::from(2)));
    assert!(records[0].reduce_only);

    assert_eq!(records[1].status, ExecutionStatus::Success);
    assert_eq!(records[1].side, Some(Side::Buy));
    assert_eq!(records[1].size, Some(Decimal::new(5, 1)));

    // Nothing to flatten
    assert_eq!(records[2].status, ExecutionStatus::Skipped);

    assert!(h.exchange.position("follower-a", "BTCUSD").is_zero());
    assert!(h.exchange.position("follower-b", "BTCUSD").is_zero());
}

#[tokio::test]
async fn links_opted_out_of_closes_are_left_alone() {
    let mut h = harness(fast_dispatcher());
    h.exchange.set_position("follower-a", "BTCUSD", Decimal::ONE, Decimal::from(60_000));
    let mut opted_out = link("follower-a", CopyMode::FixedLot(Decimal::ONE));
    opted_out.copy_position_close = false;

    let request = CloseRequest {
        close_id: "close:leader:BTCUSD:2".into(),
        symbol: "BTCUSD".into(),
        previous_size: Decimal::ONE,
    };
    assert_eq!(h.dispatcher.dispatch_close(&request, &[opted_out]).await, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.records.try_recv().is_err());
    assert_eq!(h.exchange.position("follower-a", "BTCUSD"), Decimal::ONE);
}

#[tokio::test]
async fn balance_modes_fail_cleanly_without_a_wallet() {
    let mut h = harness(fast_dispatcher());
    let links = vec![link("follower-a", CopyMode::PercentageBalance(Decimal::from(10)))];

    let sig = signal("fill:bal", "BTCUSD", Side::Buy, Decimal::ONE, Decimal::from(50_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert!(records[0].reason.as_deref().unwrap_or_default().contains("balance"));
    assert_eq!(h.exchange.place_calls(), 0);
}

#[tokio::test]
async fn percentage_balance_sizes_from_the_wallet() {
    let mut h = harness(fast_dispatcher());
    h.exchange.set_balance("follower-a", Decimal::from(10_000));
    let links = vec![link("follower-a", CopyMode::PercentageBalance(Decimal::from(10)))];

    // 10% of 10_000 at 2_000 per unit
    let sig = signal("fill:pct", "ETHUSD", Side::Buy, Decimal::from(3), Decimal::from(2_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].size, Some(Decimal::new(5, 1)));
}

#[tokio::test]
async fn fixed_risk_sizes_from_the_amount_alone() {
    let mut h = harness(fast_dispatcher());
    let links = vec![link("follower-a", CopyMode::FixedRisk(Decimal::from(100)))];

    // No wallet configured: 100 at 50 per unit
    let sig = signal("fill:risk", "SOLUSD", Side::Buy, Decimal::from(7), Decimal::from(50));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].size, Some(Decimal::from(2)));
    assert_eq!(h.exchange.position("follower-a", "SOLUSD"), Decimal::from(2));
}

#[tokio::test]
async fn leader_reduction_is_skipped_for_a_flat_follower() {
    let mut h = harness(fast_dispatcher());
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::ONE))];

    let mut sig = signal("fill:trim", "BTCUSD", Side::Sell, Decimal::ONE, Decimal::from(60_000));
    sig.effect = PositionEffect::Reduce;
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Skipped);
    assert_eq!(records[0].reason.as_deref(), Some("no_position_to_reduce"));
    assert_eq!(h.exchange.place_calls(), 0);
}

#[tokio::test]
async fn dry_run_reports_success_without_placing() {
    let mut h = harness(DispatcherConfig {
        dry_run: true,
        ..fast_dispatcher()
    });
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::ONE))];

    let sig = signal("fill:dry", "BTCUSD", Side::Buy, Decimal::ONE, Decimal::from(60_000));
    h.dispatcher.dispatch(&sig, &links).await;

    let records = collect(&mut h.records, 1).await;
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(h.exchange.place_calls(), 0);
}

#[tokio::test]
async fn shutdown_drains_the_queue_depth() {
    let mut h = harness(fast_dispatcher());
    let links = vec![link("follower-a", CopyMode::FixedLot(Decimal::ONE))];
    let sig = signal("fill:sd", "BTCUSD", Side::Buy, Decimal::ONE, Decimal::from(60_000));
    h.dispatcher.dispatch(&sig, &links).await;
    collect(&mut h.records, 1).await;

    h.dispatcher.shutdown().await;
    assert_eq!(h.dispatcher.queue_depth(), 0);
}
