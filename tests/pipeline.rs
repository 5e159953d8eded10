// =============================================================================
// End-to-end pipeline scenarios over the in-memory bus, mock venue, and an
// in-memory SQLite store
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use meridian::bus::EventBus;
use meridian::config::Settings;
use meridian::events::{
    Event, SignalPayload, SignalRisk, EVENT_APPROVED_SIGNAL, EVENT_MARKET_DATA,
    EVENT_REINSTALL_STOP, EVENT_SIGNAL,
};
use meridian::exchange::{mock::MockExchange, ExchangeAdapter};
use meridian::models::{AccountState, OrderStatus};
use meridian::order_ids::make_client_order_id;
use meridian::services::data::DataService;
use meridian::services::execution::ExecutionService;
use meridian::services::reconciliation::ReconciliationService;
use meridian::services::risk::RiskService;
use meridian::services::shutdown_channel;
use meridian::services::strategy::StrategyService;
use meridian::store::TradingStore;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_settings(dry_run: bool) -> Settings {
    let yaml = format!(
        r#"
app:
  environment: test
  dry_run: {dry_run}
database:
  url: "sqlite::memory:"
redis:
  enabled: false
  streams:
    market_data: market_data
    signals: signals
    approved_signals: approved_signals
    orders: orders
    executions: executions
    reconciliations: reconciliations
risk:
  max_risk_per_trade: 0.02
  max_portfolio_heat: 0.06
  max_leverage: 1.5
  placeholder_equity: 100000.0
strategies:
  - name: trend
    enabled: true
    module: strategies.trend
    parameters:
      fast_ma_period: 3
      slow_ma_period: 5
      atr_period: 2
      atr_multiplier: 2.0
reconciliation:
  enabled: true
  interval_seconds: 30
  auto_repair: true
exchanges:
  - name: mockx
    module: mock
    symbols: [BTC/USDT]
"#
    );
    Settings::from_yaml(&yaml).unwrap()
}

async fn test_store() -> TradingStore {
    let settings = test_settings(true);
    TradingStore::connect(&settings.database).await.unwrap()
}

fn mock_adapters(venue: &Arc<MockExchange>) -> HashMap<String, Arc<dyn ExchangeAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    adapters.insert("mockx".to_string(), venue.clone());
    adapters
}

async fn seed_equity(store: &TradingStore, equity: f64) {
    store
        .insert_account_state(&AccountState {
            id: Uuid::new_v4(),
            account_id: "main".into(),
            equity,
            cash: equity,
            buying_power: equity,
            leverage: 1.0,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();
}

fn signal_payload(position_size: f64, stop_distance: f64) -> SignalPayload {
    SignalPayload {
        strategy: "trend".into(),
        exchange: "mockx".into(),
        symbol: "BTC/USDT".into(),
        decision: "buy".into(),
        confidence: 0.6,
        price: 105.0,
        timestamp_ns: Some(1_700_000_000_000_000_000),
        risk: Some(SignalRisk {
            stop_distance: Some(stop_distance),
            position_size: Some(position_size),
        }),
        risk_approved: false,
    }
}

fn market_event(ts_ms: i64, close: f64) -> Event {
    Event::new(
        EVENT_MARKET_DATA,
        json!({
            "exchange": "mockx",
            "symbol": "BTC/USDT",
            "timeframe": "1m",
            "data": [[ts_ms as f64, close, close, close, close, 10.0]],
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )
}

/// Drain every pending event from a stream, advancing a fresh cursor.
async fn drain(bus: &EventBus, stream: &str) -> Vec<Event> {
    let mut events = Vec::new();
    let mut cursor = "0-0".to_string();
    while let Ok((event, id)) = bus.consume(stream, &cursor, 20).await {
        cursor = id;
        events.push(event);
    }
    events
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// One data poll publishes a market_data event per configured symbol, with a
/// tz-aware timestamp.
#[tokio::test]
async fn data_poll_publishes_market_data() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let (_handle, shutdown) = shutdown_channel();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    venue.set_ohlcv(vec![
        [1_700_000_000_000.0, 100.0, 101.0, 99.0, 100.5, 10.0],
        [1_700_000_060_000.0, 100.5, 102.0, 100.0, 101.5, 12.0],
    ]);

    let data = DataService::new(settings, bus.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));
    data.poll_once().await;

    let events = drain(&bus, "market_data").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EVENT_MARKET_DATA);
    assert_eq!(events[0].payload["symbol"], "BTC/USDT");
    assert_eq!(events[0].payload["data"].as_array().unwrap().len(), 2);
    // Timestamps are tz-aware RFC 3339.
    let ts = events[0].payload["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
}

/// Happy path: market ramp -> buy signal -> risk approval -> dry-run order.
#[tokio::test]
async fn happy_path_signal_flows_to_dry_run_order() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    seed_equity(&store, 100_000.0).await;
    let (_handle, shutdown) = shutdown_channel();

    // Strategy: steady +2 ramp produces a buy with ATR(2)=2 -> stop 4.0.
    let mut strategy = StrategyService::new(settings.clone(), bus.clone(), shutdown.clone());
    for i in 0..8 {
        let event = market_event(1_700_000_000_000 + i * 60_000, 100.0 + 2.0 * i as f64);
        strategy.handle_market_event(&event).await;
    }
    let signals = drain(&bus, "signals").await;
    assert!(!signals.is_empty(), "expected at least one signal");
    let signal: SignalPayload = signals.last().unwrap().decode().unwrap();
    assert_eq!(signal.decision, "buy");
    let (stop_distance, position_size) = signal.checked_risk().unwrap();
    assert!((stop_distance - 4.0).abs() < 1e-9);
    assert!((position_size - 500.0).abs() < 1e-9);

    // Risk: approves (heat 2000 <= 6000, leverage 0.005 <= 1.5).
    let risk = RiskService::new(settings.clone(), bus.clone(), store.clone(), shutdown.clone());
    risk.handle_signal(signals.last().unwrap()).await.unwrap();
    let approved = drain(&bus, "approved_signals").await;
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].payload["risk_approved"], true);

    // Execution in dry-run: order row persisted, venue untouched.
    let venue = Arc::new(MockExchange::new("mockx".into()));
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));
    execution.handle_approved_signal(&approved[0]).await;

    let orders = store.list_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::New);
    assert_eq!(orders[0].client_order_id.len(), 24);
    assert!(orders[0]
        .client_order_id
        .chars()
        .all(|c| c.is_ascii_hexdigit()));
    assert_eq!(
        orders[0].raw_response.as_ref().unwrap()["status"],
        "dry_run"
    );
    assert_eq!(venue.order_count(), 0);
    assert!(store.open_positions().await.unwrap().is_empty());

    // The order is also announced for downstream bookkeeping.
    assert_eq!(drain(&bus, "orders").await.len(), 1);
}

/// Heat cap: one position already at the cap; any further risk is rejected.
#[tokio::test]
async fn heat_cap_rejects_next_signal() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    seed_equity(&store, 100_000.0).await;
    // open_risk = 1000 * |50 - 44| = 6000 = max_portfolio_heat * equity.
    store
        .apply_position_fill("BTC/USDT", "mockx", "trend", 1000.0, 50.0, 44.0)
        .await
        .unwrap();
    let (_handle, shutdown) = shutdown_channel();

    let risk = RiskService::new(settings, bus.clone(), store, shutdown);
    let event = Event::from_payload(EVENT_SIGNAL, &signal_payload(500.0, 4.0)).unwrap();
    risk.handle_signal(&event).await.unwrap();

    assert!(drain(&bus, "approved_signals").await.is_empty());
}

/// Leverage cap: notional above max_leverage * equity is rejected.
#[tokio::test]
async fn leverage_cap_rejects_oversized_signal() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    seed_equity(&store, 100_000.0).await;
    let (_handle, shutdown) = shutdown_channel();

    let risk = RiskService::new(settings, bus.clone(), store, shutdown);
    // 200k notional on 100k equity -> leverage 2.0 > 1.5.
    let event = Event::from_payload(EVENT_SIGNAL, &signal_payload(200_000.0, 0.01)).unwrap();
    risk.handle_signal(&event).await.unwrap();

    assert!(drain(&bus, "approved_signals").await.is_empty());
}

/// Signals without risk parameters are dropped before any gate.
#[tokio::test]
async fn missing_risk_payload_is_dropped() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();

    let risk = RiskService::new(settings, bus.clone(), store, shutdown);
    let event = Event::new(
        EVENT_SIGNAL,
        json!({
            "strategy": "trend", "exchange": "mockx", "symbol": "BTC/USDT",
            "decision": "buy", "price": 105.0
        }),
    );
    risk.handle_signal(&event).await.unwrap();

    assert!(drain(&bus, "approved_signals").await.is_empty());
}

/// Live path: entry then mandatory reduce-only stop, position recorded.
#[tokio::test]
async fn live_execution_installs_stop_and_records_position() {
    let settings = test_settings(false);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));

    let mut payload = signal_payload(500.0, 4.0);
    payload.risk_approved = true;
    let event = Event::from_payload(EVENT_APPROVED_SIGNAL, &payload).unwrap();
    execution.handle_approved_signal(&event).await;

    let submissions = venue.submitted_orders();
    assert_eq!(submissions.len(), 2);
    // Entry: limit buy at the signal price.
    assert!(!submissions[0].params.reduce_only);
    assert_eq!(submissions[0].price, Some(105.0));
    // Stop: reduce-only stop-market on the opposite side, entry - stop_distance.
    assert!(submissions[1].params.reduce_only);
    assert_eq!(submissions[1].params.stop_price, Some(101.0));
    assert_eq!(submissions[1].side, submissions[0].side.opposite());
    assert!((submissions[1].amount - 500.0).abs() < 1e-9);

    let orders = store.list_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Pending);

    let positions = store.open_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert!(positions[0].reduce_only_stop_installed);
    assert!((positions[0].stop_price - 101.0).abs() < 1e-9);
    assert!((positions[0].quantity - 500.0).abs() < 1e-9);

    assert_eq!(drain(&bus, "executions").await.len(), 1);
}

/// Stop-install failure: order row stays, no position row; the window is
/// closed later by reconciliation.
#[tokio::test]
async fn stop_install_failure_leaves_order_without_position() {
    let settings = test_settings(false);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    venue.fail_stop_orders(true);
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));

    let event = Event::from_payload(EVENT_APPROVED_SIGNAL, &signal_payload(500.0, 4.0)).unwrap();
    execution.handle_approved_signal(&event).await;

    let orders = store.list_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Pending);
    assert!(store.open_positions().await.unwrap().is_empty());
    // Only the entry reached the venue.
    assert_eq!(venue.order_count(), 1);
}

/// Dry-run isolation: any number of signals, zero venue calls, no positions.
#[tokio::test]
async fn dry_run_never_touches_the_venue() {
    let settings = test_settings(true);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));

    for ts in [1_700_000_000_000_000_000_i64, 1_700_000_060_000_000_000, 1_700_000_120_000_000_000]
    {
        let mut payload = signal_payload(500.0, 4.0);
        payload.timestamp_ns = Some(ts);
        let event = Event::from_payload(EVENT_APPROVED_SIGNAL, &payload).unwrap();
        execution.handle_approved_signal(&event).await;
    }

    assert_eq!(venue.order_count(), 0);
    assert_eq!(store.list_orders().await.unwrap().len(), 3);
    assert!(store.open_positions().await.unwrap().is_empty());
}

/// Idempotent retry: redelivering the same approved signal recomputes the
/// same client order id and changes nothing.
#[tokio::test]
async fn redelivered_signal_is_a_no_op() {
    let settings = test_settings(false);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));

    let event = Event::from_payload(EVENT_APPROVED_SIGNAL, &signal_payload(500.0, 4.0)).unwrap();
    execution.handle_approved_signal(&event).await;
    execution.handle_approved_signal(&event).await;

    let orders = store.list_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    // Entry + stop from the first delivery only.
    assert_eq!(venue.order_count(), 2);
    assert_eq!(
        orders[0].client_order_id,
        make_client_order_id("trend", "BTC/USDT", "buy", 1_700_000_000_000_000_000, 0)
    );

    let positions = store.open_positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert!((positions[0].quantity - 500.0).abs() < 1e-9);
}

/// Reconciliation detects a missing venue stop, requests a repair, and the
/// execution service reinstalls it.
#[tokio::test]
async fn missing_stop_is_repaired_through_the_bus() {
    let settings = test_settings(false);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();

    // Local open position whose venue stop has vanished.
    store
        .apply_position_fill("BTC/USDT", "mockx", "trend", 500.0, 105.0, 101.0)
        .await
        .unwrap();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    venue.set_positions(vec![json!({"symbol": "BTCUSDT", "positionAmt": "500"})]);
    venue.set_open_orders(vec![]); // no stop resting

    let reconciler = ReconciliationService::new(
        settings.clone(),
        bus.clone(),
        store.clone(),
        shutdown.clone(),
    )
    .unwrap()
    .with_adapters(mock_adapters(&venue));
    reconciler.reconcile_once().await.unwrap();

    let repairs = drain(&bus, "reconciliations").await;
    assert_eq!(repairs.len(), 1);
    assert_eq!(repairs[0].event_type, EVENT_REINSTALL_STOP);
    assert_eq!(repairs[0].payload["symbol"], "BTC/USDT");
    assert_eq!(repairs[0].payload["stop_price"], 101.0);

    // Execution service consumes the repair and reinstalls the stop.
    let execution = ExecutionService::new(settings, bus.clone(), store.clone(), shutdown)
        .unwrap()
        .with_adapters(mock_adapters(&venue));
    execution.handle_repair(&repairs[0]).await;

    let submissions = venue.submitted_orders();
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].params.reduce_only);
    assert_eq!(submissions[0].params.stop_price, Some(101.0));
    assert!((submissions[0].amount - 500.0).abs() < 1e-9);
}

/// A healthy venue state produces no repair requests.
#[tokio::test]
async fn covered_position_produces_no_repair() {
    let settings = test_settings(false);
    let bus = EventBus::in_memory();
    let store = test_store().await;
    let (_handle, shutdown) = shutdown_channel();

    store
        .apply_position_fill("BTC/USDT", "mockx", "trend", 500.0, 105.0, 101.0)
        .await
        .unwrap();
    let venue = Arc::new(MockExchange::new("mockx".into()));
    venue.set_positions(vec![json!({"symbol": "BTCUSDT", "positionAmt": "500"})]);
    venue.set_open_orders(vec![json!({"type": "STOP_MARKET", "reduceOnly": true})]);

    let reconciler =
        ReconciliationService::new(settings, bus.clone(), store, shutdown)
            .unwrap()
            .with_adapters(mock_adapters(&venue));
    reconciler.reconcile_once().await.unwrap();

    assert!(drain(&bus, "reconciliations").await.is_empty());
}
