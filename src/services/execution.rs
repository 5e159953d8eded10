// =============================================================================
// ExecutionService — idempotent order submission with mandatory stops
// =============================================================================
//
// Per approved signal:
//
//   received -> validate -> [dry_run] -> record(NEW)
//            \-> submit entry -> record(PENDING) -> install stop -> update
//                position
//
// The client order id is derived from the signal's own fields, so a
// redelivered event recomputes the same id; the store's uniqueness check and
// the venue's client-id collision handling together make the handler
// idempotent. A failed stop installation never rolls back the order row:
// the reconciler detects the uncovered position and requests a repair
// through the reconciliations stream, which this service also consumes.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, EventBus};
use crate::config::Settings;
use crate::events::{
    Event, ReinstallStopPayload, SignalPayload, EVENT_EXECUTION, EVENT_ORDER,
};
use crate::exchange::{build_adapters, ExchangeAdapter, OrderParams, OrderRequest};
use crate::models::{Order, OrderSide, OrderStatus, OrderType};
use crate::order_ids::make_client_order_id;
use crate::services::Shutdown;
use crate::store::TradingStore;
use uuid::Uuid;

/// Nonce for a signal's entry order.
const ENTRY_NONCE: u32 = 0;
/// Nonce for the protective stop paired with that entry.
const STOP_NONCE: u32 = 1;

/// Per-stream blocking window; two streams are interleaved in one loop, so
/// each gets half the usual tick.
const FAN_IN_BLOCK_MS: u64 = 500;

pub struct ExecutionService {
    settings: Settings,
    bus: EventBus,
    store: TradingStore,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    shutdown: Shutdown,
    signals_cursor: String,
    repairs_cursor: String,
}

impl ExecutionService {
    pub fn new(
        settings: Settings,
        bus: EventBus,
        store: TradingStore,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let adapters = build_adapters(&settings.exchanges)?;
        Ok(Self {
            settings,
            bus,
            store,
            adapters,
            shutdown,
            signals_cursor: "0-0".to_string(),
            repairs_cursor: "0-0".to_string(),
        })
    }

    /// Test hook: swap in pre-built adapters (mock venues).
    pub fn with_adapters(mut self, adapters: HashMap<String, Arc<dyn ExchangeAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(dry_run = self.settings.app.dry_run, "execution service started");
        let approved_stream = self.settings.redis.streams.approved_signals.clone();
        let repair_stream = self.settings.redis.streams.reconciliations.clone();

        while !self.shutdown.is_stopping() {
            // Fan-in over two cursors: approved signals first, then repair
            // requests. Each stream keeps FIFO order against its own cursor.
            let consumed = self
                .bus
                .consume(&approved_stream, &self.signals_cursor, FAN_IN_BLOCK_MS)
                .await;
            match consumed {
                Ok((event, message_id)) => {
                    self.signals_cursor = message_id;
                    self.handle_approved_signal(&event).await;
                }
                Err(BusError::Timeout) => {}
                Err(e) => {
                    warn!(error = %e, "approved signal consume failed; retrying");
                    self.shutdown.sleep(std::time::Duration::from_millis(500)).await;
                }
            }
            let consumed = self
                .bus
                .consume(&repair_stream, &self.repairs_cursor, FAN_IN_BLOCK_MS)
                .await;
            match consumed {
                Ok((event, message_id)) => {
                    self.repairs_cursor = message_id;
                    self.handle_repair(&event).await;
                }
                Err(BusError::Timeout) => {}
                Err(e) => {
                    warn!(error = %e, "repair consume failed; retrying");
                    self.shutdown.sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }

        for adapter in self.adapters.values() {
            let _ = adapter.close().await;
        }
        info!("execution service stopped");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Approved signals
    // -------------------------------------------------------------------------

    pub async fn handle_approved_signal(&self, event: &Event) {
        let signal: SignalPayload = match event.decode() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "undecodable approved signal dropped");
                return;
            }
        };
        let Some(adapter) = self.adapters.get(&signal.exchange) else {
            error!(exchange = %signal.exchange, "unknown exchange; signal dropped");
            return;
        };
        let Some((stop_distance, position_size)) = signal.checked_risk() else {
            error!(
                strategy = %signal.strategy,
                symbol = %signal.symbol,
                "approved signal missing risk parameters; dropped"
            );
            return;
        };
        let Some(side) = OrderSide::parse(&signal.decision) else {
            error!(decision = %signal.decision, "unknown decision; signal dropped");
            return;
        };

        let timestamp_ns = signal
            .timestamp_ns
            .unwrap_or_else(|| Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let client_order_id = make_client_order_id(
            &signal.strategy,
            &signal.symbol,
            side.as_str(),
            timestamp_ns,
            ENTRY_NONCE,
        );

        // Redelivery guard: an existing row means a previous delivery of this
        // event already ran.
        match self.store.order_exists(&client_order_id).await {
            Ok(true) => {
                debug!(client_order_id, "duplicate delivery; already recorded");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "order lookup failed; signal dropped");
                return;
            }
        }

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            order_type: OrderType::Limit,
            side,
            amount: position_size,
            price: Some(signal.price),
            params: OrderParams {
                client_order_id: client_order_id.clone(),
                reduce_only: false,
                stop_price: None,
                time_in_force: Some("GTC".to_string()),
            },
        };

        if self.settings.app.dry_run {
            info!(client_order_id, symbol = %signal.symbol, "dry run: order recorded, not submitted");
            if let Err(e) = self
                .record_order(
                    &signal,
                    &request,
                    OrderStatus::New,
                    json!({"status": "dry_run"}),
                    None,
                )
                .await
            {
                error!(error = %e, "failed to record dry-run order");
            }
            return;
        }

        match adapter.create_order(&request).await {
            Ok(response) => {
                let external_id = response["orderId"].as_u64().map(|id| id.to_string());
                if let Err(e) = self
                    .record_order(
                        &signal,
                        &request,
                        OrderStatus::Pending,
                        response.clone(),
                        external_id,
                    )
                    .await
                {
                    error!(error = %e, client_order_id, "failed to record submitted order");
                }
                self.publish_execution(&signal, &client_order_id, &response)
                    .await;
                self.install_stop(
                    adapter.as_ref(),
                    &signal,
                    side,
                    stop_distance,
                    position_size,
                    timestamp_ns,
                )
                .await;
            }
            Err(e) => {
                // No rollback of anything persisted; the reconciler audits
                // whatever state the venue ended up in.
                error!(
                    exchange = %signal.exchange,
                    symbol = %signal.symbol,
                    client_order_id,
                    error = %e,
                    "entry order submission failed"
                );
            }
        }
    }

    /// Install the mandatory reduce-only stop after a successful entry and
    /// bring the position row up to date.
    async fn install_stop(
        &self,
        adapter: &dyn ExchangeAdapter,
        signal: &SignalPayload,
        side: OrderSide,
        stop_distance: f64,
        position_size: f64,
        timestamp_ns: i64,
    ) {
        let stop_side = side.opposite();
        let stop_price = match side {
            OrderSide::Buy => signal.price - stop_distance,
            OrderSide::Sell => signal.price + stop_distance,
        };
        let stop_client_id = make_client_order_id(
            &signal.strategy,
            &signal.symbol,
            stop_side.as_str(),
            timestamp_ns,
            STOP_NONCE,
        );
        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            order_type: OrderType::StopMarket,
            side: stop_side,
            amount: position_size,
            price: None,
            params: OrderParams {
                client_order_id: stop_client_id,
                reduce_only: true,
                stop_price: Some(stop_price),
                time_in_force: None,
            },
        };

        match adapter.create_order(&request).await {
            Ok(_) => {
                info!(
                    exchange = %signal.exchange,
                    symbol = %signal.symbol,
                    stop_price,
                    "protective stop installed"
                );
                let quantity_delta = match side {
                    OrderSide::Buy => position_size,
                    OrderSide::Sell => -position_size,
                };
                if let Err(e) = self
                    .store
                    .apply_position_fill(
                        &signal.symbol,
                        &signal.exchange,
                        &signal.strategy,
                        quantity_delta,
                        signal.price,
                        stop_price,
                    )
                    .await
                {
                    error!(error = %e, symbol = %signal.symbol, "position update failed");
                }
            }
            Err(e) => {
                // The entry is live without protection; the reconciler will
                // find the uncovered position and request a repair.
                error!(
                    exchange = %signal.exchange,
                    symbol = %signal.symbol,
                    stop_price,
                    error = %e,
                    "CRITICAL: stop installation failed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Repair requests from the reconciler
    // -------------------------------------------------------------------------

    pub async fn handle_repair(&self, event: &Event) {
        let repair: ReinstallStopPayload = match event.decode() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "undecodable repair request dropped");
                return;
            }
        };
        if self.settings.app.dry_run {
            info!(symbol = %repair.symbol, "dry run: stop reinstall skipped");
            return;
        }
        let Some(adapter) = self.adapters.get(&repair.exchange) else {
            error!(exchange = %repair.exchange, "unknown exchange in repair request");
            return;
        };

        let stop_side = if repair.quantity >= 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        };
        let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let request = OrderRequest {
            symbol: repair.symbol.clone(),
            order_type: OrderType::StopMarket,
            side: stop_side,
            amount: repair.quantity.abs(),
            price: None,
            params: OrderParams {
                client_order_id: make_client_order_id(
                    &repair.strategy,
                    &repair.symbol,
                    stop_side.as_str(),
                    now_ns,
                    STOP_NONCE,
                ),
                reduce_only: true,
                stop_price: Some(repair.stop_price),
                time_in_force: None,
            },
        };

        match adapter.create_order(&request).await {
            Ok(_) => {
                info!(
                    symbol = %repair.symbol,
                    stop_price = repair.stop_price,
                    "protective stop reinstalled"
                );
                if let Err(e) = self
                    .store
                    .mark_stop_installed(
                        &repair.symbol,
                        &repair.exchange,
                        &repair.strategy,
                        repair.stop_price,
                    )
                    .await
                {
                    error!(error = %e, symbol = %repair.symbol, "failed to record reinstalled stop");
                }
            }
            Err(e) => {
                error!(
                    symbol = %repair.symbol,
                    error = %e,
                    "CRITICAL: stop reinstall failed"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Persistence + downstream events
    // -------------------------------------------------------------------------

    async fn record_order(
        &self,
        signal: &SignalPayload,
        request: &OrderRequest,
        status: OrderStatus,
        raw_response: serde_json::Value,
        external_order_id: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            client_order_id: request.params.client_order_id.clone(),
            external_order_id,
            strategy: signal.strategy.clone(),
            symbol: signal.symbol.clone(),
            exchange: signal.exchange.clone(),
            side: request.side,
            order_type: request.order_type,
            status,
            quantity: request.amount,
            filled_quantity: 0.0,
            price: request.price,
            stop_price: request.params.stop_price,
            reduce_only: request.params.reduce_only,
            time_in_force: request.params.time_in_force.clone(),
            raw_request: serde_json::to_value(request).ok(),
            raw_response: Some(raw_response),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_order(&order).await?;

        // Downstream bookkeeping feed; failures here never affect the order.
        if let Ok(event) = Event::from_payload(EVENT_ORDER, &order) {
            let stream = self.settings.redis.streams.orders.clone();
            if let Err(e) = self.bus.publish(&stream, &event).await {
                warn!(error = %e, "failed to publish order event");
            }
        }
        Ok(())
    }

    async fn publish_execution(
        &self,
        signal: &SignalPayload,
        client_order_id: &str,
        response: &serde_json::Value,
    ) {
        let event = Event::new(
            EVENT_EXECUTION,
            json!({
                "client_order_id": client_order_id,
                "exchange": signal.exchange,
                "symbol": signal.symbol,
                "strategy": signal.strategy,
                "response": response,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );
        let stream = self.settings.redis.streams.executions.clone();
        if let Err(e) = self.bus.publish(&stream, &event).await {
            warn!(error = %e, "failed to publish execution event");
        }
    }
}
