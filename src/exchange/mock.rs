// =============================================================================
// In-memory exchange used by tests
// =============================================================================
//
// Records every submission, honours client-order-id idempotency the way a
// real venue does (a duplicate id returns the original response and changes
// nothing), and lets tests script failures and canned venue state.
// =============================================================================

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{ExchangeAdapter, OrderRequest};

#[derive(Default)]
struct State {
    orders: Vec<OrderRequest>,
    responses: std::collections::HashMap<String, serde_json::Value>,
    fail_all_orders: bool,
    fail_stop_orders: bool,
    ohlcv: Vec<[f64; 6]>,
    positions: Vec<serde_json::Value>,
    open_orders: Vec<serde_json::Value>,
    next_order_id: u64,
    closed: bool,
}

pub struct MockExchange {
    name: String,
    state: Mutex<State>,
}

impl MockExchange {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(State::default()),
        }
    }

    // --- scripting ----------------------------------------------------------

    pub fn set_ohlcv(&self, candles: Vec<[f64; 6]>) {
        self.state.lock().ohlcv = candles;
    }

    pub fn set_positions(&self, positions: Vec<serde_json::Value>) {
        self.state.lock().positions = positions;
    }

    pub fn set_open_orders(&self, orders: Vec<serde_json::Value>) {
        self.state.lock().open_orders = orders;
    }

    /// Make every order submission fail.
    pub fn fail_all_orders(&self, fail: bool) {
        self.state.lock().fail_all_orders = fail;
    }

    /// Make only reduce-only stop submissions fail (entry succeeds).
    pub fn fail_stop_orders(&self, fail: bool) {
        self.state.lock().fail_stop_orders = fail;
    }

    // --- inspection ---------------------------------------------------------

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().orders.clone()
    }

    pub fn order_count(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn was_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_ohlcv(
        &self,
        _symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<[f64; 6]>> {
        let candles = self.state.lock().ohlcv.clone();
        let keep = candles.len().saturating_sub(limit as usize);
        Ok(candles[keep..].to_vec())
    }

    async fn create_order(&self, request: &OrderRequest) -> Result<serde_json::Value> {
        let mut state = self.state.lock();
        let is_stop = request.params.reduce_only && request.params.stop_price.is_some();
        if state.fail_all_orders {
            bail!("mock venue rejected order");
        }
        if is_stop && state.fail_stop_orders {
            bail!("mock venue rejected stop order");
        }
        // Venue-side idempotency: a duplicate client id is a no-op that
        // returns the original response.
        if let Some(prior) = state.responses.get(&request.params.client_order_id) {
            return Ok(prior.clone());
        }
        state.next_order_id += 1;
        let response = json!({
            "orderId": state.next_order_id,
            "clientOrderId": request.params.client_order_id,
            "symbol": request.symbol,
            "status": "NEW",
        });
        state.orders.push(request.clone());
        state
            .responses
            .insert(request.params.client_order_id.clone(), response.clone());
        Ok(response)
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<serde_json::Value>> {
        let positions = self.state.lock().positions.clone();
        if symbols.is_empty() {
            return Ok(positions);
        }
        Ok(positions
            .into_iter()
            .filter(|p| {
                p["symbol"]
                    .as_str()
                    .map(|s| symbols.iter().any(|w| w == s))
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self.state.lock().open_orders.clone())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

impl std::fmt::Debug for MockExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExchange")
            .field("name", &self.name)
            .field("orders", &self.order_count())
            .finish()
    }
}
