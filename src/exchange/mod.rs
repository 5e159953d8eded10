// =============================================================================
// Exchange adapters — the venue capability consumed by the services
// =============================================================================

pub mod binance;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ExchangeConfig;
use crate::models::{OrderSide, OrderType};

/// Venue-bound order parameters. Field names follow the wire convention so a
/// captured `raw_request` reads like what the venue actually saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderParams {
    /// Idempotency key; the venue treats a resubmission with the same id as
    /// a duplicate of the first.
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    #[serde(rename = "reduceOnly", default)]
    pub reduce_only: bool,
    #[serde(rename = "stopPrice", default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
    #[serde(rename = "timeInForce", default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<String>,
}

/// A single order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: OrderSide,
    pub amount: f64,
    pub price: Option<f64>,
    pub params: OrderParams,
}

/// The capability surface the pipeline needs from any venue.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Configured name this adapter was built under.
    fn name(&self) -> &str;

    /// Latest OHLCV candles, oldest first; rows are
    /// `[ts_ms, open, high, low, close, volume]`.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<[f64; 6]>>;

    /// Submit an order; returns the venue's raw response.
    async fn create_order(&self, request: &OrderRequest) -> Result<serde_json::Value>;

    /// Venue-held positions for the given symbols (all when empty).
    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<serde_json::Value>>;

    /// Open orders for one symbol, as raw venue objects.
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>>;

    /// Release any held connections. Called once at service shutdown.
    async fn close(&self) -> Result<()>;
}

/// Build one adapter per configured exchange, keyed by its configured name.
pub fn build_adapters(
    configs: &[ExchangeConfig],
) -> Result<HashMap<String, Arc<dyn ExchangeAdapter>>> {
    let mut adapters: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    for cfg in configs {
        let adapter = build_adapter(cfg)?;
        info!(exchange = %cfg.name, module = %cfg.module, sandbox = cfg.sandbox, "exchange adapter initialised");
        adapters.insert(cfg.name.clone(), adapter);
    }
    Ok(adapters)
}

pub fn build_adapter(cfg: &ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>> {
    if cfg.module.contains("binance") {
        let mut client =
            binance::BinanceUsdm::new(cfg.name.clone(), &cfg.api_key, &cfg.api_secret);
        if cfg.sandbox {
            client.set_sandbox_mode(true);
        }
        return Ok(Arc::new(client));
    }
    if cfg.module.contains("mock") {
        return Ok(Arc::new(mock::MockExchange::new(cfg.name.clone())));
    }
    bail!("unsupported exchange module '{}'", cfg.module);
}
