// =============================================================================
// ReconciliationService — audits local state against venue reality
// =============================================================================
//
// SAFETY POLICY: this service never writes to a venue and never mutates
// trading rows. Drift is logged, and when auto-repair is enabled a
// reinstall_stop request is published for the execution service — the sole
// venue writer — to act on.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::Settings;
use crate::events::{Event, ReinstallStopPayload, EVENT_REINSTALL_STOP};
use crate::exchange::{build_adapters, ExchangeAdapter};
use crate::models::Position;
use crate::services::Shutdown;
use crate::store::TradingStore;

pub struct ReconciliationService {
    settings: Settings,
    bus: EventBus,
    store: TradingStore,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    shutdown: Shutdown,
}

impl ReconciliationService {
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
        })
    }

    /// Test hook: swap in pre-built adapters (mock venues).
    pub fn with_adapters(mut self, adapters: HashMap<String, Arc<dyn ExchangeAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub async fn run(&self) -> Result<()> {
        if !self.settings.reconciliation.enabled {
            warn!("reconciliation disabled by config");
            return Ok(());
        }
        let interval = Duration::from_secs(self.settings.reconciliation.interval_seconds);
        info!(
            interval_secs = interval.as_secs(),
            auto_repair = self.settings.reconciliation.auto_repair,
            "reconciliation service started"
        );

        while !self.shutdown.is_stopping() {
            if let Err(e) = self.reconcile_once().await {
                error!(error = %e, "reconciliation cycle failed");
            }
            self.shutdown.sleep(interval).await;
        }
        for adapter in self.adapters.values() {
            let _ = adapter.close().await;
        }
        info!("reconciliation service stopped");
        Ok(())
    }

    /// One audit pass over every open local position.
    pub async fn reconcile_once(&self) -> Result<()> {
        let positions = self.store.open_positions().await?;
        for position in &positions {
            let Some(adapter) = self.adapters.get(&position.exchange) else {
                warn!(exchange = %position.exchange, "no adapter for exchange; position skipped");
                continue;
            };
            let venue_positions = match adapter.fetch_positions(&[position.symbol.clone()]).await {
                Ok(p) => p,
                Err(e) => {
                    error!(
                        exchange = %position.exchange,
                        symbol = %position.symbol,
                        error = %e,
                        "venue position fetch failed"
                    );
                    continue;
                }
            };
            let open_orders = match adapter.fetch_open_orders(&position.symbol).await {
                Ok(o) => o,
                Err(e) => {
                    error!(
                        exchange = %position.exchange,
                        symbol = %position.symbol,
                        error = %e,
                        "venue open-order fetch failed"
                    );
                    continue;
                }
            };
            self.verify_position(position, &venue_positions, &open_orders)
                .await;
        }
        Ok(())
    }

    async fn verify_position(
        &self,
        local: &Position,
        venue_positions: &[serde_json::Value],
        open_orders: &[serde_json::Value],
    ) {
        let Some(matching) = find_matching_position(&local.symbol, venue_positions) else {
            error!(
                symbol = %local.symbol,
                exchange = %local.exchange,
                "CRITICAL: position missing on exchange"
            );
            return;
        };
        if let Some(qty) = venue_quantity(matching) {
            if qty.abs() == 0.0 {
                error!(
                    symbol = %local.symbol,
                    exchange = %local.exchange,
                    "CRITICAL: position closed on venue but open locally"
                );
            }
        }
        if !has_reduce_only_stop(open_orders) {
            error!(
                symbol = %local.symbol,
                exchange = %local.exchange,
                "CRITICAL: protective stop missing on venue"
            );
            if self.settings.reconciliation.auto_repair {
                self.request_stop_repair(local).await;
            }
        }
    }

    async fn request_stop_repair(&self, position: &Position) {
        let payload = ReinstallStopPayload {
            symbol: position.symbol.clone(),
            exchange: position.exchange.clone(),
            strategy: position.strategy.clone(),
            quantity: position.quantity,
            stop_price: position.stop_price,
        };
        let event = match Event::from_payload(EVENT_REINSTALL_STOP, &payload) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "failed to encode repair request");
                return;
            }
        };
        let stream = self.settings.redis.streams.reconciliations.clone();
        match self.bus.publish(&stream, &event).await {
            Ok(_) => warn!(
                symbol = %position.symbol,
                stop_price = position.stop_price,
                "stop repair requested"
            ),
            Err(e) => error!(error = %e, "failed to publish repair request"),
        }
    }
}

// ---------------------------------------------------------------------------
// Drift-check helpers
// ---------------------------------------------------------------------------

/// Match a local symbol against venue position objects, tolerating the fused
/// venue form ("BTCUSDT") as well as the config form ("BTC/USDT").
fn find_matching_position<'a>(
    symbol: &str,
    venue_positions: &'a [serde_json::Value],
) -> Option<&'a serde_json::Value> {
    let fused = symbol.replace('/', "");
    venue_positions.iter().find(|p| {
        p["symbol"]
            .as_str()
            .map(|s| s == symbol || s == fused)
            .unwrap_or(false)
    })
}

/// Venue position quantity under its various field names.
fn venue_quantity(position: &serde_json::Value) -> Option<f64> {
    for key in ["contracts", "positionAmt", "size"] {
        let value = &position[key];
        if let Some(n) = value.as_f64() {
            return Some(n);
        }
        if let Some(s) = value.as_str() {
            if let Ok(n) = s.parse() {
                return Some(n);
            }
        }
    }
    None
}

/// Whether any open order is a reduce-only stop (venue type spellings vary:
/// "stop_market", "STOP_MARKET", "stop", ...).
fn has_reduce_only_stop(open_orders: &[serde_json::Value]) -> bool {
    open_orders.iter().any(|order| {
        order["reduceOnly"].as_bool().unwrap_or(false)
            && order["type"]
                .as_str()
                .map(|t| t.to_lowercase().starts_with("stop"))
                .unwrap_or(false)
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matching_tolerates_fused_and_slashed_symbols() {
        let venue = vec![json!({"symbol": "BTCUSDT", "positionAmt": "1.0"})];
        assert!(find_matching_position("BTC/USDT", &venue).is_some());
        assert!(find_matching_position("ETH/USDT", &venue).is_none());
    }

    #[test]
    fn quantity_reads_any_known_field_and_both_encodings() {
        assert_eq!(venue_quantity(&json!({"contracts": 2.0})), Some(2.0));
        assert_eq!(venue_quantity(&json!({"positionAmt": "-1.5"})), Some(-1.5));
        assert_eq!(venue_quantity(&json!({"size": "0"})), Some(0.0));
        assert_eq!(venue_quantity(&json!({"other": 1.0})), None);
    }

    #[test]
    fn stop_detection_requires_reduce_only_and_stop_type() {
        let ok = vec![json!({"type": "STOP_MARKET", "reduceOnly": true})];
        assert!(has_reduce_only_stop(&ok));

        let not_reduce_only = vec![json!({"type": "STOP_MARKET", "reduceOnly": false})];
        assert!(!has_reduce_only_stop(&not_reduce_only));

        let not_a_stop = vec![json!({"type": "LIMIT", "reduceOnly": true})];
        assert!(!has_reduce_only_stop(&not_a_stop));

        let lowercase = vec![json!({"type": "stop", "reduceOnly": true})];
        assert!(has_reduce_only_stop(&lowercase));
    }
}
