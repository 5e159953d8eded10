// =============================================================================
// DataService — polls venue OHLCV and publishes market_data events
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info};

use crate::bus::EventBus;
use crate::config::Settings;
use crate::events::{Event, MarketDataPayload, EVENT_MARKET_DATA};
use crate::exchange::{build_adapters, ExchangeAdapter};
use crate::services::Shutdown;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
const TIMEFRAME: &str = "1m";
/// Two candles per poll: the still-forming one plus its closed predecessor.
const CANDLE_LIMIT: u32 = 2;

pub struct DataService {
    settings: Settings,
    bus: EventBus,
    adapters: HashMap<String, Arc<dyn ExchangeAdapter>>,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl DataService {
    pub fn new(settings: Settings, bus: EventBus, shutdown: Shutdown) -> Result<Self> {
        let adapters = build_adapters(&settings.exchanges)?;
        Ok(Self {
            settings,
            bus,
            adapters,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Test hook: swap in pre-built adapters (mock venues).
    pub fn with_adapters(mut self, adapters: HashMap<String, Arc<dyn ExchangeAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            exchanges = self.adapters.len(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "data service started"
        );
        while !self.shutdown.is_stopping() {
            self.poll_once().await;
            self.shutdown.sleep(self.poll_interval).await;
        }
        for adapter in self.adapters.values() {
            let _ = adapter.close().await;
        }
        info!("data service stopped");
        Ok(())
    }

    /// One poll across every configured (exchange, symbol). Venue errors are
    /// per-symbol: logged and swallowed so one sick symbol never stalls the
    /// rest.
    pub async fn poll_once(&self) {
        let stream = self.settings.redis.streams.market_data.clone();
        for exchange_cfg in &self.settings.exchanges {
            let Some(adapter) = self.adapters.get(&exchange_cfg.name) else {
                continue;
            };
            for symbol in &exchange_cfg.symbols {
                match adapter.fetch_ohlcv(symbol, TIMEFRAME, CANDLE_LIMIT).await {
                    Ok(ohlcv) => {
                        let payload = MarketDataPayload {
                            exchange: exchange_cfg.name.clone(),
                            symbol: symbol.clone(),
                            timeframe: TIMEFRAME.to_string(),
                            data: ohlcv,
                            timestamp: Utc::now().to_rfc3339(),
                        };
                        let event = match Event::from_payload(EVENT_MARKET_DATA, &payload) {
                            Ok(event) => event,
                            Err(e) => {
                                error!(error = %e, "failed to encode market data event");
                                continue;
                            }
                        };
                        match self.bus.publish(&stream, &event).await {
                            Ok(_) => info!(
                                exchange = %exchange_cfg.name,
                                symbol = %symbol,
                                points = payload.data.len(),
                                "market data published"
                            ),
                            Err(e) => error!(
                                exchange = %exchange_cfg.name,
                                symbol = %symbol,
                                error = %e,
                                "failed to publish market data"
                            ),
                        }
                    }
                    Err(e) => {
                        error!(
                            exchange = %exchange_cfg.name,
                            symbol = %symbol,
                            error = %e,
                            "ohlcv fetch failed"
                        );
                    }
                }
            }
        }
    }
}
