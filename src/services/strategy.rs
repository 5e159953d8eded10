// =============================================================================
// StrategyService — turns market data into candidate trade signals
// =============================================================================
//
// Single reader on the market_data stream. Keeps a bounded close-price
// history per (exchange, symbol) and evaluates every enabled strategy on
// each tick. The reference strategy is a fast/slow moving-average crossover
// with a hysteresis band and ATR-derived stop distance.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::bus::{BusError, EventBus, DEFAULT_BLOCK_MS};
use crate::config::{RiskConfig, Settings, StrategyConfig};
use crate::events::{
    Event, MarketDataPayload, SignalPayload, SignalRisk, EVENT_SIGNAL,
};
use crate::indicators::{average_true_range, simple_moving_average};
use crate::risk::calculate_position_size;
use crate::services::Shutdown;

/// Close prices retained per (exchange, symbol).
const HISTORY_CAP: usize = 500;

/// Hysteresis band around the slow MA; crossings inside it emit nothing,
/// preventing signal flapping when the averages touch.
const HYSTERESIS: f64 = 0.001;

const SIGNAL_CONFIDENCE: f64 = 0.6;

// ---------------------------------------------------------------------------
// Trend strategy (MA crossover + ATR sizing)
// ---------------------------------------------------------------------------

/// Parameters for one configured trend strategy instance.
#[derive(Debug, Clone)]
pub struct TrendParams {
    pub fast_ma_period: usize,
    pub slow_ma_period: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub asset_volatility: Option<f64>,
}

impl TrendParams {
    pub fn from_config(cfg: &StrategyConfig) -> Self {
        Self {
            fast_ma_period: cfg.param_usize("fast_ma_period", 50),
            slow_ma_period: cfg.param_usize("slow_ma_period", 200),
            atr_period: cfg.param_usize("atr_period", 14),
            atr_multiplier: cfg.param_f64("atr_multiplier", 2.0),
            asset_volatility: cfg
                .parameters
                .get("asset_volatility")
                .and_then(|v| v.as_f64()),
        }
    }

    /// Closes needed before the strategy can evaluate at all.
    fn min_history(&self) -> usize {
        self.fast_ma_period
            .max(self.slow_ma_period)
            .max(self.atr_period)
            + 1
    }
}

/// A directional decision plus its proposed risk parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendDecision {
    pub action: &'static str,
    pub confidence: f64,
    pub stop_distance: f64,
    pub position_size: f64,
}

/// Evaluate the trend strategy on a close-price history.
///
/// Returns `None` when the history is too short, the ATR is flat or
/// non-finite, or the fast MA sits inside the hysteresis band.
pub fn evaluate_trend(
    params: &TrendParams,
    closes: &[f64],
    risk: &RiskConfig,
    equity: f64,
) -> Option<TrendDecision> {
    if closes.len() < params.min_history() {
        return None;
    }
    let fast_ma = simple_moving_average(closes, params.fast_ma_period)?;
    let slow_ma = simple_moving_average(closes, params.slow_ma_period)?;
    let atr = average_true_range(closes, params.atr_period)?;
    if atr <= 0.0 {
        return None;
    }

    let action = if fast_ma > slow_ma * (1.0 + HYSTERESIS) {
        "buy"
    } else if fast_ma < slow_ma * (1.0 - HYSTERESIS) {
        "sell"
    } else {
        return None;
    };

    let stop_distance = atr * params.atr_multiplier;
    let position_size =
        match calculate_position_size(equity, stop_distance, risk, params.asset_volatility) {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "trend sizing failed; dropping evaluation");
                return None;
            }
        };

    Some(TrendDecision {
        action,
        confidence: SIGNAL_CONFIDENCE,
        stop_distance,
        position_size,
    })
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct StrategyService {
    settings: Settings,
    bus: EventBus,
    shutdown: Shutdown,
    strategies: Vec<(StrategyConfig, TrendParams)>,
    price_history: HashMap<(String, String), VecDeque<f64>>,
    last_id: String,
}

impl StrategyService {
    pub fn new(settings: Settings, bus: EventBus, shutdown: Shutdown) -> Self {
        let strategies = settings
            .strategies
            .iter()
            .filter(|cfg| cfg.enabled)
            .filter(|cfg| {
                let is_trend = cfg.module.contains("trend");
                if !is_trend {
                    warn!(strategy = %cfg.name, module = %cfg.module, "unknown strategy module; skipping");
                }
                is_trend
            })
            .map(|cfg| (cfg.clone(), TrendParams::from_config(cfg)))
            .collect();
        Self {
            settings,
            bus,
            shutdown,
            strategies,
            price_history: HashMap::new(),
            last_id: "0-0".to_string(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        if self.strategies.is_empty() {
            warn!("no strategies enabled; strategy service idle");
            return Ok(());
        }
        info!(strategies = self.strategies.len(), "strategy service started");

        let market_stream = self.settings.redis.streams.market_data.clone();
        while !self.shutdown.is_stopping() {
            let consumed = self
                .bus
                .consume(&market_stream, &self.last_id, DEFAULT_BLOCK_MS)
                .await;
            match consumed {
                Ok((event, message_id)) => {
                    self.last_id = message_id;
                    self.handle_market_event(&event).await;
                }
                Err(BusError::Timeout) => continue,
                Err(e) => {
                    // Transient transport failure: the cursor is unchanged,
                    // so retrying is safe.
                    warn!(error = %e, "market data consume failed; retrying");
                    self.shutdown.sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
        info!("strategy service stopped");
        Ok(())
    }

    pub async fn handle_market_event(&mut self, event: &Event) {
        let payload: MarketDataPayload = match event.decode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "undecodable market data event dropped");
                return;
            }
        };
        let Some(close) = payload.latest_close() else {
            return;
        };

        let key = (payload.exchange.clone(), payload.symbol.clone());
        let history = self
            .price_history
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(HISTORY_CAP));
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(close);
        let closes: Vec<f64> = history.iter().copied().collect();

        // Signals inherit the candle's timestamp so replays regenerate the
        // same client order ids downstream.
        let timestamp_ns = payload.latest_candle_ts_ms().map(|ms| ms * 1_000_000);

        let signal_stream = self.settings.redis.streams.signals.clone();
        for (cfg, params) in &self.strategies {
            let decision = evaluate_trend(
                params,
                &closes,
                &self.settings.risk,
                self.settings.risk.placeholder_equity,
            );
            let Some(decision) = decision else { continue };

            let signal = SignalPayload {
                strategy: cfg.name.clone(),
                exchange: payload.exchange.clone(),
                symbol: payload.symbol.clone(),
                decision: decision.action.to_string(),
                confidence: decision.confidence,
                price: close,
                timestamp_ns,
                risk: Some(SignalRisk {
                    stop_distance: Some(decision.stop_distance),
                    position_size: Some(decision.position_size),
                }),
                risk_approved: false,
            };
            let event = match Event::from_payload(EVENT_SIGNAL, &signal) {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "failed to encode signal");
                    continue;
                }
            };
            match self.bus.publish(&signal_stream, &event).await {
                Ok(_) => info!(
                    strategy = %cfg.name,
                    exchange = %payload.exchange,
                    symbol = %payload.symbol,
                    action = %decision.action,
                    "signal published"
                ),
                Err(e) => error!(error = %e, "failed to publish signal"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;

    fn params() -> TrendParams {
        TrendParams {
            fast_ma_period: 3,
            slow_ma_period: 5,
            atr_period: 2,
            atr_multiplier: 2.0,
            asset_volatility: None,
        }
    }

    #[test]
    fn short_history_emits_nothing() {
        let closes = vec![100.0; 5]; // needs max(3,5,2)+1 = 6
        assert_eq!(
            evaluate_trend(&params(), &closes, &RiskConfig::default(), 100_000.0),
            None
        );
    }

    #[test]
    fn flat_series_has_zero_atr_and_emits_nothing() {
        let closes = vec![100.0; 10];
        assert_eq!(
            evaluate_trend(&params(), &closes, &RiskConfig::default(), 100_000.0),
            None
        );
    }

    #[test]
    fn rising_series_emits_buy_with_atr_sized_stop() {
        // Steady +2 ramp: fast MA > slow MA * 1.001, ATR = 2.
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + 2.0 * i as f64).collect();
        let decision =
            evaluate_trend(&params(), &closes, &RiskConfig::default(), 100_000.0).unwrap();
        assert_eq!(decision.action, "buy");
        assert!((decision.stop_distance - 4.0).abs() < 1e-9);
        // 2% of 100k risked over a 4.0 stop -> 500 units.
        assert!((decision.position_size - 500.0).abs() < 1e-9);
    }

    #[test]
    fn falling_series_emits_sell() {
        let closes: Vec<f64> = (0..10).map(|i| 200.0 - 2.0 * i as f64).collect();
        let decision =
            evaluate_trend(&params(), &closes, &RiskConfig::default(), 100_000.0).unwrap();
        assert_eq!(decision.action, "sell");
    }

    #[test]
    fn crossings_inside_the_hysteresis_band_emit_nothing() {
        // Alternating +1/-1 keeps both MAs within 0.1% of each other while
        // the ATR stays positive.
        let mut closes = Vec::new();
        for i in 0..10 {
            closes.push(if i % 2 == 0 { 1000.0 } else { 1000.5 });
        }
        assert_eq!(
            evaluate_trend(&params(), &closes, &RiskConfig::default(), 100_000.0),
            None
        );
    }
}
