// =============================================================================
// RiskService — portfolio-level gate between signals and execution
// =============================================================================
//
// Reads the signals stream, reconstructs portfolio heat from open positions
// on every evaluation, applies the circuit breakers and leverage cap, and
// republishes surviving signals with `risk_approved: true`.
//
// Processing is strictly sequential: the heat computed for signal N already
// reflects every position opened by earlier approvals.
// =============================================================================

use anyhow::Result;
use tracing::{error, info, warn};

use crate::bus::{BusError, EventBus, DEFAULT_BLOCK_MS};
use crate::config::Settings;
use crate::events::{Event, SignalPayload, EVENT_APPROVED_SIGNAL};
use crate::risk::{apply_circuit_breakers, PortfolioState};
use crate::services::Shutdown;
use crate::store::TradingStore;

pub struct RiskService {
    settings: Settings,
    bus: EventBus,
    store: TradingStore,
    shutdown: Shutdown,
    last_id: String,
}

impl RiskService {
    pub fn new(settings: Settings, bus: EventBus, store: TradingStore, shutdown: Shutdown) -> Self {
        Self {
            settings,
            bus,
            store,
            shutdown,
            last_id: "0-0".to_string(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("risk service started");
        let signal_stream = self.settings.redis.streams.signals.clone();
        while !self.shutdown.is_stopping() {
            let consumed = self
                .bus
                .consume(&signal_stream, &self.last_id, DEFAULT_BLOCK_MS)
                .await;
            match consumed {
                Ok((event, message_id)) => {
                    self.last_id = message_id;
                    if let Err(e) = self.handle_signal(&event).await {
                        error!(error = %e, "signal evaluation failed");
                    }
                }
                Err(BusError::Timeout) => continue,
                Err(e) => {
                    warn!(error = %e, "signal consume failed; retrying");
                    self.shutdown.sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
        info!("risk service stopped");
        Ok(())
    }

    /// Evaluate one signal. Rejections drop the signal (they are expected
    /// outcomes, not errors); only store access failures propagate.
    pub async fn handle_signal(&self, event: &Event) -> Result<()> {
        let signal: SignalPayload = match event.decode() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "undecodable signal dropped");
                return Ok(());
            }
        };
        let Some((stop_distance, position_size)) = signal.checked_risk() else {
            warn!(
                strategy = %signal.strategy,
                symbol = %signal.symbol,
                "signal missing risk parameters; dropped"
            );
            return Ok(());
        };

        let equity = self.current_equity().await?;
        let open_risk = self.store.open_risk().await?;
        let candidate_risk = stop_distance * position_size;

        // TODO: feed daily_loss and drawdown from a PnL service once one
        // exists; until then only the heat breaker can trip organically.
        let state = PortfolioState {
            equity,
            open_risk: open_risk + candidate_risk,
            daily_loss: 0.0,
            cumulative_drawdown: 0.0,
        };
        if apply_circuit_breakers(&state, &self.settings.risk) {
            error!(
                strategy = %signal.strategy,
                symbol = %signal.symbol,
                open_risk,
                candidate_risk,
                "signal rejected by circuit breaker"
            );
            return Ok(());
        }

        if position_size / equity > self.settings.risk.max_leverage {
            warn!(
                strategy = %signal.strategy,
                symbol = %signal.symbol,
                notional = position_size,
                equity,
                "signal_rejected_leverage"
            );
            return Ok(());
        }

        // Republish the payload unchanged apart from the approval mark.
        let mut payload = event.payload.clone();
        payload["risk_approved"] = serde_json::Value::Bool(true);
        let approved = Event::new(EVENT_APPROVED_SIGNAL, payload);
        let stream = self.settings.redis.streams.approved_signals.clone();
        self.bus
            .publish(&stream, &approved)
            .await
            .map_err(|e| anyhow::anyhow!("failed to publish approved signal: {e}"))?;
        info!(
            strategy = %signal.strategy,
            symbol = %signal.symbol,
            decision = %signal.decision,
            "signal approved"
        );
        Ok(())
    }

    /// Latest persisted equity; the configured placeholder until an account
    /// snapshot exists.
    async fn current_equity(&self) -> Result<f64> {
        Ok(self
            .store
            .latest_account_state()
            .await?
            .map(|state| state.equity)
            .unwrap_or(self.settings.risk.placeholder_equity))
    }
}
