// =============================================================================
// Risk math — position sizing, volatility targeting, circuit breakers
// =============================================================================
//
// Circuit breakers:
//   1. Daily Loss      — trips when the day's realised loss exceeds a
//                        fraction of equity.
//   2. Total Drawdown  — trips when cumulative drawdown from peak equity
//                        exceeds a fraction of equity.
//   3. Portfolio Heat  — trips when total currency-at-risk across open
//                        positions (including the candidate trade) exceeds
//                        `max_portfolio_heat * equity`.
//
// Sizing is risk-parity style: the notional that loses at most
// `max_risk_per_trade * equity` if the stop is hit, optionally capped by a
// volatility target.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::RiskConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RiskError {
    #[error("stop_distance must be positive, got {0}")]
    NonPositiveStopDistance(f64),
    #[error("asset volatility must be positive, got {0}")]
    NonPositiveAssetVolatility(f64),
}

// ---------------------------------------------------------------------------
// Portfolio state
// ---------------------------------------------------------------------------

/// Inputs to the circuit-breaker evaluation for a single candidate trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub equity: f64,
    /// Total currency-at-risk across open positions, candidate included.
    pub open_risk: f64,
    /// Realised PnL for the current day (negative when losing).
    pub daily_loss: f64,
    /// Cumulative drawdown from peak equity (negative when under water).
    pub cumulative_drawdown: f64,
}

// ---------------------------------------------------------------------------
// Position sizing
// ---------------------------------------------------------------------------

/// Notional value targeted so the position contributes `target_portfolio_vol`
/// of portfolio volatility given the asset's own volatility.
pub fn volatility_targeted_position_value(
    equity: f64,
    target_portfolio_vol: f64,
    asset_vol: f64,
) -> Result<f64, RiskError> {
    if asset_vol <= 0.0 {
        return Err(RiskError::NonPositiveAssetVolatility(asset_vol));
    }
    Ok(equity * (target_portfolio_vol / asset_vol))
}

/// Position size (base units) respecting the per-trade risk cap and, when
/// enabled and an asset volatility estimate is available, the volatility
/// target.
///
/// The returned size never risks more than `max_risk_per_trade * equity` if
/// the stop at `stop_distance` is hit.
pub fn calculate_position_size(
    equity: f64,
    stop_distance: f64,
    settings: &RiskConfig,
    asset_vol: Option<f64>,
) -> Result<f64, RiskError> {
    if stop_distance <= 0.0 {
        return Err(RiskError::NonPositiveStopDistance(stop_distance));
    }
    let max_risk = equity * settings.max_risk_per_trade;
    let risk_capped_size = max_risk / stop_distance;

    if settings.volatility_targeting.enabled {
        if let Some(vol) = asset_vol {
            let target = settings.volatility_targeting.target_portfolio_vol;
            let vol_size = volatility_targeted_position_value(equity, target, vol)? / stop_distance;
            return Ok(risk_capped_size.min(vol_size));
        }
    }
    Ok(risk_capped_size)
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

/// Evaluate all circuit breakers against `state`.
///
/// Returns `true` if trading should halt. Each tripped breaker is logged at
/// `error` with the offending metric.
pub fn apply_circuit_breakers(state: &PortfolioState, settings: &RiskConfig) -> bool {
    let breakers = &settings.circuit_breakers;

    if state.daily_loss <= -breakers.daily_loss * state.equity {
        error!(
            daily_loss = state.daily_loss,
            limit = breakers.daily_loss,
            "circuit_breaker.daily_loss"
        );
        return true;
    }
    if state.cumulative_drawdown <= -breakers.total_drawdown * state.equity {
        error!(
            drawdown = state.cumulative_drawdown,
            limit = breakers.total_drawdown,
            "circuit_breaker.drawdown"
        );
        return true;
    }
    let max_heat = settings.max_portfolio_heat * state.equity;
    if state.open_risk > max_heat {
        error!(
            open_risk = state.open_risk,
            max_heat, "circuit_breaker.portfolio_heat"
        );
        return true;
    }
    false
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;

    fn settings() -> RiskConfig {
        RiskConfig::default()
    }

    fn state(equity: f64, open_risk: f64) -> PortfolioState {
        PortfolioState {
            equity,
            open_risk,
            daily_loss: 0.0,
            cumulative_drawdown: 0.0,
        }
    }

    #[test]
    fn size_is_capped_by_per_trade_risk() {
        // 2% of 100k = 2000 at risk; stop 4.0 away -> 500 units.
        let size = calculate_position_size(100_000.0, 4.0, &settings(), None).unwrap();
        assert!((size - 500.0).abs() < 1e-9);
    }

    #[test]
    fn size_never_exceeds_risk_cap() {
        let cfg = settings();
        for stop in [0.5, 1.0, 2.5, 10.0, 250.0] {
            let size = calculate_position_size(100_000.0, stop, &cfg, None).unwrap();
            assert!(size <= cfg.max_risk_per_trade * 100_000.0 / stop + 1e-9);
        }
    }

    #[test]
    fn non_positive_stop_distance_is_an_error() {
        assert!(calculate_position_size(100_000.0, 0.0, &settings(), None).is_err());
        assert!(calculate_position_size(100_000.0, -1.0, &settings(), None).is_err());
    }

    #[test]
    fn volatility_target_caps_the_size() {
        let mut cfg = settings();
        cfg.volatility_targeting.enabled = true;
        cfg.volatility_targeting.target_portfolio_vol = 0.10;

        // Asset vol 0.50 -> scalar 0.2 -> value 20k -> size 20k/4 = 5000,
        // above the 500 risk cap, so the cap wins.
        let size = calculate_position_size(100_000.0, 4.0, &cfg, Some(0.50)).unwrap();
        assert!((size - 500.0).abs() < 1e-9);

        // Very volatile asset: vol 40 -> value 250 -> size 62.5, below the cap.
        let size = calculate_position_size(100_000.0, 4.0, &cfg, Some(40.0)).unwrap();
        assert!((size - 62.5).abs() < 1e-9);
    }

    #[test]
    fn volatility_target_rejects_non_positive_vol() {
        assert!(volatility_targeted_position_value(100_000.0, 0.1, 0.0).is_err());
    }

    #[test]
    fn heat_breaker_trips_above_cap_only() {
        let cfg = settings();
        // Exactly at the cap (6% of 100k): allowed.
        assert!(!apply_circuit_breakers(&state(100_000.0, 6_000.0), &cfg));
        // One cent over: halt.
        assert!(apply_circuit_breakers(&state(100_000.0, 6_000.01), &cfg));
    }

    #[test]
    fn daily_loss_breaker_trips() {
        let mut cfg = settings();
        cfg.circuit_breakers.daily_loss = 0.03;
        let mut st = state(100_000.0, 0.0);
        st.daily_loss = -3_000.0;
        assert!(apply_circuit_breakers(&st, &cfg));
        st.daily_loss = -2_999.0;
        assert!(!apply_circuit_breakers(&st, &cfg));
    }

    #[test]
    fn drawdown_breaker_trips() {
        let mut cfg = settings();
        cfg.circuit_breakers.total_drawdown = 0.10;
        let mut st = state(100_000.0, 0.0);
        st.cumulative_drawdown = -10_000.0;
        assert!(apply_circuit_breakers(&st, &cfg));
        st.cumulative_drawdown = -9_999.0;
        assert!(!apply_circuit_breakers(&st, &cfg));
    }
}
