// =============================================================================
// Bus events — JSON envelope and typed payload views
// =============================================================================
//
// Everything on the bus is `{"type": ..., "payload": {...}}`. Producers build
// payloads from typed structs; consumers decode the view they need and drop
// events that do not validate rather than crashing the loop.
// =============================================================================

use serde::{Deserialize, Serialize};

// Event type names carried in the envelope.
pub const EVENT_MARKET_DATA: &str = "market_data";
pub const EVENT_SIGNAL: &str = "signal";
pub const EVENT_APPROVED_SIGNAL: &str = "approved_signal";
pub const EVENT_ORDER: &str = "order";
pub const EVENT_EXECUTION: &str = "execution";
pub const EVENT_REINSTALL_STOP: &str = "reinstall_stop";

/// Envelope for every message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an event from any serialisable payload struct.
    pub fn from_payload<T: Serialize>(
        event_type: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    pub fn dumps(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Decode the payload into a typed view.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

/// One poll's worth of OHLCV rows for a single (exchange, symbol).
/// Rows are `[ts_ms, open, high, low, close, volume]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataPayload {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: String,
    pub data: Vec<[f64; 6]>,
    /// RFC 3339, always tz-aware.
    pub timestamp: String,
}

impl MarketDataPayload {
    pub fn latest_close(&self) -> Option<f64> {
        self.data.last().map(|row| row[4])
    }

    /// Millisecond timestamp of the most recent candle.
    pub fn latest_candle_ts_ms(&self) -> Option<i64> {
        self.data.last().map(|row| row[0] as i64)
    }
}

/// Risk parameters proposed by the strategy alongside a signal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalRisk {
    #[serde(default)]
    pub stop_distance: Option<f64>,
    #[serde(default)]
    pub position_size: Option<f64>,
}

/// A candidate trade emitted by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    pub strategy: String,
    pub exchange: String,
    pub symbol: String,
    /// "buy" or "sell".
    pub decision: String,
    #[serde(default)]
    pub confidence: f64,
    pub price: f64,
    /// Nanosecond timestamp of the candle that produced the signal; the
    /// execution layer derives client order ids from it, so replays of the
    /// same signal regenerate the same ids.
    #[serde(default)]
    pub timestamp_ns: Option<i64>,
    #[serde(default)]
    pub risk: Option<SignalRisk>,
    #[serde(default)]
    pub risk_approved: bool,
}

impl SignalPayload {
    /// Validated (stop_distance, position_size), both present and positive.
    pub fn checked_risk(&self) -> Option<(f64, f64)> {
        let risk = self.risk.as_ref()?;
        match (risk.stop_distance, risk.position_size) {
            (Some(stop), Some(size)) if stop > 0.0 && size > 0.0 => Some((stop, size)),
            _ => None,
        }
    }
}

/// Repair request published by the reconciler when a protective stop is
/// missing on the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinstallStopPayload {
    pub symbol: String,
    pub exchange: String,
    pub strategy: String,
    pub quantity: f64,
    pub stop_price: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dumps_from_bytes_round_trips_byte_identically() {
        let event = Event::new(
            EVENT_SIGNAL,
            json!({
                "strategy": "trend",
                "exchange": "binanceusdm",
                "symbol": "BTC/USDT",
                "decision": "buy",
                "confidence": 0.6,
                "price": 105.0,
                "risk": {"stop_distance": 4.0, "position_size": 500.0}
            }),
        );
        let first = event.dumps().unwrap();
        let reparsed = Event::from_bytes(&first).unwrap();
        assert_eq!(reparsed, event);
        assert_eq!(reparsed.dumps().unwrap(), first);
    }

    #[test]
    fn envelope_uses_type_and_payload_keys() {
        let event = Event::new(EVENT_MARKET_DATA, json!({"symbol": "BTC/USDT"}));
        let raw: serde_json::Value =
            serde_json::from_slice(&event.dumps().unwrap()).unwrap();
        assert_eq!(raw["type"], "market_data");
        assert_eq!(raw["payload"]["symbol"], "BTC/USDT");
    }

    #[test]
    fn signal_payload_decodes_and_validates_risk() {
        let event = Event::new(
            EVENT_SIGNAL,
            json!({
                "strategy": "trend",
                "exchange": "binanceusdm",
                "symbol": "BTC/USDT",
                "decision": "buy",
                "confidence": 0.6,
                "price": 105.0,
                "timestamp_ns": 1_700_000_000_000_000_000_i64,
                "risk": {"stop_distance": 4.0, "position_size": 500.0}
            }),
        );
        let signal: SignalPayload = event.decode().unwrap();
        assert_eq!(signal.checked_risk(), Some((4.0, 500.0)));
        assert!(!signal.risk_approved);
    }

    #[test]
    fn missing_or_non_positive_risk_fails_validation() {
        let no_risk: SignalPayload = serde_json::from_value(json!({
            "strategy": "trend", "exchange": "x", "symbol": "s",
            "decision": "buy", "price": 1.0
        }))
        .unwrap();
        assert_eq!(no_risk.checked_risk(), None);

        let zero_stop: SignalPayload = serde_json::from_value(json!({
            "strategy": "trend", "exchange": "x", "symbol": "s",
            "decision": "buy", "price": 1.0,
            "risk": {"stop_distance": 0.0, "position_size": 10.0}
        }))
        .unwrap();
        assert_eq!(zero_stop.checked_risk(), None);
    }

    #[test]
    fn market_data_payload_exposes_latest_candle() {
        let payload = MarketDataPayload {
            exchange: "binanceusdm".into(),
            symbol: "BTC/USDT".into(),
            timeframe: "1m".into(),
            data: vec![
                [1_700_000_000_000.0, 1.0, 2.0, 0.5, 1.5, 10.0],
                [1_700_000_060_000.0, 1.5, 2.5, 1.0, 2.0, 12.0],
            ],
            timestamp: "2023-11-14T22:13:20+00:00".into(),
        };
        assert_eq!(payload.latest_close(), Some(2.0));
        assert_eq!(payload.latest_candle_ts_ms(), Some(1_700_000_060_000));
    }
}
