// =============================================================================
// Binance USD-M Futures REST adapter — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between this host and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use super::{ExchangeAdapter, OrderRequest};
use crate::models::{OrderSide, OrderType};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const LIVE_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

/// Binance USD-M futures client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceUsdm {
    name: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceUsdm {
    pub fn new(name: String, api_key: &str, secret: &str) -> Self {
        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            name,
            secret: secret.to_string(),
            base_url: LIVE_BASE_URL.to_string(),
            client,
        }
    }

    /// Point the adapter at the futures testnet.
    pub fn set_sandbox_mode(&mut self, enabled: bool) {
        self.base_url = if enabled {
            TESTNET_BASE_URL.to_string()
        } else {
            LIVE_BASE_URL.to_string()
        };
        debug!(exchange = %self.name, sandbox = enabled, base_url = %self.base_url, "sandbox mode set");
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (appends timestamp, recvWindow,
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Config symbols use the `BASE/QUOTE` form; the venue wants them fused.
    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn venue_side(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    fn venue_order_type(order_type: OrderType) -> &'static str {
        match order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::StopLimit => "STOP",
            OrderType::TakeProfit => "TAKE_PROFIT",
        }
    }

    async fn get_json(&self, url: &str, what: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {what} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;
        if !status.is_success() {
            anyhow::bail!("Binance GET {what} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceUsdm {
    fn name(&self) -> &str {
        &self.name
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Response rows are arrays; indices 0–5 are
    /// openTime, open, high, low, close, volume.
    #[instrument(skip(self), name = "binance::fetch_ohlcv")]
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<[f64; 6]>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            Self::venue_symbol(symbol),
            timeframe,
            limit
        );
        let body = self.get_json(&url, "/fapi/v1/klines").await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            candles.push([
                arr[0].as_i64().unwrap_or(0) as f64,
                Self::parse_str_f64(&arr[1])?,
                Self::parse_str_f64(&arr[2])?,
                Self::parse_str_f64(&arr[3])?,
                Self::parse_str_f64(&arr[4])?,
                Self::parse_str_f64(&arr[5])?,
            ]);
        }
        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self, request), name = "binance::create_order")]
    async fn create_order(&self, request: &OrderRequest) -> Result<serde_json::Value> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            Self::venue_symbol(&request.symbol),
            Self::venue_side(request.side),
            Self::venue_order_type(request.order_type),
            request.amount
        );
        if let Some(p) = request.price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = &request.params.time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }
        params.push_str(&format!(
            "&newClientOrderId={}",
            request.params.client_order_id
        ));
        if request.params.reduce_only {
            params.push_str("&reduceOnly=true");
        }
        if let Some(stop) = request.params.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(
            symbol = %request.symbol,
            side = %request.side,
            order_type = %request.order_type,
            quantity = request.amount,
            "placing order"
        );

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;
        if !status.is_success() {
            anyhow::bail!("Binance POST /fapi/v1/order returned {status}: {body}");
        }
        debug!(symbol = %request.symbol, "order placed");
        Ok(body)
    }

    /// GET /fapi/v2/positionRisk (signed), filtered to `symbols` when given.
    #[instrument(skip(self), name = "binance::fetch_positions")]
    async fn fetch_positions(&self, symbols: &[String]) -> Result<Vec<serde_json::Value>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let body = self.get_json(&url, "/fapi/v2/positionRisk").await?;

        let wanted: Vec<String> = symbols.iter().map(|s| Self::venue_symbol(s)).collect();
        let positions: Vec<serde_json::Value> = body
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                wanted.is_empty()
                    || p["symbol"]
                        .as_str()
                        .map(|s| wanted.iter().any(|w| w == s))
                        .unwrap_or(false)
            })
            .collect();
        debug!(count = positions.len(), "positions fetched");
        Ok(positions)
    }

    /// GET /fapi/v1/openOrders (signed).
    #[instrument(skip(self), name = "binance::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let params = format!("symbol={}", Self::venue_symbol(symbol));
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/openOrders?{}", self.base_url, qs);
        let body = self.get_json(&url, "/fapi/v1/openOrders").await?;

        let orders = body.as_array().cloned().unwrap_or_default();
        debug!(count = orders.len(), "open orders fetched");
        Ok(orders)
    }

    async fn close(&self) -> Result<()> {
        // reqwest pools connections internally; dropping the client releases
        // them.
        debug!(exchange = %self.name, "exchange client closed");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceUsdm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceUsdm")
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hmac_sha256() {
        let client = BinanceUsdm::new("binanceusdm".into(), "key", "secret");
        // Known-answer: HMAC-SHA256("secret", "a=1") hex.
        let sig = client.sign("a=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, client.sign("a=1"));
        assert_ne!(sig, client.sign("a=2"));
    }

    #[test]
    fn sandbox_mode_switches_base_url() {
        let mut client = BinanceUsdm::new("binanceusdm".into(), "key", "secret");
        assert_eq!(client.base_url, LIVE_BASE_URL);
        client.set_sandbox_mode(true);
        assert_eq!(client.base_url, TESTNET_BASE_URL);
        client.set_sandbox_mode(false);
        assert_eq!(client.base_url, LIVE_BASE_URL);
    }

    #[test]
    fn venue_symbol_strips_the_slash() {
        assert_eq!(BinanceUsdm::venue_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceUsdm::venue_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn order_types_map_to_venue_names() {
        assert_eq!(BinanceUsdm::venue_order_type(OrderType::StopMarket), "STOP_MARKET");
        assert_eq!(BinanceUsdm::venue_order_type(OrderType::Limit), "LIMIT");
        assert_eq!(BinanceUsdm::venue_order_type(OrderType::StopLimit), "STOP");
    }
}
