// =============================================================================
// Binance USDⓈ-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests send
// X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate minor
// clock drift between the bot and the exchange.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::types::Kline;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// A raw position row from GET /fapi/v2/positionRisk. `position_amt` is
/// signed: positive long, negative short.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub position_amt: f64,
    pub entry_price: f64,
}

/// Result of a filled order.
#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub order_id: String,
    pub executed_qty: f64,
    pub avg_price: f64,
    pub ts: i64,
}

/// Futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client against the production futures endpoint.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://fapi.binance.com")
    }

    /// Create a client against an explicit base URL (testnet, mocks).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 over the query string, hex-encoded the way the signed
    /// endpoints expect it.
    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac key length is unrestricted");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Milliseconds since the UNIX epoch, used as the request timestamp.
    pub fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Assemble the full URL for a signed endpoint: caller params plus
    /// timestamp, recvWindow, and the signature over all of them.
    fn signed_url(&self, endpoint: &str, params: &str) -> String {
        let mut query = String::with_capacity(params.len() + 96);
        if !params.is_empty() {
            query.push_str(params);
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={RECV_WINDOW}",
            Self::timestamp_ms()
        ));
        let signature = self.sign(&query);
        format!("{}{}?{}&signature={}", self.base_url, endpoint, query, signature)
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

    // -------------------------------------------------------------------------
    // Account / positions
    // -------------------------------------------------------------------------

    /// GET /fapi/v2/balance (signed) — available balance of `asset`.
    pub async fn available_balance(&self, asset: &str) -> Result<f64> {
        let url = self.signed_url("/fapi/v2/balance", "");
        let body = self.get_json(&url, "/fapi/v2/balance").await?;

        let rows = body
            .as_array()
            .context("balance response is not an array")?;
        for row in rows {
            if row["asset"].as_str() == Some(asset) {
                let free = Self::parse_str_f64(&row["availableBalance"])?;
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }
        warn!(asset, "asset not found in balances, returning 0.0");
        Ok(0.0)
    }

    /// GET /fapi/v2/positionRisk (signed) — open positions for `symbol`.
    /// Rows with a zero position amount are filtered out.
    pub async fn position_risk(&self, symbol: &str) -> Result<Vec<VenuePosition>> {
        let url = self.signed_url("/fapi/v2/positionRisk", &format!("symbol={symbol}"));
        let body = self.get_json(&url, "/fapi/v2/positionRisk").await?;

        let rows = body
            .as_array()
            .context("positionRisk response is not an array")?;
        let mut positions = Vec::new();
        for row in rows {
            let amt = Self::parse_str_f64(&row["positionAmt"])?;
            if amt == 0.0 {
                continue;
            }
            positions.push(VenuePosition {
                symbol: row["symbol"].as_str().unwrap_or(symbol).to_string(),
                position_amt: amt,
                entry_price: Self::parse_str_f64(&row["entryPrice"])?,
            });
        }
        debug!(symbol, count = positions.len(), "positions retrieved");
        Ok(positions)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a MARKET order.
    ///
    /// Opens are plain MARKET orders; closes set `reduceOnly=true` so a stale
    /// quantity can never flip the position.
    pub async fn market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderResponse> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT"
        );
        if reduce_only {
            params.push_str("&reduceOnly=true");
        }

        let url = self.signed_url("/fapi/v1/order", &params);

        debug!(symbol, side, quantity, reduce_only, "placing market order");

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

        let order_id = body["orderId"]
            .as_u64()
            .map(|id| id.to_string())
            .context("order response missing orderId")?;
        let executed_qty = Self::parse_str_f64(&body["executedQty"])?;
        let avg_price = Self::parse_str_f64(&body["avgPrice"])?;
        let ts = body["updateTime"]
            .as_i64()
            .unwrap_or_else(Self::timestamp_ms);

        debug!(symbol, side, order_id = %order_id, executed_qty, avg_price, "order filled");
        Ok(OrderResponse {
            order_id,
            executed_qty,
            avg_price,
            ts,
        })
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
    ///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
    ) -> Result<Vec<Kline>> {
        let mut url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={start}"));
        }

        let body = self.get_json(&url, "/fapi/v1/klines").await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut klines = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 11 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            klines.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
                volume: Self::parse_str_f64(&arr[5])?,
                close_time: arr[6].as_i64().unwrap_or(0),
                quote_volume: Self::parse_str_f64(&arr[7])?,
                trades: arr[8].as_i64().unwrap_or(0),
                taker_buy_base: Self::parse_str_f64(&arr[9])?,
                taker_buy_quote: Self::parse_str_f64(&arr[10])?,
            });
        }

        debug!(symbol, interval, count = klines.len(), "klines fetched");
        Ok(klines)
    }

    /// GET /fapi/v1/exchangeInfo — LOT_SIZE step for `symbol`.
    pub async fn lot_step(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.get_json(&url, "/fapi/v1/exchangeInfo").await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .context("symbol not found in exchangeInfo response")?;

        let step = info["filters"]
            .as_array()
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            })
            .and_then(|f| f["stepSize"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .context("LOT_SIZE filter missing stepSize")?;

        debug!(symbol, step, "lot step retrieved");
        Ok(step)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// The REST API quotes most numbers as strings; accept either shape.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(n) = val.as_f64() {
            return Ok(n);
        }
        val.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .with_context(|| format!("value is not numeric: {val}"))
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client = BinanceClient::new("key", "secret");
        let sig = client.sign("symbol=BTCUSDT&side=BUY");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, client.sign("symbol=BTCUSDT&side=BUY"));
        assert_ne!(sig, client.sign("symbol=BTCUSDT&side=SELL"));
    }

    #[test]
    fn debug_redacts_credentials() {
        let client = BinanceClient::new("visible-key", "visible-secret");
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("visible-key"));
        assert!(!rendered.contains("visible-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn parse_str_f64_accepts_both_shapes() {
        assert!(
            (BinanceClient::parse_str_f64(&serde_json::json!("37020.5")).unwrap() - 37020.5).abs()
                < 1e-12
        );
        assert!(
            (BinanceClient::parse_str_f64(&serde_json::json!(12.25)).unwrap() - 12.25).abs()
                < 1e-12
        );
        assert!(BinanceClient::parse_str_f64(&serde_json::json!(null)).is_err());
        assert!(BinanceClient::parse_str_f64(&serde_json::json!("abc")).is_err());
    }
}
