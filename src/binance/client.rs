// =============================================================================
// ExchangeClient — signed REST transport to the perpetual-futures exchange
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header; the signature covers exactly the same
// parameter encoding that is sent on the wire (see `normalize_param_value`).
//
// Time sync: the local-to-server clock offset lives behind an atomic so every
// request reads it fresh rather than capturing it once at construction.
// Re-synced on startup and on every `-1021`.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::errors::ExchangeError;
use crate::types::{Candle, PrecisionFilters};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: i64 = 60_000;
const MAX_SIGNED_RETRIES: u32 = 5;
const BASE_BACKOFF_SECS: f64 = 1.0;
/// Flat per-request weight charged against the local tracker before we even
/// dispatch; the exact header-reported weight overwrites this once the
/// response comes back.
const REQUEST_WEIGHT: u32 = 1;

/// A single signed request parameter. Order is preserved — the same order is
/// used both in the wire query string and the signature input.
#[derive(Debug, Clone)]
pub struct Param(pub &'static str, pub ParamValue);

#[derive(Debug, Clone)]
pub enum ParamValue {
    Str(String),
    F64(f64),
    I64(i64),
    Bool(bool),
}

impl ParamValue {
    /// Shortest fixed-point serialization used by both the signature and the
    /// request body. Floats are formatted at 15 decimal places, trailing
    /// zeros stripped, then a trailing `.` stripped; an empty result (e.g.
    /// `0.000...0`) falls back to `"0"`. Bools serialize as lowercase
    /// `true`/`false`.
    fn normalize(&self) -> String {
        match self {
            ParamValue::Str(s) => s.clone(),
            ParamValue::I64(n) => n.to_string(),
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::F64(f) => {
                let s = format!("{:.15}", f);
                let s = s.trim_end_matches('0').trim_end_matches('.');
                if s.is_empty() {
                    "0".to_string()
                } else {
                    s.to_string()
                }
            }
        }
    }
}

/// Build the exact query string (insertion order preserved, percent-encoded
/// values) used both for the HMAC input and the HTTP request.
fn build_query(params: &[Param]) -> String {
    params
        .iter()
        .map(|Param(key, value)| format!("{key}={}", urlencode(&value.normalize())))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Signed REST + websocket transport to the exchange. Cheaply cloneable —
/// holds its own connection pool and an HMAC signer.
#[derive(Clone)]
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    /// local_now + offset = adjusted server time.
    time_offset_ms: std::sync::Arc<AtomicI64>,
    pub rate_limit: std::sync::Arc<RateLimitTracker>,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            time_offset_ms: std::sync::Arc::new(AtomicI64::new(0)),
            rate_limit: std::sync::Arc::new(RateLimitTracker::new()),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    fn adjusted_timestamp(&self) -> i64 {
        Self::local_now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Time sync
    // -------------------------------------------------------------------------

    /// Sample server time three ways (t_before, server, t_after) and set
    /// `offset = server - (t_before+t_after)/2`. Called at startup and on
    /// every `-1021`.
    #[instrument(skip(self))]
    pub async fn sync_time(&self) -> Result<(), ExchangeError> {
        let t_before = Self::local_now_ms();
        let url = format!("{}/fapi/v1/time", self.base_url);
        let resp = self.client.get(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        let t_after = Self::local_now_ms();

        let server_time = body["serverTime"].as_i64().ok_or(ExchangeError::Rejected {
            code: 0,
            message: "missing serverTime in response".to_string(),
        })?;

        let offset = server_time - (t_before + t_after) / 2;
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        debug!(offset, "time sync complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Signed request core — retry/backoff policy
    // -------------------------------------------------------------------------

    /// Execute a signed request with the five-attempt retry policy:
    /// -1021 -> resync + `base*2^attempt`; 418 -> sleep until ban lifts
    /// (capped at 120s); 429/-1003 -> `min(base*2*2^attempt, 60s)`; anything
    /// else fails fast.
    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<Param>,
    ) -> Result<serde_json::Value, ExchangeError> {
        if !self.rate_limit.can_send_request(REQUEST_WEIGHT) {
            return Err(ExchangeError::RateLimited);
        }

        for attempt in 0..MAX_SIGNED_RETRIES {
            let ts = self.adjusted_timestamp();
            let mut full_params = params.clone();
            full_params.push(Param("timestamp", ParamValue::I64(ts)));
            full_params.push(Param("recvWindow", ParamValue::I64(RECV_WINDOW_MS)));

            let query = build_query(&full_params);
            let signature = self.sign(&query);
            let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

            let req = self.client.request(method.clone(), &url);
            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt + 1 == MAX_SIGNED_RETRIES {
                        return Err(ExchangeError::Transport(e.to_string()));
                    }
                    tokio::time::sleep(Duration::from_secs_f64(BASE_BACKOFF_SECS * 2f64.powi(attempt as i32))).await;
                    continue;
                }
            };

            let status = resp.status();
            self.rate_limit.update_from_headers(resp.headers());
            let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

            if status.is_success() {
                return Ok(body);
            }

            let code = body["code"].as_i64().unwrap_or(0);
            let message = body["msg"].as_str().unwrap_or("").to_string();

            if code == -1021 {
                warn!(attempt, "timestamp out of recvWindow, resyncing");
                let _ = self.sync_time().await;
                if attempt + 1 == MAX_SIGNED_RETRIES {
                    return Err(ExchangeError::TimestampOutOfWindow);
                }
                tokio::time::sleep(Duration::from_secs_f64(BASE_BACKOFF_SECS * 2f64.powi(attempt as i32))).await;
                continue;
            }

            if status == StatusCode::IM_A_TEAPOT {
                let until_ms = extract_banned_until(&message).unwrap_or(Self::local_now_ms() + 60_000);
                let now = Self::local_now_ms();
                let wait_secs = ((until_ms - now) as f64 / 1000.0 + 1.0).min(120.0).max(0.0);
                warn!(wait_secs, "IP banned, sleeping until ban lifts");
                tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;
                if attempt + 1 == MAX_SIGNED_RETRIES {
                    return Err(ExchangeError::Banned { until_ms });
                }
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS || code == -1003 {
                let delay = (BASE_BACKOFF_SECS * 2.0 * 2f64.powi(attempt as i32)).min(60.0);
                warn!(delay, "rate limited, backing off");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                if attempt + 1 == MAX_SIGNED_RETRIES {
                    return Err(ExchangeError::RateLimited);
                }
                continue;
            }

            // Any other error — fail fast, no retry.
            return Err(ExchangeError::Rejected { code, message });
        }

        params.clear();
        Err(ExchangeError::RetriesExhausted)
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_account(&self) -> Result<serde_json::Value, ExchangeError> {
        self.signed_request(reqwest::Method::GET, "/fapi/v2/account", vec![]).await
    }

    #[instrument(skip(self))]
    pub async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let account = self.get_account().await?;
        let assets = account["assets"].as_array().cloned().unwrap_or_default();
        for a in assets {
            if a["asset"].as_str() == Some(asset) {
                return Ok(a["walletBalance"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0));
            }
        }
        Ok(0.0)
    }

    #[instrument(skip(self))]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<serde_json::Value, ExchangeError> {
        self.signed_request(
            reqwest::Method::POST,
            "/fapi/v1/leverage",
            vec![
                Param("symbol", ParamValue::Str(symbol.to_string())),
                Param("leverage", ParamValue::I64(leverage as i64)),
            ],
        )
        .await
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    #[instrument(skip(self, price, time_in_force))]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
        reduce_only: bool,
    ) -> Result<serde_json::Value, ExchangeError> {
        if !self.rate_limit.can_place_order() {
            return Err(ExchangeError::RateLimited);
        }

        let mut params = vec![
            Param("symbol", ParamValue::Str(symbol.to_string())),
            Param("side", ParamValue::Str(side.to_string())),
            Param("type", ParamValue::Str(order_type.to_string())),
            Param("quantity", ParamValue::F64(quantity)),
        ];
        if let Some(p) = price {
            params.push(Param("price", ParamValue::F64(p)));
        }
        if let Some(tif) = time_in_force {
            params.push(Param("timeInForce", ParamValue::Str(tif.to_string())));
        }
        if reduce_only {
            params.push(Param("reduceOnly", ParamValue::Bool(true)));
        }

        debug!(symbol, side, order_type, quantity, "placing order");
        let result = self.signed_request(reqwest::Method::POST, "/fapi/v1/order", params).await;
        if result.is_ok() {
            self.rate_limit.record_order_sent();
        }
        result
    }

    #[instrument(skip(self))]
    pub async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<serde_json::Value, ExchangeError> {
        self.signed_request(
            reqwest::Method::DELETE,
            "/fapi/v1/order",
            vec![
                Param("symbol", ParamValue::Str(symbol.to_string())),
                Param("orderId", ParamValue::I64(order_id as i64)),
            ],
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, symbol: &str, order_id: u64) -> Result<serde_json::Value, ExchangeError> {
        self.signed_request(
            reqwest::Method::GET,
            "/fapi/v1/order",
            vec![
                Param("symbol", ParamValue::Str(symbol.to_string())),
                Param("orderId", ParamValue::I64(order_id as i64)),
            ],
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let params = match symbol {
            Some(s) => vec![Param("symbol", ParamValue::Str(s.to_string()))],
            None => vec![],
        };
        let body = self.signed_request(reqwest::Method::GET, "/fapi/v1/openOrders", params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn get_user_trades(&self, symbol: &str, start_time: Option<i64>, limit: u32) -> Result<Vec<serde_json::Value>, ExchangeError> {
        let mut params = vec![
            Param("symbol", ParamValue::Str(symbol.to_string())),
            Param("limit", ParamValue::I64(limit as i64)),
        ];
        if let Some(st) = start_time {
            params.push(Param("startTime", ParamValue::I64(st)));
        }
        let body = self.signed_request(reqwest::Method::GET, "/fapi/v1/userTrades", params).await?;
        Ok(body.as_array().cloned().unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub async fn get_commission_rate(&self, symbol: &str) -> (f64, f64) {
        let result = self
            .signed_request(
                reqwest::Method::GET,
                "/fapi/v1/commissionRate",
                vec![Param("symbol", ParamValue::Str(symbol.to_string()))],
            )
            .await;

        match result {
            Ok(body) => {
                let maker = body["makerCommissionRate"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0002);
                let taker = body["takerCommissionRate"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0004);
                (maker, taker)
            }
            Err(e) => {
                warn!(error = %e, "commission rate fetch failed, using hard-coded fallback");
                (0.0002, 0.0004)
            }
        }
    }

    // -------------------------------------------------------------------------
    // User-data listen key lifecycle
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn create_listen_key(&self) -> Result<String, ExchangeError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self.client.post(&url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or(ExchangeError::Rejected { code: 0, message: "missing listenKey".to_string() })
    }

    /// Keepalive with up to 3 retries on 1/2/4-minute backoff. Returns `Err`
    /// only after all retries are exhausted — the caller (hub) is expected to
    /// recreate the key via its reconnect path in that case.
    #[instrument(skip(self))]
    pub async fn keepalive_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let delays = [60.0, 120.0, 240.0];
        let mut last_err = ExchangeError::RetriesExhausted;
        for (i, delay) in delays.iter().enumerate() {
            let url = format!("{}/fapi/v1/listenKey", self.base_url);
            match self.client.put(&url).query(&[("listenKey", listen_key)]).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => last_err = ExchangeError::Rejected { code: 0, message: resp.status().to_string() },
                Err(e) => last_err = ExchangeError::Transport(e.to_string()),
            }
            if i + 1 < delays.len() {
                tokio::time::sleep(Duration::from_secs_f64(*delay)).await;
            }
        }
        Err(last_err)
    }

    #[instrument(skip(self))]
    pub async fn close_listen_key(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.client.delete(&url).query(&[("listenKey", listen_key)]).send().await?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// Fetch klines paginated by `startTime` in chunks of <=1500, de-duplicated
    /// by `open_time`. Retries transport errors three times with 2/4/6s delays.
    #[instrument(skip(self))]
    pub async fn get_klines(&self, symbol: &str, interval: &str, total: usize) -> Result<Vec<Candle>, ExchangeError> {
        let mut out: Vec<Candle> = Vec::with_capacity(total);
        let mut end_time: Option<i64> = None;

        while out.len() < total {
            let chunk = (total - out.len()).min(1500);
            let mut url = format!(
                "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
                self.base_url, symbol, interval, chunk
            );
            if let Some(et) = end_time {
                url.push_str(&format!("&endTime={et}"));
            }

            let body = self.get_with_retry(&url).await?;
            let raw = body.as_array().cloned().unwrap_or_default();
            if raw.is_empty() {
                break;
            }

            let mut page = Vec::with_capacity(raw.len());
            for entry in &raw {
                let arr = match entry.as_array() {
                    Some(a) if a.len() >= 11 => a,
                    _ => {
                        warn!("skipping malformed kline entry");
                        continue;
                    }
                };
                page.push(Candle {
                    open_time: arr[0].as_i64().unwrap_or(0),
                    open: parse_str_f64(&arr[1]),
                    high: parse_str_f64(&arr[2]),
                    low: parse_str_f64(&arr[3]),
                    close: parse_str_f64(&arr[4]),
                    volume: parse_str_f64(&arr[5]),
                    close_time: arr[6].as_i64().unwrap_or(0),
                });
            }

            let oldest_open_time = page.first().map(|c| c.open_time);
            out.extend(page);
            end_time = oldest_open_time.map(|t| t - 1);

            if raw.len() < chunk {
                break;
            }
        }

        out.sort_by_key(|c| c.open_time);
        out.dedup_by_key(|c| c.open_time);
        Ok(out)
    }

    async fn get_with_retry(&self, url: &str) -> Result<serde_json::Value, ExchangeError> {
        if !self.rate_limit.can_send_request(REQUEST_WEIGHT) {
            return Err(ExchangeError::RateLimited);
        }

        let delays = [2.0, 4.0, 6.0];
        let mut last_err = ExchangeError::RetriesExhausted;
        for (i, delay) in delays.iter().enumerate() {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.json().await.map_err(ExchangeError::from);
                }
                Ok(resp) => last_err = ExchangeError::Rejected { code: 0, message: resp.status().to_string() },
                Err(e) => last_err = ExchangeError::Transport(e.to_string()),
            }
            if i + 1 < delays.len() {
                tokio::time::sleep(Duration::from_secs_f64(*delay)).await;
            }
        }
        Err(last_err)
    }

    #[instrument(skip(self))]
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let body = self.get_with_retry(&url).await?;
        Ok(body["markPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    #[instrument(skip(self))]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let body = self.get_with_retry(&url).await?;
        Ok(body["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0))
    }

    /// Fetch precision filters (`LOT_SIZE`, `PRICE_FILTER`, `MIN_NOTIONAL`)
    /// for a symbol via `/fapi/v1/exchangeInfo`.
    #[instrument(skip(self))]
    pub async fn get_exchange_info(&self, symbol: &str) -> Result<PrecisionFilters, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.get_with_retry(&url).await?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or(ExchangeError::Rejected { code: 0, message: "symbol not found in exchangeInfo".to_string() })?;

        let mut filters = PrecisionFilters {
            step_size: 0.001,
            tick_size: 0.1,
            min_notional: 5.0,
            min_qty: 0.001,
            max_qty: f64::MAX,
        };

        if let Some(arr) = entry["filters"].as_array() {
            for f in arr {
                match f["filterType"].as_str() {
                    Some("LOT_SIZE") => {
                        filters.step_size = f["stepSize"].as_str().and_then(|s| s.parse().ok()).unwrap_or(filters.step_size);
                        filters.min_qty = f["minQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(filters.min_qty);
                        filters.max_qty = f["maxQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(filters.max_qty);
                    }
                    Some("PRICE_FILTER") => {
                        filters.tick_size = f["tickSize"].as_str().and_then(|s| s.parse().ok()).unwrap_or(filters.tick_size);
                    }
                    Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                        filters.min_notional = f["notional"]
                            .as_str()
                            .or_else(|| f["minNotional"].as_str())
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(filters.min_notional);
                    }
                    _ => {}
                }
            }
        }

        Ok(filters)
    }
}

fn parse_str_f64(val: &serde_json::Value) -> f64 {
    val.as_str().and_then(|s| s.parse().ok()).or_else(|| val.as_f64()).unwrap_or(0.0)
}

/// Parse `banned until <ms>` out of an exchange error message.
fn extract_banned_until(message: &str) -> Option<i64> {
    let idx = message.find("banned until ")?;
    let rest = &message[idx + "banned until ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
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
    fn normalize_float_strips_trailing_zeros() {
        assert_eq!(ParamValue::F64(1.5).normalize(), "1.5");
        assert_eq!(ParamValue::F64(0.0).normalize(), "0");
        assert_eq!(ParamValue::F64(0.001).normalize(), "0.001");
    }

    #[test]
    fn normalize_bool_is_lowercase_string() {
        assert_eq!(ParamValue::Bool(true).normalize(), "true");
        assert_eq!(ParamValue::Bool(false).normalize(), "false");
    }

    #[test]
    fn build_query_preserves_param_order() {
        let params = vec![
            Param("symbol", ParamValue::Str("BTCUSDT".to_string())),
            Param("side", ParamValue::Str("BUY".to_string())),
            Param("quantity", ParamValue::F64(0.01)),
        ];
        assert_eq!(build_query(&params), "symbol=BTCUSDT&side=BUY&quantity=0.01");
    }

    #[test]
    fn extract_banned_until_parses_embedded_timestamp() {
        let msg = "Way too many requests; IP banned until 1700000000000.";
        assert_eq!(extract_banned_until(msg), Some(1_700_000_000_000));
    }

    #[test]
    fn extract_banned_until_absent_returns_none() {
        assert_eq!(extract_banned_until("some other error"), None);
    }
}
