//! Signed REST client for the USDT-M futures API.
//!
//! Every call passes through the rate-limit governor, carries a 10 s timeout,
//! and retries transport/rate-limit failures up to 3 times with exponential
//! backoff (1 s, 2 s, 4 s, capped at 5 s). Signed endpoints append a
//! millisecond timestamp, a 5000 ms receive window, and an HMAC-SHA256
//! signature of the query string; the API key rides in `X-MBX-APIKEY`.

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ApiCredentials;
use crate::errors::{ExchangeError, ExchangeResult};
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::exchange::rate_limit::{Priority, RateLimitGovernor};
use crate::exchange::types::*;
use crate::models::{now_ms, PositionSide, TradeSide};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_REST_BASE: &str = "https://fapi.asterdex.com";
pub const DEFAULT_WS_BASE: &str = "wss://fstream.asterdex.com";

const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Failures per endpoint inside this window trip a health alert.
const HEALTH_WINDOW: Duration = Duration::from_secs(60);
const HEALTH_THRESHOLD: usize = 5;

/// Parameters for `/fapi/v1/order` and `/fapi/v1/batchOrders`.
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: String,
    pub side: TradeSide,
    pub position_side: PositionSide,
    pub order_type: String,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub close_position: bool,
    pub time_in_force: Option<String>,
    pub new_client_order_id: Option<String>,
}

impl OrderParams {
    pub fn limit(symbol: &str, side: TradeSide, position_side: PositionSide, qty: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: "LIMIT".to_string(),
            quantity: Some(qty),
            price: Some(price),
            stop_price: None,
            reduce_only: false,
            close_position: false,
            time_in_force: Some("GTC".to_string()),
            new_client_order_id: None,
        }
    }

    pub fn market(symbol: &str, side: TradeSide, position_side: PositionSide, qty: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: "MARKET".to_string(),
            quantity: Some(qty),
            price: None,
            stop_price: None,
            reduce_only: false,
            close_position: false,
            time_in_force: None,
            new_client_order_id: None,
        }
    }

    pub fn stop_market(
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        qty: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: "STOP_MARKET".to_string(),
            quantity: Some(qty),
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            close_position: false,
            time_in_force: None,
            new_client_order_id: None,
        }
    }

    pub fn take_profit_market(
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        qty: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: "TAKE_PROFIT_MARKET".to_string(),
            quantity: Some(qty),
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
            close_position: false,
            time_in_force: None,
            new_client_order_id: None,
        }
    }

    /// Post-only entry: GTX time-in-force.
    pub fn post_only(mut self) -> Self {
        self.time_in_force = Some("GTX".to_string());
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// In hedge mode the venue rejects an explicit reduceOnly flag; the
    /// opposing position side already makes the order reducing.
    pub fn query_params(&self, hedge_mode: bool) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("positionSide".to_string(), self.position_side.as_str().to_string()),
            ("type".to_string(), self.order_type.clone()),
        ];
        if let Some(q) = self.quantity {
            params.push(("quantity".to_string(), format_decimal(q)));
        }
        if let Some(p) = self.price {
            params.push(("price".to_string(), format_decimal(p)));
        }
        if let Some(sp) = self.stop_price {
            params.push(("stopPrice".to_string(), format_decimal(sp)));
        }
        if self.close_position {
            params.push(("closePosition".to_string(), "true".to_string()));
        } else if self.reduce_only && !hedge_mode {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if let Some(tif) = &self.time_in_force {
            params.push(("timeInForce".to_string(), tif.clone()));
        }
        if let Some(id) = &self.new_client_order_id {
            params.push(("newClientOrderId".to_string(), id.clone()));
        }
        params
    }

    fn batch_json(&self, hedge_mode: bool) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in self.query_params(hedge_mode) {
            map.insert(k, serde_json::Value::String(v));
        }
        serde_json::Value::Object(map)
    }
}

/// Shortest decimal rendering without scientific notation.
pub fn format_decimal(v: f64) -> String {
    let mut s = format!("{v:.8}");
    while s.contains('.') && (s.ends_with('0') || s.ends_with('.')) {
        s.pop();
    }
    s
}

pub struct ExchangeClient {
    http: reqwest::Client,
    rest_base: String,
    credentials: ApiCredentials,
    governor: Arc<RateLimitGovernor>,
    broadcaster: Option<StatusBroadcaster>,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ExchangeClient {
    pub fn new(
        rest_base: impl Into<String>,
        credentials: ApiCredentials,
        governor: Arc<RateLimitGovernor>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent("CascadeBot/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            rest_base: rest_base.into(),
            credentials,
            governor,
            broadcaster: None,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: StatusBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(String, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Track per-endpoint failures; 5+ inside 60 s raises a health alert.
    fn note_failure(&self, path: &str, err: &ExchangeError) {
        let now = Instant::now();
        let mut failures = self.failures.lock();
        let entry = failures.entry(path.to_string()).or_default();
        entry.push_back(now);
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > HEALTH_WINDOW {
                entry.pop_front();
            } else {
                break;
            }
        }
        let health_alert = entry.len() >= HEALTH_THRESHOLD;
        if let Some(bus) = &self.broadcaster {
            bus.emit(StatusEvent::ApiError {
                code: format!("{err}"),
                reason: format!("{path} failed"),
                component: "exchange_client".to_string(),
                health_alert,
            });
        } else if health_alert {
            warn!(path = %path, "endpoint failing persistently");
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
        weight: u32,
        is_order: bool,
        priority: Priority,
    ) -> ExchangeResult<T> {
        let mut backoff = Duration::from_secs(1);
        let mut last_err = ExchangeError::Transport("no attempt made".to_string());

        for attempt in 1..=MAX_ATTEMPTS {
            self.governor.acquire(weight, is_order, priority).await?;

            let query = if signed {
                let mut signed_params = params.clone();
                signed_params.push(("timestamp".to_string(), now_ms().to_string()));
                signed_params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
                let unsigned = Self::encode_query(&signed_params);
                let signature = self.sign(&unsigned);
                format!("{unsigned}&signature={signature}")
            } else {
                Self::encode_query(&params)
            };

            let url = if query.is_empty() {
                format!("{}{}", self.rest_base, path)
            } else {
                format!("{}{}?{}", self.rest_base, path, query)
            };

            let mut request = self.http.request(method.clone(), &url);
            if signed || path.contains("listenKey") {
                request = request.header("X-MBX-APIKEY", &self.credentials.api_key);
            }

            let outcome = match request.send().await {
                Ok(response) => {
                    let weight_hdr = header_u32(&response, "x-mbx-used-weight-1m");
                    let order_hdr = header_u32(&response, "x-mbx-order-count-1m");
                    self.governor.sync_from_headers(weight_hdr, order_hdr);

                    if response.status().is_success() {
                        let body = response
                            .text()
                            .await
                            .map_err(|e| ExchangeError::Transport(e.to_string()))?;
                        return serde_json::from_str::<T>(&body).map_err(|e| {
                            ExchangeError::DataIntegrity(format!("decoding {path}: {e}"))
                        });
                    }

                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    Err(parse_api_error(status.as_u16(), &body))
                }
                Err(e) => Err(ExchangeError::Transport(e.to_string())),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.note_failure(path, &err);
                    if !err.is_retryable() || attempt == MAX_ATTEMPTS {
                        return Err(err);
                    }
                    debug!(path = %path, attempt, error = %err, "retrying after backoff");
                    last_err = err;
                    sleep(backoff.min(BACKOFF_CAP)).await;
                    backoff *= 2;
                }
            }
        }

        Err(last_err)
    }

    // -- public market data --------------------------------------------------

    pub async fn exchange_info(&self) -> ExchangeResult<ExchangeInfo> {
        self.send(Method::GET, "/fapi/v1/exchangeInfo", vec![], false, 1, false, Priority::Medium)
            .await
    }

    pub async fn ticker_price(&self, symbol: &str) -> ExchangeResult<PriceTicker> {
        self.send(
            Method::GET,
            "/fapi/v1/ticker/price",
            vec![("symbol".to_string(), symbol.to_string())],
            false,
            1,
            false,
            Priority::High,
        )
        .await
    }

    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> ExchangeResult<Vec<Candle>> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(t) = start_time {
            params.push(("startTime".to_string(), t.to_string()));
        }
        if let Some(t) = end_time {
            params.push(("endTime".to_string(), t.to_string()));
        }
        let weight = if limit <= 100 { 1 } else if limit <= 500 { 2 } else { 5 };
        let rows: Vec<Vec<serde_json::Value>> = self
            .send(Method::GET, "/fapi/v1/klines", params, false, weight, false, Priority::Low)
            .await?;
        Ok(rows.iter().filter_map(|r| Candle::from_row(r)).collect())
    }

    // -- signed account/trade ------------------------------------------------

    pub async fn balances(&self) -> ExchangeResult<Vec<AccountBalance>> {
        self.send(Method::GET, "/fapi/v2/balance", vec![], true, 5, false, Priority::High)
            .await
    }

    pub async fn available_usdt(&self) -> ExchangeResult<f64> {
        let balances = self.balances().await?;
        Ok(balances
            .iter()
            .find(|b| b.asset == "USDT")
            .map(|b| b.available_balance)
            .unwrap_or(0.0))
    }

    pub async fn position_risk(&self) -> ExchangeResult<Vec<PositionRisk>> {
        self.send(Method::GET, "/fapi/v2/positionRisk", vec![], true, 5, false, Priority::High)
            .await
    }

    pub async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OpenOrder>> {
        let (params, weight) = match symbol {
            Some(s) => (vec![("symbol".to_string(), s.to_string())], 1),
            None => (vec![], 40),
        };
        self.send(Method::GET, "/fapi/v1/openOrders", params, true, weight, false, Priority::High)
            .await
    }

    pub async fn place_order(&self, order: &OrderParams, hedge_mode: bool, priority: Priority) -> ExchangeResult<OrderAck> {
        self.send(
            Method::POST,
            "/fapi/v1/order",
            order.query_params(hedge_mode),
            true,
            1,
            true,
            priority,
        )
        .await
    }

    /// Batch placement. The response is positional: each element is either an
    /// ack or an `{code, msg}` error object.
    pub async fn place_batch_orders(
        &self,
        orders: &[OrderParams],
        hedge_mode: bool,
        priority: Priority,
    ) -> ExchangeResult<Vec<ExchangeResult<OrderAck>>> {
        let batch: Vec<serde_json::Value> =
            orders.iter().map(|o| o.batch_json(hedge_mode)).collect();
        let params = vec![(
            "batchOrders".to_string(),
            serde_json::to_string(&batch)
                .map_err(|e| ExchangeError::DataIntegrity(e.to_string()))?,
        )];
        let rows: Vec<serde_json::Value> = self
            .send(Method::POST, "/fapi/v1/batchOrders", params, true, 5, true, priority)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                if let Some(code) = row.get("code").and_then(|c| c.as_i64()) {
                    let msg = row
                        .get("msg")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default()
                        .to_string();
                    Err(ExchangeError::from_api(code, msg))
                } else {
                    serde_json::from_value(row)
                        .map_err(|e| ExchangeError::DataIntegrity(e.to_string()))
                }
            })
            .collect())
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: i64, priority: Priority) -> ExchangeResult<OrderAck> {
        self.send(
            Method::DELETE,
            "/fapi/v1/order",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("orderId".to_string(), order_id.to_string()),
            ],
            true,
            1,
            false,
            priority,
        )
        .await
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let _: serde_json::Value = self
            .send(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("leverage".to_string(), leverage.to_string()),
                ],
                true,
                1,
                false,
                Priority::Medium,
            )
            .await?;
        Ok(())
    }

    pub async fn position_mode(&self) -> ExchangeResult<bool> {
        let info: PositionModeInfo = self
            .send(Method::GET, "/fapi/v1/positionSide/dual", vec![], true, 30, false, Priority::Medium)
            .await?;
        Ok(info.dual_side_position)
    }

    pub async fn set_position_mode(&self, dual: bool) -> ExchangeResult<()> {
        let _: serde_json::Value = self
            .send(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                vec![("dualSidePosition".to_string(), dual.to_string())],
                true,
                1,
                false,
                Priority::Medium,
            )
            .await?;
        Ok(())
    }

    pub async fn create_listen_key(&self) -> ExchangeResult<String> {
        let key: ListenKey = self
            .send(Method::POST, "/fapi/v1/listenKey", vec![], false, 1, false, Priority::High)
            .await?;
        Ok(key.listen_key)
    }

    pub async fn keepalive_listen_key(&self) -> ExchangeResult<()> {
        let _: serde_json::Value = self
            .send(Method::PUT, "/fapi/v1/listenKey", vec![], false, 1, false, Priority::High)
            .await?;
        Ok(())
    }

    pub async fn user_trades(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<UserTrade>> {
        self.send(
            Method::GET,
            "/fapi/v1/userTrades",
            vec![
                ("symbol".to_string(), symbol.to_string()),
                ("limit".to_string(), limit.to_string()),
            ],
            true,
            5,
            false,
            Priority::Low,
        )
        .await
    }

    pub async fn income(&self, symbol: Option<&str>, income_type: Option<&str>, limit: u32) -> ExchangeResult<Vec<IncomeRecord>> {
        let mut params = vec![("limit".to_string(), limit.to_string())];
        if let Some(s) = symbol {
            params.push(("symbol".to_string(), s.to_string()));
        }
        if let Some(t) = income_type {
            params.push(("incomeType".to_string(), t.to_string()));
        }
        self.send(Method::GET, "/fapi/v1/income", params, true, 30, false, Priority::Low)
            .await
    }
}

fn header_u32(response: &reqwest::Response, name: &str) -> Option<u32> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn parse_api_error(status: u16, body: &str) -> ExchangeError {
    #[derive(serde::Deserialize)]
    struct ApiErrorBody {
        code: i64,
        msg: String,
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => ExchangeError::from_api(parsed.code, parsed.msg),
        Err(_) if status == 429 => ExchangeError::RateLimit {
            msg: format!("http 429: {body}"),
        },
        Err(_) => ExchangeError::Api {
            code: -(status as i64),
            msg: body.to_string(),
        },
    }
}

fn urlencode(value: &str) -> String {
    // Query values here are alphanumerics plus `[]{}",:.` from batch JSON.
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSettings;

    fn client() -> ExchangeClient {
        let governor = RateLimitGovernor::new(RateLimitSettings::default());
        ExchangeClient::new(
            "https://example.invalid",
            ApiCredentials {
                api_key: "key".to_string(),
                api_secret: "secret".to_string(),
            },
            governor,
        )
    }

    #[test]
    fn signature_matches_reference_vector() {
        let c = client();
        // HMAC-SHA256("secret", "symbol=BTCUSDT&timestamp=1") reference.
        let sig = c.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, c.sign("symbol=BTCUSDT&timestamp=1"));
        assert_ne!(sig, c.sign("symbol=ETHUSDT&timestamp=1"));
    }

    #[test]
    fn decimal_formatting_trims_trailing_zeros() {
        assert_eq!(format_decimal(0.01000000), "0.01");
        assert_eq!(format_decimal(60000.0), "60000");
        assert_eq!(format_decimal(0.99990000), "0.9999");
        assert_eq!(format_decimal(8000.12345678), "8000.12345678");
    }

    #[test]
    fn order_params_respect_hedge_mode_reduce_only() {
        let order = OrderParams::stop_market("BTCUSDT", TradeSide::Sell, PositionSide::Long, 0.01, 57_000.0);
        let one_way: Vec<_> = order.query_params(false);
        assert!(one_way.iter().any(|(k, v)| k == "reduceOnly" && v == "true"));
        // Hedge mode: the LONG position side already makes a SELL reducing.
        let hedge: Vec<_> = order.query_params(true);
        assert!(!hedge.iter().any(|(k, _)| k == "reduceOnly"));
        assert!(hedge.iter().any(|(k, v)| k == "positionSide" && v == "LONG"));
    }

    #[test]
    fn api_error_body_parses_to_taxonomy() {
        let err = parse_api_error(400, r#"{"code":-4061,"msg":"position side mismatch"}"#);
        assert!(matches!(err, ExchangeError::PositionModeMismatch { .. }));
        let err = parse_api_error(429, "slow down");
        assert!(matches!(err, ExchangeError::RateLimit { .. }));
    }

    #[test]
    fn querystring_encoding_handles_batch_json() {
        let encoded = ExchangeClient::encode_query(&[(
            "batchOrders".to_string(),
            r#"[{"symbol":"BTCUSDT"}]"#.to_string(),
        )]);
        assert!(encoded.starts_with("batchOrders=%5B%7B%22symbol%22"));
    }
}
