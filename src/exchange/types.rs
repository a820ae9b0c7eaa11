//! Wire types for the USDT-M futures REST and stream endpoints.
//!
//! The venue serializes most numbers as strings and adds fields depending on
//! mode and endpoint, so parsing is permissive: unknown fields are preserved
//! where a payload is echoed onward and numeric strings decode through
//! forgiving helpers instead of failing the whole message.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::{PositionSide, TradeSide};

/// Decode `"123.45"` (or a bare number) as f64; empty strings become 0.
pub fn f64_from_str<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(value_as_f64(&v))
}

fn value_as_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// REST responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub price_precision: u32,
    #[serde(default)]
    pub quantity_precision: u32,
    #[serde(default)]
    pub filters: Vec<RawFilter>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One entry of the per-symbol filter array. Only the fields the catalog
/// consumes are typed; the rest ride along untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFilter {
    pub filter_type: String,
    #[serde(default, deserialize_with = "opt_f64_from_str")]
    pub tick_size: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_from_str")]
    pub step_size: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_from_str")]
    pub min_qty: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_from_str")]
    pub notional: Option<f64>,
    #[serde(default, deserialize_with = "opt_f64_from_str")]
    pub min_notional: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn opt_f64_from_str<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().map(value_as_f64))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceTicker {
    pub symbol: String,
    #[serde(deserialize_with = "f64_from_str")]
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub asset: String,
    #[serde(deserialize_with = "f64_from_str")]
    pub balance: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub available_balance: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(deserialize_with = "f64_from_str")]
    pub position_amt: f64,
    #[serde(deserialize_with = "f64_from_str")]
    pub entry_price: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub leverage: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub liquidation_price: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub mark_price: f64,
    #[serde(default, deserialize_with = "f64_from_str", alias = "unRealizedProfit")]
    pub unrealized_profit: f64,
    #[serde(default = "default_position_side")]
    pub position_side: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_position_side() -> String {
    "BOTH".to_string()
}

impl PositionRisk {
    pub fn side(&self) -> PositionSide {
        PositionSide::parse(&self.position_side).unwrap_or(PositionSide::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub executed_qty: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: String,
    #[serde(default = "default_position_side")]
    pub position_side: String,
    #[serde(default, rename = "type")]
    pub order_type: String,
    #[serde(default)]
    pub orig_type: String,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub price: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub stop_price: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub orig_qty: f64,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl OpenOrder {
    pub fn trade_side(&self) -> Option<TradeSide> {
        TradeSide::parse(&self.side)
    }

    pub fn position_side(&self) -> PositionSide {
        PositionSide::parse(&self.position_side).unwrap_or(PositionSide::Both)
    }

    /// Effective type: the venue moves the original type into `origType` once
    /// a stop order trips.
    pub fn effective_type(&self) -> &str {
        if self.orig_type.is_empty() {
            &self.order_type
        } else {
            &self.orig_type
        }
    }

    pub fn is_stop(&self) -> bool {
        self.effective_type().contains("STOP")
    }

    pub fn is_take_profit(&self) -> bool {
        self.effective_type().contains("TAKE_PROFIT")
    }

    pub fn is_protective(&self) -> bool {
        (self.is_stop() || self.is_take_profit()) && (self.reduce_only || self.close_position)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionModeInfo {
    pub dual_side_position: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub symbol: String,
    pub order_id: i64,
    #[serde(deserialize_with = "f64_from_str")]
    pub price: f64,
    #[serde(deserialize_with = "f64_from_str")]
    pub qty: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub realized_pnl: f64,
    #[serde(default, deserialize_with = "f64_from_str")]
    pub commission: f64,
    pub time: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeRecord {
    #[serde(default)]
    pub symbol: String,
    pub income_type: String,
    #[serde(deserialize_with = "f64_from_str")]
    pub income: f64,
    pub time: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One kline row. The endpoint returns positional arrays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
}

impl Candle {
    pub fn from_row(row: &[Value]) -> Option<Candle> {
        Some(Candle {
            open_time: row.first()?.as_i64()?,
            open: value_as_f64(row.get(1)?),
            high: value_as_f64(row.get(2)?),
            low: value_as_f64(row.get(3)?),
            close: value_as_f64(row.get(4)?),
            volume: value_as_f64(row.get(5)?),
            close_time: row.get(6)?.as_i64()?,
            quote_volume: row.get(7).map(value_as_f64).unwrap_or(0.0),
        })
    }

    /// Typical price used for VWAP accumulation.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

// ---------------------------------------------------------------------------
// Stream payloads
// ---------------------------------------------------------------------------

/// `!forceOrder@arr` message: `{"e":"forceOrder","E":...,"o":{...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderMessage {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: ForceOrderDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForceOrderDetail {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "q", deserialize_with = "f64_from_str")]
    pub quantity: f64,
    #[serde(rename = "p", deserialize_with = "f64_from_str")]
    pub price: f64,
    #[serde(rename = "ap", default, deserialize_with = "f64_from_str")]
    pub avg_price: f64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// `<symbol>@markPrice` / `!markPrice@arr` element.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceMessage {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p", deserialize_with = "f64_from_str")]
    pub mark_price: f64,
    #[serde(rename = "E")]
    pub event_time: i64,
}

/// `<symbol>@kline_<tf>` message body.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineMessage {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlineDetail {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "o", deserialize_with = "f64_from_str")]
    pub open: f64,
    #[serde(rename = "h", deserialize_with = "f64_from_str")]
    pub high: f64,
    #[serde(rename = "l", deserialize_with = "f64_from_str")]
    pub low: f64,
    #[serde(rename = "c", deserialize_with = "f64_from_str")]
    pub close: f64,
    #[serde(rename = "v", deserialize_with = "f64_from_str")]
    pub volume: f64,
    #[serde(rename = "q", default, deserialize_with = "f64_from_str")]
    pub quote_volume: f64,
    #[serde(rename = "x", default)]
    pub closed: bool,
}

// User-data stream -----------------------------------------------------------

#[derive(Debug, Clone)]
pub enum UserDataEvent {
    AccountUpdate(AccountUpdate),
    OrderTradeUpdate(OrderTradeUpdate),
    AccountConfigUpdate(AccountConfigUpdate),
    ListenKeyExpired,
    /// Synthetic marker injected after every (re)connect so the consumer can
    /// resync its maps from REST before applying stream deltas.
    Connected,
}

impl UserDataEvent {
    /// Dispatch on the `e` tag; unknown event types return None and are
    /// dropped by the reader without killing the stream.
    pub fn parse(raw: &str) -> Option<UserDataEvent> {
        let value: Value = serde_json::from_str(raw).ok()?;
        match value.get("e")?.as_str()? {
            "ACCOUNT_UPDATE" => serde_json::from_value(value)
                .ok()
                .map(UserDataEvent::AccountUpdate),
            "ORDER_TRADE_UPDATE" => serde_json::from_value(value)
                .ok()
                .map(UserDataEvent::OrderTradeUpdate),
            "ACCOUNT_CONFIG_UPDATE" => serde_json::from_value(value)
                .ok()
                .map(UserDataEvent::AccountConfigUpdate),
            "listenKeyExpired" => Some(UserDataEvent::ListenKeyExpired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "a")]
    pub data: AccountUpdateData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdateData {
    #[serde(rename = "m", default)]
    pub reason: String,
    #[serde(rename = "B", default)]
    pub balances: Vec<BalanceDelta>,
    #[serde(rename = "P", default)]
    pub positions: Vec<PositionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BalanceDelta {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb", deserialize_with = "f64_from_str")]
    pub wallet_balance: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionDelta {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa", deserialize_with = "f64_from_str")]
    pub position_amount: f64,
    #[serde(rename = "ep", deserialize_with = "f64_from_str")]
    pub entry_price: f64,
    #[serde(rename = "up", default, deserialize_with = "f64_from_str")]
    pub unrealized_pnl: f64,
    #[serde(rename = "ps", default = "default_position_side")]
    pub position_side: String,
}

impl PositionDelta {
    pub fn side(&self) -> PositionSide {
        PositionSide::parse(&self.position_side).unwrap_or(PositionSide::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "o")]
    pub order: OrderUpdateDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdateDetail {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "i")]
    pub order_id: i64,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "ps", default = "default_position_side")]
    pub position_side: String,
    #[serde(rename = "o", default)]
    pub order_type: String,
    #[serde(rename = "ot", default)]
    pub original_type: String,
    #[serde(rename = "X", default)]
    pub status: String,
    #[serde(rename = "x", default)]
    pub execution_type: String,
    #[serde(rename = "q", default, deserialize_with = "f64_from_str")]
    pub quantity: f64,
    #[serde(rename = "z", default, deserialize_with = "f64_from_str")]
    pub filled_qty: f64,
    #[serde(rename = "ap", default, deserialize_with = "f64_from_str")]
    pub avg_price: f64,
    #[serde(rename = "L", default, deserialize_with = "f64_from_str")]
    pub last_price: f64,
    #[serde(rename = "rp", default, deserialize_with = "f64_from_str")]
    pub realized_profit: f64,
    #[serde(rename = "R", default)]
    pub reduce_only: bool,
    #[serde(rename = "cp", default)]
    pub close_position: bool,
}

impl OrderUpdateDetail {
    pub fn trade_side(&self) -> Option<TradeSide> {
        TradeSide::parse(&self.side)
    }

    pub fn position_side(&self) -> PositionSide {
        PositionSide::parse(&self.position_side).unwrap_or(PositionSide::Both)
    }

    pub fn is_filled(&self) -> bool {
        self.status == "FILLED"
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "FILLED" | "CANCELED" | "EXPIRED" | "REJECTED")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfigUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "ac", default)]
    pub leverage_change: Option<LeverageChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeverageChange {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "l")]
    pub leverage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_force_order_message() {
        let raw = r#"{"e":"forceOrder","E":1700000000100,"o":{
            "s":"ASTERUSDT","S":"SELL","o":"LIMIT","f":"IOC",
            "q":"8000","p":"0.9950","ap":"0.9948","X":"FILLED",
            "l":"8000","z":"8000","T":1700000000095}}"#;
        let msg: ForceOrderMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.order.symbol, "ASTERUSDT");
        assert_eq!(msg.order.side, "SELL");
        assert!((msg.order.quantity - 8000.0).abs() < 1e-9);
        assert!((msg.order.price - 0.995).abs() < 1e-9);
        // Unknown fields survive in `extra`.
        assert!(msg.order.extra.contains_key("X"));
    }

    #[test]
    fn parses_account_update_with_partial_positions() {
        let raw = r#"{"e":"ACCOUNT_UPDATE","E":1700000001000,"T":1700000000999,
            "a":{"m":"ORDER","B":[{"a":"USDT","wb":"1000.5","cw":"1000.5"}],
            "P":[{"s":"BTCUSDT","pa":"0.010","ep":"60000","up":"1.2","ps":"LONG"}]}}"#;
        match UserDataEvent::parse(raw).unwrap() {
            UserDataEvent::AccountUpdate(update) => {
                assert_eq!(update.data.positions.len(), 1);
                let p = &update.data.positions[0];
                assert_eq!(p.side(), PositionSide::Long);
                assert!((p.position_amount - 0.01).abs() < 1e-12);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_stream_event_is_dropped_not_fatal() {
        assert!(UserDataEvent::parse(r#"{"e":"MARGIN_CALL","E":1}"#).is_none());
        assert!(UserDataEvent::parse("not json").is_none());
    }

    #[test]
    fn candle_from_positional_row() {
        let row: Vec<Value> = serde_json::from_str(
            r#"[1700000000000,"1.0","1.2","0.9","1.1","50000",1700000059999,"55000",100,"25000","27500","0"]"#,
        )
        .unwrap();
        let candle = Candle::from_row(&row).unwrap();
        assert_eq!(candle.open_time, 1_700_000_000_000);
        assert!((candle.high - 1.2).abs() < 1e-12);
        assert!((candle.quote_volume - 55_000.0).abs() < 1e-9);
    }

    #[test]
    fn protective_detection_uses_orig_type_after_trip() {
        let order: OpenOrder = serde_json::from_str(
            r#"{"orderId":1,"symbol":"BTCUSDT","side":"SELL","positionSide":"LONG",
                "type":"LIMIT","origType":"STOP_MARKET","price":"0","stopPrice":"57000",
                "origQty":"0.01","reduceOnly":true,"status":"NEW"}"#,
        )
        .unwrap();
        assert!(order.is_stop());
        assert!(order.is_protective());
    }
}
