use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Taker side of a forced order as reported by the venue.
///
/// BUY means shorts are being liquidated (forced buy-back), SELL means longs
/// are being liquidated. The counter-trend signal direction is the opposite
/// of the cascade: SELL cascades feed long signals, BUY cascades short ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> TradeSide {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }

    pub fn parse(s: &str) -> Option<TradeSide> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position side parameter on order endpoints. BOTH in one-way mode,
/// LONG/SHORT in hedge mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Both,
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Both => "BOTH",
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<PositionSide> {
        match s.to_ascii_uppercase().as_str() {
            "BOTH" => Some(PositionSide::Both),
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// Entry side for this position direction (BOTH treated by caller).
    pub fn entry_side(&self) -> Option<TradeSide> {
        match self {
            PositionSide::Long => Some(TradeSide::Buy),
            PositionSide::Short => Some(TradeSide::Sell),
            PositionSide::Both => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Venue-level account position mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    OneWay,
    Hedge,
}

impl PositionMode {
    pub fn is_hedge(&self) -> bool {
        matches!(self, PositionMode::Hedge)
    }
}

/// Signal direction derived from the cascade side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    Long,
    Short,
}

impl SignalDirection {
    /// SELL liquidations (longs flushed) argue for a long entry, BUY for a short.
    pub fn from_liquidation_side(side: TradeSide) -> SignalDirection {
        match side {
            TradeSide::Sell => SignalDirection::Long,
            TradeSide::Buy => SignalDirection::Short,
        }
    }

    pub fn entry_side(&self) -> TradeSide {
        match self {
            SignalDirection::Long => TradeSide::Buy,
            SignalDirection::Short => TradeSide::Sell,
        }
    }

    pub fn position_side(&self, mode: PositionMode) -> PositionSide {
        if mode.is_hedge() {
            match self {
                SignalDirection::Long => PositionSide::Long,
                SignalDirection::Short => PositionSide::Short,
            }
        } else {
            PositionSide::Both
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Long => "long",
            SignalDirection::Short => "short",
        }
    }
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forced order observed on the public liquidation stream.
/// Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    /// Exchange trade time, ms since epoch.
    pub event_time: i64,
    /// Local receive time, ms since epoch.
    pub ingress_time: i64,
}

impl LiquidationEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    pub fn event_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.event_time)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Order type on the entry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Why a signal did not become an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "block_type", rename_all = "snake_case")]
pub enum BlockReason {
    /// Trigger or hunter cooldown still running.
    Cooldown { remaining_ms: i64 },
    /// Entry price on the wrong side of VWAP.
    VwapFilter { vwap: f64, price: f64 },
    /// Liquidation print too far from the mark price.
    PriceDeviation { mark: f64, price: f64 },
    /// Global open-position cap reached.
    MaxPositions { open: usize, max: usize },
    /// An entry for this symbol is already in flight.
    PendingOrder,
    /// Per-symbol margin budget exhausted.
    MarginCap { used: f64, max: f64 },
    /// Wallet has less free margin than the order needs.
    InsufficientMargin { required: f64, available: f64 },
    /// Normalized quantity fell below the venue minimum.
    TradeSizeTooSmall { recommended_min: f64 },
    /// Symbol throttled after a recent insufficient-balance rejection.
    SymbolThrottled { remaining_ms: i64 },
    /// Position-count or hedge-uniqueness check refused the entry.
    PositionLimit { reason: String },
    /// Cumulative (or single-event) volume below threshold.
    BelowThreshold { volume: f64, threshold: f64 },
}

impl BlockReason {
    pub fn summary(&self) -> String {
        match self {
            BlockReason::Cooldown { remaining_ms } => {
                format!("cooldown remaining {}s", remaining_ms / 1000)
            }
            BlockReason::VwapFilter { vwap, price } => {
                format!("vwap filter (vwap {vwap}, price {price})")
            }
            BlockReason::PriceDeviation { mark, price } => {
                format!("price {price} too far from mark {mark}")
            }
            BlockReason::MaxPositions { open, max } => {
                format!("max positions reached ({open}/{max})")
            }
            BlockReason::PendingOrder => "pending order in flight".to_string(),
            BlockReason::MarginCap { used, max } => {
                format!("symbol margin cap ({used:.2}/{max:.2} USDT)")
            }
            BlockReason::InsufficientMargin {
                required,
                available,
            } => format!("insufficient margin (need {required:.2}, have {available:.2})"),
            BlockReason::TradeSizeTooSmall { recommended_min } => {
                format!("trade size too small (min margin ~{recommended_min:.2} USDT)")
            }
            BlockReason::SymbolThrottled { remaining_ms } => {
                format!("symbol throttled for {}s", remaining_ms / 1000)
            }
            BlockReason::PositionLimit { reason } => reason.clone(),
            BlockReason::BelowThreshold { volume, threshold } => {
                format!("volume {volume:.0} below threshold {threshold:.0}")
            }
        }
    }
}

/// A gate-passing signal about to become an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDecision {
    pub symbol: String,
    pub direction: SignalDirection,
    pub reason: String,
    /// Window volume over threshold, clamped to [0, 1] headroom scale.
    pub confidence: f64,
    /// Set when the VWAP reading came from the synchronous REST fallback
    /// rather than the stream cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap_source: Option<String>,
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sell_cascade_maps_to_long_signal() {
        assert_eq!(
            SignalDirection::from_liquidation_side(TradeSide::Sell),
            SignalDirection::Long
        );
        assert_eq!(
            SignalDirection::from_liquidation_side(TradeSide::Buy),
            SignalDirection::Short
        );
    }

    #[test]
    fn position_side_follows_mode() {
        assert_eq!(
            SignalDirection::Long.position_side(PositionMode::OneWay),
            PositionSide::Both
        );
        assert_eq!(
            SignalDirection::Long.position_side(PositionMode::Hedge),
            PositionSide::Long
        );
        assert_eq!(
            SignalDirection::Short.position_side(PositionMode::Hedge),
            PositionSide::Short
        );
    }

    #[test]
    fn notional_is_price_times_qty() {
        let ev = LiquidationEvent {
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Sell,
            price: 60_000.0,
            quantity: 0.5,
            event_time: 1_700_000_000_000,
            ingress_time: 1_700_000_000_050,
        };
        assert!((ev.notional() - 30_000.0).abs() < 1e-9);
    }

    #[test]
    fn cooldown_summary_renders_seconds() {
        let reason = BlockReason::Cooldown {
            remaining_ms: 20_000,
        };
        assert_eq!(reason.summary(), "cooldown remaining 20s");
    }
}
