//! Status broadcaster.
//!
//! Every subsystem reports through one broadcast channel of structured
//! events. Consumers (log sink, copy trader, an external dashboard) subscribe
//! independently; a send with no receivers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::models::{BlockReason, PositionSide, SignalDirection, TradeDecision, TradeSide};

/// Per-follower outcome of a copy-trade fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerOutcome {
    pub wallet: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    TradeDecision(TradeDecision),
    TradeBlocked {
        symbol: String,
        direction: SignalDirection,
        reason: BlockReason,
    },
    PositionUpdated {
        symbol: String,
        position_side: PositionSide,
        quantity: f64,
        entry_price: f64,
    },
    PositionClosed {
        symbol: String,
        position_side: PositionSide,
        pnl: f64,
        exit_price: f64,
        reason: String,
    },
    OrderFilled {
        symbol: String,
        order_id: i64,
        side: TradeSide,
        position_side: PositionSide,
        quantity: f64,
        price: f64,
        reduce_only: bool,
    },
    OrderCancelled {
        symbol: String,
        order_id: i64,
    },
    CopyTradeCompleted {
        master_order_id: i64,
        successful: usize,
        failed: usize,
        followers: Vec<FollowerOutcome>,
    },
    TradingError {
        code: String,
        reason: String,
        component: String,
    },
    ApiError {
        code: String,
        reason: String,
        component: String,
        /// Set when the same endpoint failed 5+ times inside 60 s.
        health_alert: bool,
    },
    WebsocketError {
        stream: String,
        reason: String,
    },
    ConfigError {
        reason: String,
    },
    ConfigUpdated {
        changed: Vec<String>,
    },
    RateLimitStatus {
        weight_used: u32,
        weight_limit: u32,
        orders_used: u32,
        orders_limit: u32,
    },
}

/// Fan-out handle cloned into every subsystem.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Non-blocking send; dropped silently when nobody listens.
    pub fn emit(&self, event: StatusEvent) {
        self.log(&event);
        let _ = self.tx.send(event);
    }

    fn log(&self, event: &StatusEvent) {
        match event {
            StatusEvent::TradeDecision(d) => {
                info!(symbol = %d.symbol, direction = %d.direction, confidence = d.confidence, "trade decision: {}", d.reason)
            }
            StatusEvent::TradeBlocked {
                symbol, reason, ..
            } => debug!(symbol = %symbol, "trade blocked: {}", reason.summary()),
            StatusEvent::PositionClosed {
                symbol,
                pnl,
                reason,
                ..
            } => info!(symbol = %symbol, pnl, "position closed: {}", reason),
            StatusEvent::TradingError {
                code,
                reason,
                component,
            } => error!(code = %code, component = %component, "trading error: {}", reason),
            StatusEvent::ApiError {
                code,
                reason,
                component,
                health_alert,
            } => {
                if *health_alert {
                    error!(code = %code, component = %component, health_alert = true, "api error: {}", reason)
                } else {
                    warn!(code = %code, component = %component, "api error: {}", reason)
                }
            }
            StatusEvent::WebsocketError { stream, reason } => {
                warn!(stream = %stream, "websocket error: {}", reason)
            }
            StatusEvent::ConfigError { reason } => error!("config error: {}", reason),
            _ => {}
        }
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockReason;

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = StatusBroadcaster::new(16);
        let mut rx = bus.subscribe();
        bus.emit(StatusEvent::TradeBlocked {
            symbol: "BTCUSDT".to_string(),
            direction: SignalDirection::Long,
            reason: BlockReason::PendingOrder,
        });
        match rx.recv().await.unwrap() {
            StatusEvent::TradeBlocked { symbol, .. } => assert_eq!(symbol, "BTCUSDT"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_receivers_is_fine() {
        let bus = StatusBroadcaster::new(4);
        bus.emit(StatusEvent::ConfigUpdated { changed: vec![] });
    }
}
