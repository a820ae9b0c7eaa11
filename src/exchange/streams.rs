//! WebSocket stream readers.
//!
//! Each reader owns one connection with an outer reconnect loop (5 s delay)
//! and an inner read loop. A single malformed message is logged and dropped;
//! only transport failures tear the connection down. Readers exit at their
//! next suspension point when the shutdown channel fires.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::events::{StatusBroadcaster, StatusEvent};
use crate::exchange::client::ExchangeClient;
use crate::exchange::price_feed::PriceFeed;
use crate::exchange::types::{
    ForceOrderMessage, KlineMessage, MarkPriceMessage, UserDataEvent,
};
use crate::models::{now_ms, LiquidationEvent, TradeSide};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

/// Public forced-order stream -> liquidation events.
pub async fn run_liquidation_stream(
    ws_base: String,
    tx: mpsc::UnboundedSender<LiquidationEvent>,
    bus: StatusBroadcaster,
    shutdown: broadcast::Sender<()>,
) {
    let url = format!("{ws_base}/ws/!forceOrder@arr");
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!(url = %url, "liquidation stream connected");
                loop {
                    tokio::select! {
                        message = ws.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(event) = parse_force_order(&text) {
                                    if tx.send(event).is_err() {
                                        return;
                                    }
                                } else {
                                    debug!("unparseable liquidation message dropped");
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "forceOrder".to_string(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                            None => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "forceOrder".to_string(),
                                    reason: "connection closed".to_string(),
                                });
                                break;
                            }
                        },
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
            Err(e) => {
                bus.emit(StatusEvent::WebsocketError {
                    stream: "forceOrder".to_string(),
                    reason: format!("connect failed: {e}"),
                });
            }
        }
        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}

fn parse_force_order(raw: &str) -> Option<LiquidationEvent> {
    let message: ForceOrderMessage = serde_json::from_str(raw).ok()?;
    let order = message.order;
    let side = TradeSide::parse(&order.side)?;
    let price = if order.avg_price > 0.0 {
        order.avg_price
    } else {
        order.price
    };
    if !(price.is_finite() && price > 0.0 && order.quantity > 0.0) {
        return None;
    }
    Some(LiquidationEvent {
        symbol: order.symbol,
        side,
        price,
        quantity: order.quantity,
        event_time: order.trade_time,
        ingress_time: now_ms(),
    })
}

/// Private user-data stream. Obtains a listen key, keeps it alive every
/// 30 min, and injects a `Connected` marker after every (re)connect so the
/// consumer resyncs from REST before applying deltas.
pub async fn run_user_stream(
    ws_base: String,
    client: Arc<ExchangeClient>,
    tx: mpsc::UnboundedSender<UserDataEvent>,
    bus: StatusBroadcaster,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        let listen_key = match client.create_listen_key().await {
            Ok(key) => key,
            Err(e) => {
                bus.emit(StatusEvent::WebsocketError {
                    stream: "userData".to_string(),
                    reason: format!("listenKey: {e}"),
                });
                tokio::select! {
                    _ = sleep(RECONNECT_DELAY) => continue,
                    _ = shutdown_rx.recv() => return,
                }
            }
        };

        let url = format!("{ws_base}/ws/{listen_key}");
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("user-data stream connected");
                if tx.send(UserDataEvent::Connected).is_err() {
                    return;
                }
                let mut keepalive = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
                keepalive.tick().await; // first tick is immediate
                loop {
                    tokio::select! {
                        message = ws.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                match UserDataEvent::parse(&text) {
                                    Some(UserDataEvent::ListenKeyExpired) => {
                                        warn!("listen key expired, reconnecting");
                                        break;
                                    }
                                    Some(event) => {
                                        if tx.send(event).is_err() {
                                            return;
                                        }
                                    }
                                    None => debug!("unhandled user-data message dropped"),
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "userData".to_string(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                            None => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "userData".to_string(),
                                    reason: "connection closed".to_string(),
                                });
                                break;
                            }
                        },
                        _ = keepalive.tick() => {
                            if let Err(e) = client.keepalive_listen_key().await {
                                warn!(error = %e, "listen key keepalive failed");
                            }
                        }
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
            Err(e) => {
                bus.emit(StatusEvent::WebsocketError {
                    stream: "userData".to_string(),
                    reason: format!("connect failed: {e}"),
                });
            }
        }
        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// All-symbol mark-price stream feeding the price cache.
pub async fn run_mark_price_stream(
    ws_base: String,
    feed: Arc<PriceFeed>,
    bus: StatusBroadcaster,
    shutdown: broadcast::Sender<()>,
) {
    let url = format!("{ws_base}/ws/!markPrice@arr@1s");
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!("mark-price stream connected");
                loop {
                    tokio::select! {
                        message = ws.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Ok(marks) = serde_json::from_str::<Vec<MarkPriceMessage>>(&text) {
                                    for mark in marks {
                                        feed.update_mark(&mark.symbol, mark.mark_price, mark.event_time);
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "markPrice".to_string(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                            None => break,
                        },
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
            Err(e) => {
                bus.emit(StatusEvent::WebsocketError {
                    stream: "markPrice".to_string(),
                    reason: format!("connect failed: {e}"),
                });
            }
        }
        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}

/// Combined candle streams for the symbols with VWAP protection enabled.
/// `subscriptions` pairs each symbol with (timeframe, lookback).
pub async fn run_kline_streams(
    ws_base: String,
    subscriptions: Vec<(String, String, u32)>,
    feed: Arc<PriceFeed>,
    bus: StatusBroadcaster,
    shutdown: broadcast::Sender<()>,
) {
    if subscriptions.is_empty() {
        return;
    }
    let streams: Vec<String> = subscriptions
        .iter()
        .map(|(symbol, tf, _)| format!("{}@kline_{}", symbol.to_ascii_lowercase(), tf))
        .collect();
    let url = format!("{ws_base}/stream?streams={}", streams.join("/"));
    let lookback_for = |symbol: &str| {
        subscriptions
            .iter()
            .find(|(s, _, _)| s.eq_ignore_ascii_case(symbol))
            .map(|(_, _, lb)| *lb)
            .unwrap_or(20)
    };

    let mut shutdown_rx = shutdown.subscribe();
    loop {
        match connect_async(&url).await {
            Ok((mut ws, _)) => {
                info!(streams = streams.len(), "kline streams connected");
                loop {
                    tokio::select! {
                        message = ws.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                // Combined frames wrap the payload in {stream, data}.
                                let data = serde_json::from_str::<serde_json::Value>(&text)
                                    .ok()
                                    .and_then(|v| v.get("data").cloned());
                                if let Some(data) = data {
                                    if let Ok(msg) = serde_json::from_value::<KlineMessage>(data) {
                                        let lookback = lookback_for(&msg.symbol);
                                        feed.on_kline(&msg.symbol, &msg.kline, lookback);
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                bus.emit(StatusEvent::WebsocketError {
                                    stream: "kline".to_string(),
                                    reason: e.to_string(),
                                });
                                break;
                            }
                            None => break,
                        },
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
            Err(e) => {
                bus.emit(StatusEvent::WebsocketError {
                    stream: "kline".to_string(),
                    reason: format!("connect failed: {e}"),
                });
            }
        }
        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = shutdown_rx.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_order_prefers_average_fill_price() {
        let raw = r#"{"e":"forceOrder","E":2,"o":{"s":"ETHUSDT","S":"BUY",
            "q":"10","p":"3000.5","ap":"3001.2","T":1}}"#;
        let event = parse_force_order(raw).unwrap();
        assert_eq!(event.side, TradeSide::Buy);
        assert!((event.price - 3001.2).abs() < 1e-9);
        assert_eq!(event.event_time, 1);
    }

    #[test]
    fn force_order_rejects_zero_quantity() {
        let raw = r#"{"e":"forceOrder","E":2,"o":{"s":"ETHUSDT","S":"BUY",
            "q":"0","p":"3000.5","ap":"0","T":1}}"#;
        assert!(parse_force_order(raw).is_none());
    }
}
