//! Mark-price and VWAP cache.
//!
//! Fed by the mark-price and candle streams; consumers treat readings older
//! than 5 s as stale and fall back to a synchronous REST computation. The
//! fallback is never silent: callers receive the source tag and surface it in
//! the decision context.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::errors::{ExchangeError, ExchangeResult};
use crate::exchange::client::ExchangeClient;
use crate::exchange::types::KlineDetail;
use crate::models::now_ms;

/// Readings older than this are recomputed from REST.
pub const STALE_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VwapReading {
    pub vwap: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
struct VwapSlice {
    open_time: i64,
    pv: f64,
    volume: f64,
}

#[derive(Debug, Default)]
struct SymbolPrices {
    mark: Option<(f64, i64)>,
    slices: VecDeque<VwapSlice>,
    vwap: Option<VwapReading>,
}

pub struct PriceFeed {
    inner: RwLock<HashMap<String, SymbolPrices>>,
    client: Option<Arc<ExchangeClient>>,
}

impl PriceFeed {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            client: Some(client),
        }
    }

    /// Cache-only feed for tests.
    pub fn detached() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            client: None,
        }
    }

    pub fn update_mark(&self, symbol: &str, price: f64, timestamp: i64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        let mut inner = self.inner.write();
        inner.entry(symbol.to_string()).or_default().mark = Some((price, timestamp));
    }

    pub fn mark_price(&self, symbol: &str) -> Option<(f64, i64)> {
        self.inner.read().get(symbol).and_then(|s| s.mark)
    }

    /// Cached mark if fresh, otherwise one REST price lookup. A missing
    /// client with a stale cache is a data-integrity failure, not a guess.
    pub async fn mark_price_or_fetch(&self, symbol: &str) -> ExchangeResult<f64> {
        if let Some((price, ts)) = self.mark_price(symbol) {
            if now_ms() - ts <= STALE_MS {
                return Ok(price);
            }
        }
        match &self.client {
            Some(client) => {
                let ticker = client.ticker_price(symbol).await?;
                self.update_mark(symbol, ticker.price, now_ms());
                Ok(ticker.price)
            }
            None => Err(ExchangeError::DataIntegrity(format!(
                "no fresh mark price for {symbol}"
            ))),
        }
    }

    /// Fold one candle-stream update into the rolling VWAP window.
    pub fn on_kline(&self, symbol: &str, kline: &KlineDetail, lookback: u32) {
        if kline.volume < 0.0 {
            return;
        }
        let typical = (kline.high + kline.low + kline.close) / 3.0;
        let slice = VwapSlice {
            open_time: kline.open_time,
            pv: typical * kline.volume,
            volume: kline.volume,
        };
        let mut inner = self.inner.write();
        let state = inner.entry(symbol.to_string()).or_default();
        match state.slices.back_mut() {
            // In-progress candle: replace the evolving slice.
            Some(last) if last.open_time == slice.open_time => *last = slice,
            _ => state.slices.push_back(slice),
        }
        while state.slices.len() > lookback.max(1) as usize {
            state.slices.pop_front();
        }
        let volume: f64 = state.slices.iter().map(|s| s.volume).sum();
        if volume > 0.0 {
            let pv: f64 = state.slices.iter().map(|s| s.pv).sum();
            state.vwap = Some(VwapReading {
                vwap: pv / volume,
                timestamp: now_ms(),
            });
        }
    }

    pub fn get_vwap(&self, symbol: &str) -> Option<VwapReading> {
        self.inner.read().get(symbol).and_then(|s| s.vwap)
    }

    /// VWAP with staleness policy. Returns the reading and its source tag
    /// (`"stream"` or `"rest_fallback"`); the tag travels with the decision.
    pub async fn vwap_or_fetch(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: u32,
    ) -> ExchangeResult<(f64, &'static str)> {
        if let Some(reading) = self.get_vwap(symbol) {
            if now_ms() - reading.timestamp <= STALE_MS {
                return Ok((reading.vwap, "stream"));
            }
        }
        let client = self.client.as_ref().ok_or_else(|| {
            ExchangeError::DataIntegrity(format!("no fresh vwap for {symbol}"))
        })?;
        debug!(symbol = %symbol, "vwap cache stale, computing from klines");
        let candles = client.klines(symbol, timeframe, lookback.max(1), None, None).await?;
        let volume: f64 = candles.iter().map(|c| c.volume).sum();
        if volume <= 0.0 {
            return Err(ExchangeError::DataIntegrity(format!(
                "no volume in {lookback} {timeframe} candles for {symbol}"
            )));
        }
        let pv: f64 = candles.iter().map(|c| c.typical_price() * c.volume).sum();
        let vwap = pv / volume;
        self.inner
            .write()
            .entry(symbol.to_string())
            .or_default()
            .vwap = Some(VwapReading {
            vwap,
            timestamp: now_ms(),
        });
        Ok((vwap, "rest_fallback"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open_time: i64, high: f64, low: f64, close: f64, volume: f64) -> KlineDetail {
        KlineDetail {
            open_time,
            close_time: open_time + 59_999,
            open: low,
            high,
            low,
            close,
            volume,
            quote_volume: 0.0,
            closed: true,
        }
    }

    #[test]
    fn vwap_weights_by_volume() {
        let feed = PriceFeed::detached();
        feed.on_kline("BTCUSDT", &kline(0, 100.0, 100.0, 100.0, 10.0), 20);
        feed.on_kline("BTCUSDT", &kline(60_000, 200.0, 200.0, 200.0, 30.0), 20);
        let reading = feed.get_vwap("BTCUSDT").unwrap();
        // (100*10 + 200*30) / 40 = 175
        assert!((reading.vwap - 175.0).abs() < 1e-9);
    }

    #[test]
    fn in_progress_candle_replaces_last_slice() {
        let feed = PriceFeed::detached();
        feed.on_kline("BTCUSDT", &kline(0, 100.0, 100.0, 100.0, 10.0), 20);
        feed.on_kline("BTCUSDT", &kline(0, 110.0, 110.0, 110.0, 20.0), 20);
        let reading = feed.get_vwap("BTCUSDT").unwrap();
        assert!((reading.vwap - 110.0).abs() < 1e-9);
    }

    #[test]
    fn lookback_evicts_old_slices() {
        let feed = PriceFeed::detached();
        for i in 0..5 {
            feed.on_kline("BTCUSDT", &kline(i * 60_000, 100.0 + i as f64, 100.0 + i as f64, 100.0 + i as f64, 1.0), 2);
        }
        // Only the last two candles (103, 104 typical) remain.
        let reading = feed.get_vwap("BTCUSDT").unwrap();
        assert!((reading.vwap - 103.5).abs() < 1e-9);
    }

    #[test]
    fn mark_price_ignores_garbage() {
        let feed = PriceFeed::detached();
        feed.update_mark("BTCUSDT", f64::NAN, 1);
        feed.update_mark("BTCUSDT", -5.0, 1);
        assert!(feed.mark_price("BTCUSDT").is_none());
        feed.update_mark("BTCUSDT", 60_000.0, 2);
        assert_eq!(feed.mark_price("BTCUSDT"), Some((60_000.0, 2)));
    }
}
