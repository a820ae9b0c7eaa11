//! Threshold monitor.
//!
//! Per (symbol, direction) rolling windows of liquidation notionals with two
//! cooldown clocks: a per-direction trigger cooldown and the account-level
//! hunter cooldown shared across symbols. Entries older than the window are
//! evicted lazily on every touch, so the running sum always equals the
//! notional inside (now - window, now].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::models::{LiquidationEvent, SignalDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    pub trigger_remaining: i64,
    pub hunter_remaining: i64,
}

impl CooldownState {
    pub fn blocked(&self) -> bool {
        self.trigger_remaining > 0 || self.hunter_remaining > 0
    }

    /// Remaining ms to surface to the operator.
    pub fn report_ms(&self) -> i64 {
        if self.trigger_remaining > 0 {
            self.trigger_remaining
        } else {
            self.hunter_remaining
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdStatus {
    pub recent_long_volume: f64,
    pub recent_short_volume: f64,
    pub long_threshold: f64,
    pub short_threshold: f64,
}

#[derive(Debug, Default)]
struct DirectionWindow {
    entries: VecDeque<(i64, f64)>,
    sum: f64,
    last_trigger: i64,
}

impl DirectionWindow {
    fn evict(&mut self, cutoff: i64) {
        while let Some((time, notional)) = self.entries.front() {
            if *time < cutoff {
                self.sum -= notional;
                self.entries.pop_front();
            } else {
                break;
            }
        }
        if self.entries.is_empty() {
            // Keep float drift from accumulating across quiet periods.
            self.sum = 0.0;
        }
    }

    fn push(&mut self, time: i64, notional: f64, window_ms: i64) {
        self.entries.push_back((time, notional));
        self.sum += notional;
        self.evict(time - window_ms);
    }
}

#[derive(Debug, Default)]
struct SymbolWindows {
    long: DirectionWindow,
    short: DirectionWindow,
}

impl SymbolWindows {
    fn direction(&mut self, direction: SignalDirection) -> &mut DirectionWindow {
        match direction {
            SignalDirection::Long => &mut self.long,
            SignalDirection::Short => &mut self.short,
        }
    }
}

pub struct ThresholdMonitor {
    windows: Mutex<HashMap<String, SymbolWindows>>,
    /// Last accepted entry across all symbols, ms. Zero = never.
    last_hunter_entry: AtomicI64,
}

impl ThresholdMonitor {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            last_hunter_entry: AtomicI64::new(0),
        }
    }

    /// Fold one liquidation into its signal-direction window.
    pub fn record(&self, event: &LiquidationEvent, window_ms: i64) {
        let direction = SignalDirection::from_liquidation_side(event.side);
        let mut windows = self.windows.lock();
        windows
            .entry(event.symbol.clone())
            .or_default()
            .direction(direction)
            .push(event.event_time, event.notional(), window_ms);
    }

    /// Rolling sum for one direction after evicting stale entries.
    pub fn cumulative(&self, symbol: &str, direction: SignalDirection, now: i64, window_ms: i64) -> f64 {
        let mut windows = self.windows.lock();
        match windows.get_mut(symbol) {
            Some(sym) => {
                let window = sym.direction(direction);
                window.evict(now - window_ms);
                window.sum
            }
            None => 0.0,
        }
    }

    pub fn status(
        &self,
        symbol: &str,
        now: i64,
        window_ms: i64,
        long_threshold: f64,
        short_threshold: f64,
    ) -> ThresholdStatus {
        ThresholdStatus {
            recent_long_volume: self.cumulative(symbol, SignalDirection::Long, now, window_ms),
            recent_short_volume: self.cumulative(symbol, SignalDirection::Short, now, window_ms),
            long_threshold,
            short_threshold,
        }
    }

    /// Remaining time on both cooldown clocks. Gating uses the larger one;
    /// operator-facing messages report the per-direction trigger clock when
    /// it is the one running.
    pub fn cooldown_state(
        &self,
        symbol: &str,
        direction: SignalDirection,
        now: i64,
        cooldown_ms: i64,
        hunter_cooldown_ms: i64,
    ) -> CooldownState {
        let trigger_remaining = {
            let mut windows = self.windows.lock();
            match windows.get_mut(symbol) {
                Some(sym) => {
                    let last = sym.direction(direction).last_trigger;
                    if last == 0 {
                        0
                    } else {
                        (last + cooldown_ms - now).max(0)
                    }
                }
                None => 0,
            }
        };
        let last_entry = self.last_hunter_entry.load(Ordering::Relaxed);
        let hunter_remaining = if last_entry == 0 {
            0
        } else {
            (last_entry + hunter_cooldown_ms - now).max(0)
        };
        CooldownState {
            trigger_remaining,
            hunter_remaining,
        }
    }

    /// Stamp both cooldown clocks after a fired signal.
    pub fn mark_trigger(&self, symbol: &str, direction: SignalDirection, now: i64) {
        let mut windows = self.windows.lock();
        windows
            .entry(symbol.to_string())
            .or_default()
            .direction(direction)
            .last_trigger = now;
        self.last_hunter_entry.store(now, Ordering::Relaxed);
    }
}

impl Default for ThresholdMonitor {
    fn default() -> Self {
        Self::new()
    }
}
