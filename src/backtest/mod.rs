//! Backtesting engine.
//!
//! Replays stored liquidations for one symbol against cached 1-minute bars
//! and simulates the live gate: window volume over threshold, trigger and
//! hunter cooldowns, one slot per side. Fills, whipsaw resolution, and
//! slippage draw from a seeded generator so a run is reproducible bit for
//! bit.

pub mod candles;
pub mod optimizer;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::exchange::types::Candle;
use crate::models::{LiquidationEvent, SignalDirection};

pub const LIMIT_FILL_RATE: f64 = 0.85;
pub const MARKET_FALLBACK_RATE: f64 = 0.10;
/// Adverse slippage on a market-fallback entry.
const MARKET_ENTRY_SLIPPAGE: f64 = 0.002;
const TP_SLIPPAGE: f64 = 0.001;
const SL_SLIPPAGE_BASE: f64 = 0.005;
const SL_SLIPPAGE_VOLATILE: f64 = 0.008;
/// Rolling window for the volatility factor.
const VOLATILITY_BARS: usize = 20;
const VOLATILITY_SPIKE: f64 = 1.5;
/// When a bar touches both targets, the closer one wins this often.
const WHIPSAW_CLOSER_PROB: f64 = 0.70;
const LIQUIDATION_FEE: f64 = 0.005;
const AVG_FILLS_PER_TRADE: f64 = 1.5;
pub const DEFAULT_MAKER_FEE: f64 = 0.0002;
pub const DEFAULT_TAKER_FEE: f64 = 0.0004;

/// One parameter tuple under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateParams {
    pub long_threshold: f64,
    pub short_threshold: f64,
    pub tp_percent: f64,
    pub sl_percent: f64,
    pub leverage: u32,
    pub margin_usdt: f64,
    pub window_ms: i64,
    pub cooldown_ms: i64,
    pub long_trade_size: f64,
    pub short_trade_size: f64,
}

impl CandidateParams {
    pub fn threshold_for(&self, direction: SignalDirection) -> f64 {
        match direction {
            SignalDirection::Long => self.long_threshold,
            SignalDirection::Short => self.short_threshold,
        }
    }

    pub fn margin_for(&self, direction: SignalDirection) -> f64 {
        let size = match direction {
            SignalDirection::Long => self.long_trade_size,
            SignalDirection::Short => self.short_trade_size,
        };
        if size > 0.0 {
            size
        } else {
            self.margin_usdt
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Liquidation,
    EndOfData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimTrade {
    pub direction: SignalDirection,
    pub entry_time: i64,
    pub exit_time: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimResult {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
    pub profit_factor: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub stop_rate: f64,
    pub win_rate: f64,
    pub liquidations: usize,
    pub skipped_unfilled: usize,
}

struct OpenSlot {
    direction: SignalDirection,
    entry_time: i64,
    entry_price: f64,
    quantity: f64,
    margin: f64,
    take_profit: f64,
    stop_loss: f64,
    liquidation_price: f64,
    entry_fee: f64,
}

/// Replay one parameter set. Deterministic for a fixed seed.
pub fn simulate(
    params: &CandidateParams,
    candles: &[Candle],
    liquidations: &[LiquidationEvent],
    seed: u64,
    maker_fee: f64,
    taker_fee: f64,
    hunter_cooldown_ms: i64,
) -> SimResult {
    let mut result = SimResult::default();
    if candles.is_empty() {
        return result;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let mut events: Vec<&LiquidationEvent> = liquidations.iter().collect();
    events.sort_by_key(|e| e.event_time);
    let mut event_cursor = 0usize;

    let volatility = rolling_volatility(candles, VOLATILITY_BARS);
    let vol_baseline = {
        let positive: Vec<f64> = volatility.iter().copied().filter(|v| *v > 0.0).collect();
        if positive.is_empty() {
            0.0
        } else {
            positive.iter().sum::<f64>() / positive.len() as f64
        }
    };

    // Rolling windows + cooldown clocks, one per direction.
    let mut windows: [VecDeque<(i64, f64)>; 2] = [VecDeque::new(), VecDeque::new()];
    let mut sums = [0.0f64; 2];
    let mut last_trigger = [0i64; 2];
    let mut last_entry = 0i64;
    let mut slots: [Option<OpenSlot>; 2] = [None, None];

    let mut trades: Vec<SimTrade> = Vec::new();

    for (bar_index, bar) in candles.iter().enumerate() {
        // Evaluate open positions on every bar after their entry bar.
        for slot in slots.iter_mut() {
            let exit = match slot {
                Some(open) if open.entry_time < bar.open_time => evaluate_bar(
                    open,
                    bar,
                    volatility[bar_index],
                    vol_baseline,
                    taker_fee,
                    &mut rng,
                ),
                _ => None,
            };
            if let Some(trade) = exit {
                record_trade(&mut result, &mut trades, trade);
                *slot = None;
            }
        }

        // Feed liquidations inside this bar through the signal gate.
        while event_cursor < events.len() && events[event_cursor].event_time <= bar.close_time {
            let event = events[event_cursor];
            event_cursor += 1;
            let direction = SignalDirection::from_liquidation_side(event.side);
            let d = direction as usize;

            let window = &mut windows[d];
            window.push_back((event.event_time, event.notional()));
            sums[d] += event.notional();
            while let Some((t, n)) = window.front() {
                if *t < event.event_time - params.window_ms {
                    sums[d] -= n;
                    window.pop_front();
                } else {
                    break;
                }
            }

            if sums[d] < params.threshold_for(direction) {
                continue;
            }
            let now = event.event_time;
            if last_trigger[d] != 0 && now - last_trigger[d] < params.cooldown_ms {
                continue;
            }
            if last_entry != 0 && now - last_entry < hunter_cooldown_ms {
                continue;
            }
            if slots[d].is_some() {
                continue;
            }
            last_trigger[d] = now;

            // Fill model: occasional market fallback with adverse slippage,
            // otherwise a limit that fills 85% of the time.
            let entry_price = if rng.gen::<f64>() < MARKET_FALLBACK_RATE {
                match direction {
                    SignalDirection::Long => event.price * (1.0 + MARKET_ENTRY_SLIPPAGE),
                    SignalDirection::Short => event.price * (1.0 - MARKET_ENTRY_SLIPPAGE),
                }
            } else if rng.gen::<f64>() < LIMIT_FILL_RATE {
                event.price
            } else {
                result.skipped_unfilled += 1;
                continue;
            };

            let margin = params.margin_for(direction);
            let leverage = params.leverage.max(1) as f64;
            let notional = margin * leverage;
            let quantity = notional / entry_price;
            let (take_profit, stop_loss, liquidation_price) = match direction {
                SignalDirection::Long => (
                    entry_price * (1.0 + params.tp_percent / 100.0),
                    entry_price * (1.0 - params.sl_percent / 100.0),
                    entry_price * (1.0 - 1.0 / leverage),
                ),
                SignalDirection::Short => (
                    entry_price * (1.0 - params.tp_percent / 100.0),
                    entry_price * (1.0 + params.sl_percent / 100.0),
                    entry_price * (1.0 + 1.0 / leverage),
                ),
            };
            let entry_fee =
                notional * (0.9 * maker_fee + 0.1 * taker_fee) * AVG_FILLS_PER_TRADE;

            slots[d] = Some(OpenSlot {
                direction,
                entry_time: now,
                entry_price,
                quantity,
                margin,
                take_profit,
                stop_loss,
                liquidation_price,
                entry_fee,
            });
            last_entry = now;
        }
    }

    // Leftovers close at the last bar, no slippage, maker exit.
    if let Some(last_bar) = candles.last() {
        for slot in slots.iter_mut() {
            if let Some(open) = slot.take() {
                let exit_price = last_bar.close;
                let exit_fee = open.quantity * exit_price * maker_fee * AVG_FILLS_PER_TRADE;
                let pnl = direction_pnl(open.direction, open.entry_price, exit_price, open.quantity)
                    - open.entry_fee
                    - exit_fee;
                record_trade(
                    &mut result,
                    &mut trades,
                    SimTrade {
                        direction: open.direction,
                        entry_time: open.entry_time,
                        exit_time: last_bar.close_time,
                        entry_price: open.entry_price,
                        exit_price,
                        pnl,
                        reason: ExitReason::EndOfData,
                    },
                );
            }
        }
    }

    finalize(&mut result, &trades);
    result
}

fn evaluate_bar(
    open: &OpenSlot,
    bar: &Candle,
    bar_volatility: f64,
    vol_baseline: f64,
    taker_fee: f64,
    rng: &mut ChaCha8Rng,
) -> Option<SimTrade> {
    let long = open.direction == SignalDirection::Long;

    // Priority 1: liquidation wipes the margin plus the liquidation fee.
    let liquidated = if long {
        bar.low <= open.liquidation_price
    } else {
        bar.high >= open.liquidation_price
    };
    if liquidated {
        let notional = open.quantity * open.liquidation_price;
        return Some(SimTrade {
            direction: open.direction,
            entry_time: open.entry_time,
            exit_time: bar.close_time,
            entry_price: open.entry_price,
            exit_price: open.liquidation_price,
            pnl: -open.margin - notional * LIQUIDATION_FEE - open.entry_fee,
            reason: ExitReason::Liquidation,
        });
    }

    let tp_touched = if long {
        bar.high >= open.take_profit
    } else {
        bar.low <= open.take_profit
    };
    let sl_touched = if long {
        bar.low <= open.stop_loss
    } else {
        bar.high >= open.stop_loss
    };

    let hit_tp = match (tp_touched, sl_touched) {
        (false, false) => return None,
        (true, false) => true,
        (false, true) => false,
        (true, true) => {
            // Whipsaw: the target closer to the open usually fills first.
            let tp_distance = (open.take_profit - bar.open).abs();
            let sl_distance = (open.stop_loss - bar.open).abs();
            let closer_is_tp = tp_distance <= sl_distance;
            if rng.gen::<f64>() < WHIPSAW_CLOSER_PROB {
                closer_is_tp
            } else {
                !closer_is_tp
            }
        }
    };

    let vol_factor = if vol_baseline > 0.0 {
        bar_volatility / vol_baseline
    } else {
        1.0
    };
    let (target, slippage) = if hit_tp {
        (open.take_profit, TP_SLIPPAGE)
    } else if vol_factor > VOLATILITY_SPIKE {
        (open.stop_loss, SL_SLIPPAGE_VOLATILE)
    } else {
        (open.stop_loss, SL_SLIPPAGE_BASE)
    };
    let exit_price = if long {
        target * (1.0 - slippage)
    } else {
        target * (1.0 + slippage)
    };
    let exit_fee = open.quantity * exit_price * taker_fee * AVG_FILLS_PER_TRADE;
    let pnl = direction_pnl(open.direction, open.entry_price, exit_price, open.quantity)
        - open.entry_fee
        - exit_fee;

    Some(SimTrade {
        direction: open.direction,
        entry_time: open.entry_time,
        exit_time: bar.close_time,
        entry_price: open.entry_price,
        exit_price,
        pnl,
        reason: if hit_tp {
            ExitReason::TakeProfit
        } else {
            ExitReason::StopLoss
        },
    })
}

fn direction_pnl(direction: SignalDirection, entry: f64, exit: f64, quantity: f64) -> f64 {
    match direction {
        SignalDirection::Long => (exit - entry) * quantity,
        SignalDirection::Short => (entry - exit) * quantity,
    }
}

fn record_trade(result: &mut SimResult, trades: &mut Vec<SimTrade>, trade: SimTrade) {
    result.trades += 1;
    result.total_pnl += trade.pnl;
    if trade.pnl > 0.0 {
        result.wins += 1;
    } else {
        result.losses += 1;
    }
    if trade.reason == ExitReason::Liquidation {
        result.liquidations += 1;
    }
    trades.push(trade);
}

fn finalize(result: &mut SimResult, trades: &[SimTrade]) {
    if trades.is_empty() {
        return;
    }
    let gross_win: f64 = trades.iter().map(|t| t.pnl.max(0.0)).sum();
    let gross_loss: f64 = trades.iter().map(|t| (-t.pnl).max(0.0)).sum();
    result.profit_factor = if gross_loss > f64::EPSILON {
        gross_win / gross_loss
    } else if gross_win > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    result.win_rate = result.wins as f64 / result.trades as f64;
    result.stop_rate = trades
        .iter()
        .filter(|t| t.reason == ExitReason::StopLoss)
        .count() as f64
        / result.trades as f64;

    // Per-trade P&L drives the Sharpe estimate.
    let returns: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let std_dev = variance.sqrt();
    result.sharpe = if std_dev > f64::EPSILON {
        mean * (returns.len() as f64).sqrt() / std_dev
    } else {
        0.0
    };

    // Peak-to-trough on the cumulative P&L curve, in USDT.
    let mut equity = 0.0f64;
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for trade in trades {
        equity += trade.pnl;
        if equity > peak {
            peak = equity;
        }
        let drawdown = peak - equity;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }
    result.max_drawdown = max_drawdown;
}

/// Rolling standard deviation of close-to-close log returns.
fn rolling_volatility(candles: &[Candle], window: usize) -> Vec<f64> {
    let mut returns = vec![0.0f64; candles.len()];
    for i in 1..candles.len() {
        if candles[i - 1].close > 0.0 && candles[i].close > 0.0 {
            returns[i] = (candles[i].close / candles[i - 1].close).ln();
        }
    }
    let mut volatility = vec![0.0f64; candles.len()];
    for i in 0..candles.len() {
        let start = i.saturating_sub(window);
        let slice = &returns[start..=i];
        if slice.len() < 2 {
            continue;
        }
        let mean = slice.iter().sum::<f64>() / slice.len() as f64;
        let variance =
            slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / slice.len() as f64;
        volatility[i] = variance.sqrt();
    }
    volatility
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;

    fn flat_candles(count: usize, price: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                open_time: i as i64 * 60_000,
                open: price,
                high: price,
                low: price,
                close: price,
                volume: 100.0,
                close_time: i as i64 * 60_000 + 59_999,
                quote_volume: 100.0 * price,
            })
            .collect()
    }

    fn params() -> CandidateParams {
        CandidateParams {
            long_threshold: 10_000.0,
            short_threshold: 10_000.0,
            tp_percent: 1.0,
            sl_percent: 5.0,
            leverage: 10,
            margin_usdt: 20.0,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            long_trade_size: 0.0,
            short_trade_size: 0.0,
        }
    }

    fn sell_liq(notional: f64, time: i64, price: f64) -> LiquidationEvent {
        LiquidationEvent {
            symbol: "ASTERUSDT".to_string(),
            side: TradeSide::Sell,
            price,
            quantity: notional / price,
            event_time: time,
            ingress_time: time,
        }
    }

    #[test]
    fn take_profit_path_wins() {
        // Bar 0 carries the signal; bar 1 spikes through the 1% target.
        let mut candles = flat_candles(3, 1.0);
        candles[1].high = 1.02;
        candles[2].high = 1.02;
        let liqs = vec![sell_liq(11_000.0, 30_000, 1.0)];
        let result = simulate(&params(), &candles, &liqs, 7, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
        // Either the limit filled (one winning trade) or the 15% skip hit.
        if result.trades == 1 {
            assert_eq!(result.wins, 1);
            assert_eq!(result.liquidations, 0);
            assert!(result.total_pnl > 0.0);
        } else {
            assert_eq!(result.skipped_unfilled, 1);
        }
    }

    #[test]
    fn same_seed_is_bit_identical() {
        let mut candles = flat_candles(10, 1.0);
        // A bar touching both targets forces the whipsaw branch.
        candles[2].high = 1.02;
        candles[2].low = 0.94;
        for bar in candles.iter_mut().skip(3) {
            bar.high = 1.02;
            bar.low = 0.94;
        }
        let liqs: Vec<LiquidationEvent> = (0..5)
            .map(|i| sell_liq(11_000.0, 30_000 + i * 40_000, 1.0))
            .collect();
        let a = simulate(&params(), &candles, &liqs, 99, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
        let b = simulate(&params(), &candles, &liqs, 99, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
        assert_eq!(a.trades, b.trades);
        assert_eq!(a.total_pnl, b.total_pnl);
        assert_eq!(a.stop_rate, b.stop_rate);
    }

    #[test]
    fn liquidation_bar_costs_full_margin() {
        let mut candles = flat_candles(3, 1.0);
        // 10x leverage puts the liquidation price at 0.90; bar 1 crashes through.
        candles[1].low = 0.85;
        candles[2].low = 0.85;
        let liqs = vec![sell_liq(11_000.0, 30_000, 1.0)];
        // Run across seeds until one fills the entry (85%).
        let mut checked = false;
        for seed in 0..20 {
            let result =
                simulate(&params(), &candles, &liqs, seed, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
            if result.trades == 1 && result.liquidations == 1 {
                assert!(result.total_pnl < -20.0); // full margin plus fees
                checked = true;
                break;
            }
        }
        assert!(checked);
    }

    #[test]
    fn hunter_cooldown_limits_entry_rate() {
        let candles = flat_candles(60, 1.0);
        // A qualifying burst every minute for an hour.
        let liqs: Vec<LiquidationEvent> = (0..60)
            .map(|i| sell_liq(11_000.0, i * 60_000 + 1, 1.0))
            .collect();
        let mut p = params();
        p.cooldown_ms = 0;
        p.tp_percent = 50.0; // unreachable: slots stay occupied
        p.sl_percent = 9.0;
        let no_cooldown = simulate(&p, &candles, &liqs, 3, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
        let with_cooldown =
            simulate(&p, &candles, &liqs, 3, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 30 * 60_000);
        // The 30-minute hunter cooldown can only reduce entries.
        assert!(with_cooldown.trades + with_cooldown.skipped_unfilled
            <= no_cooldown.trades + no_cooldown.skipped_unfilled);
    }

    #[test]
    fn empty_inputs_produce_empty_result() {
        let result = simulate(&params(), &[], &[], 1, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE, 0);
        assert_eq!(result.trades, 0);
        let result = simulate(
            &params(),
            &flat_candles(5, 1.0),
            &[],
            1,
            DEFAULT_MAKER_FEE,
            DEFAULT_TAKER_FEE,
            0,
        );
        assert_eq!(result.trades, 0);
        assert_eq!(result.total_pnl, 0.0);
    }
}
