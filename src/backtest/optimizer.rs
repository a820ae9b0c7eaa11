//! Parameter optimizer.
//!
//! Sweeps a candidate grid per symbol over the stored liquidations and
//! cached candles, rejects unsafe or unprofitable combinations, scores the
//! survivors, and emits a recommended per-symbol configuration. The
//! recommendation is printed/written only; applying it requires explicit
//! confirmation via environment flags.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{info, warn};

use crate::config::Config;
use crate::exchange::client::ExchangeClient;
use crate::models::now_ms;
use crate::storage::LiquidationStore;

use super::candles::CandleCache;
use super::{simulate, CandidateParams, SimResult, DEFAULT_MAKER_FEE, DEFAULT_TAKER_FEE};

/// Minimum acceptable profit factor.
const MIN_PROFIT_FACTOR: f64 = 1.05;
/// Maximum acceptable fraction of stop-loss exits.
const MAX_STOP_RATE: f64 = 0.65;
/// SL must stay clear of 90% of the liquidation distance.
const LIQ_DISTANCE_GUARD: f64 = 0.9;
/// Minimum TP/SL ratio.
const MIN_TP_SL_RATIO: f64 = 0.33;
/// Required edge over the breakeven win rate.
const WIN_RATE_EDGE: f64 = 0.05;
/// Sharpe contribution is clamped to this band.
const SHARPE_CAP: f64 = 5.0;

/// Replay depth: 1-minute bars, up to 7 days.
pub const CANDLE_INTERVAL: &str = "1m";
pub const LOOKBACK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerWeights {
    pub pnl: f64,
    pub sharpe: f64,
    pub drawdown: f64,
}

impl Default for OptimizerWeights {
    fn default() -> Self {
        Self {
            pnl: 0.5,
            sharpe: 0.3,
            drawdown: 0.2,
        }
    }
}

impl OptimizerWeights {
    /// `OPTIMIZER_WEIGHT_{PNL,SHARPE,DRAWDOWN}`, normalized to sum 1.
    pub fn from_env() -> Self {
        let read = |name: &str, default: f64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| *v >= 0.0)
                .unwrap_or(default)
        };
        let mut weights = Self {
            pnl: read("OPTIMIZER_WEIGHT_PNL", 0.5),
            sharpe: read("OPTIMIZER_WEIGHT_SHARPE", 0.3),
            drawdown: read("OPTIMIZER_WEIGHT_DRAWDOWN", 0.2),
        };
        weights.normalize();
        weights
    }

    pub fn normalize(&mut self) {
        let sum = self.pnl + self.sharpe + self.drawdown;
        if sum > f64::EPSILON {
            self.pnl /= sum;
            self.sharpe /= sum;
            self.drawdown /= sum;
        } else {
            *self = Self::default();
        }
    }
}

/// Why a candidate was thrown out, if it was.
pub fn rejection_reason(params: &CandidateParams, result: &SimResult) -> Option<&'static str> {
    if result.liquidations > 0 {
        return Some("produced a liquidation");
    }
    if result.profit_factor < MIN_PROFIT_FACTOR {
        return Some("profit factor below 1.05");
    }
    if result.stop_rate > MAX_STOP_RATE {
        return Some("stop rate above 0.65");
    }
    let liq_distance_pct = 100.0 / params.leverage.max(1) as f64;
    if params.sl_percent >= LIQ_DISTANCE_GUARD * liq_distance_pct {
        return Some("stop inside liquidation distance");
    }
    if params.tp_percent / params.sl_percent < MIN_TP_SL_RATIO {
        return Some("tp/sl ratio below 0.33");
    }
    let breakeven = params.sl_percent / (params.tp_percent + params.sl_percent);
    if result.win_rate < breakeven + WIN_RATE_EDGE {
        return Some("win rate below breakeven edge");
    }
    None
}

/// `w_pnl * P + w_sharpe * S + w_dd * (P / (max_dd + 1))`, Sharpe clamped.
pub fn score(result: &SimResult, weights: &OptimizerWeights) -> f64 {
    let sharpe = result.sharpe.clamp(-SHARPE_CAP, SHARPE_CAP);
    weights.pnl * result.total_pnl
        + weights.sharpe * sharpe
        + weights.drawdown * (result.total_pnl / (result.max_drawdown + 1.0))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRecommendation {
    pub symbol: String,
    pub params: CandidateParams,
    pub score: f64,
    pub result: SimResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub recommendations: Vec<SymbolRecommendation>,
    pub recommended_max_open_positions: usize,
    pub symbols_without_candidates: Vec<String>,
}

/// Default sweep grid around a symbol's configured baseline.
pub fn candidate_grid(base_margin: f64) -> Vec<CandidateParams> {
    let thresholds = [5_000.0, 10_000.0, 20_000.0];
    let tp_percents = [0.5, 1.0, 2.0];
    let sl_percents = [1.0, 2.0, 5.0];
    let leverages = [5u32, 10, 20];
    let windows_ms = [30_000i64, 60_000, 120_000];
    let cooldowns_ms = [30_000i64, 60_000];

    let mut grid = Vec::new();
    for &threshold in &thresholds {
        for &tp in &tp_percents {
            for &sl in &sl_percents {
                for &leverage in &leverages {
                    for &window in &windows_ms {
                        for &cooldown in &cooldowns_ms {
                            grid.push(CandidateParams {
                                long_threshold: threshold,
                                short_threshold: threshold,
                                tp_percent: tp,
                                sl_percent: sl,
                                leverage,
                                margin_usdt: base_margin,
                                window_ms: window,
                                cooldown_ms: cooldown,
                                long_trade_size: 0.0,
                                short_trade_size: 0.0,
                            });
                        }
                    }
                }
            }
        }
    }
    grid
}

pub struct Optimizer {
    pub weights: OptimizerWeights,
    pub seed: u64,
    pub hunter_cooldown_ms: i64,
}

impl Optimizer {
    pub fn new(weights: OptimizerWeights, seed: u64, hunter_cooldown_ms: i64) -> Self {
        Self {
            weights,
            seed,
            hunter_cooldown_ms,
        }
    }

    /// Score every candidate in parallel and keep the best survivor.
    pub fn evaluate_symbol(
        &self,
        symbol: &str,
        candles: &[crate::exchange::types::Candle],
        liquidations: &[crate::models::LiquidationEvent],
        grid: &[CandidateParams],
    ) -> Option<SymbolRecommendation> {
        let base_seed = self.seed ^ hash_symbol(symbol);
        let best = grid
            .par_iter()
            .enumerate()
            .filter_map(|(index, params)| {
                let seed = base_seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                let result = simulate(
                    params,
                    candles,
                    liquidations,
                    seed,
                    DEFAULT_MAKER_FEE,
                    DEFAULT_TAKER_FEE,
                    self.hunter_cooldown_ms,
                );
                if rejection_reason(params, &result).is_some() {
                    return None;
                }
                let score = score(&result, &self.weights);
                Some((params.clone(), score, result))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        best.map(|(params, score, result)| SymbolRecommendation {
            symbol: symbol.to_string(),
            params,
            score,
            result,
        })
    }

    /// Full offline run over every configured symbol.
    pub async fn run(
        &self,
        config: &Config,
        store: &LiquidationStore,
        cache: &CandleCache,
        client: Option<&ExchangeClient>,
    ) -> Result<OptimizationReport> {
        let to = now_ms();
        let from = to - LOOKBACK_DAYS * 24 * 60 * 60 * 1000;
        let mut report = OptimizationReport::default();

        for (symbol, settings) in &config.symbols {
            if let Some(client) = client {
                if let Err(e) = cache
                    .ensure_range(client, symbol, CANDLE_INTERVAL, from, to)
                    .await
                {
                    warn!(symbol = %symbol, error = %e, "candle fetch failed, using cache only");
                }
            }
            let candles = cache
                .load(symbol, CANDLE_INTERVAL, from, to)
                .with_context(|| format!("loading candles for {symbol}"))?;
            let liquidations = store
                .query(Some(symbol), Some(from), Some(to), u32::MAX, 0)
                .with_context(|| format!("loading liquidations for {symbol}"))?;
            info!(
                symbol = %symbol,
                candles = candles.len(),
                liquidations = liquidations.len(),
                "optimizing"
            );

            let grid = candidate_grid(settings.trade_size);
            match self.evaluate_symbol(symbol, &candles, &liquidations, &grid) {
                Some(recommendation) => {
                    info!(
                        symbol = %symbol,
                        score = recommendation.score,
                        pnl = recommendation.result.total_pnl,
                        trades = recommendation.result.trades,
                        "best candidate"
                    );
                    report.recommendations.push(recommendation);
                }
                None => {
                    warn!(symbol = %symbol, "no candidate survived the rejection gates");
                    report.symbols_without_candidates.push(symbol.clone());
                }
            }
        }

        report.recommended_max_open_positions = report.recommendations.len();
        Ok(report)
    }
}

/// `FORCE_OPTIMIZER_OVERWRITE` / `FORCE_OPTIMIZER_CONFIRM` gate config writes.
pub fn overwrite_confirmed() -> bool {
    let truthy = |name: &str| {
        std::env::var(name)
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    };
    truthy("FORCE_OPTIMIZER_OVERWRITE") || truthy("FORCE_OPTIMIZER_CONFIRM")
}

/// Fold a report into a new config. Only called after explicit confirmation.
pub fn apply_report(config: &Config, report: &OptimizationReport) -> Config {
    let mut updated = config.clone();
    for rec in &report.recommendations {
        let entry = updated.symbols.entry(rec.symbol.clone()).or_default();
        entry.long_volume_threshold_usdt = Some(rec.params.long_threshold);
        entry.short_volume_threshold_usdt = Some(rec.params.short_threshold);
        entry.tp_percent = rec.params.tp_percent;
        entry.sl_percent = rec.params.sl_percent;
        entry.leverage = rec.params.leverage;
        entry.threshold_time_window_ms = rec.params.window_ms;
        entry.threshold_cooldown_ms = rec.params.cooldown_ms;
    }
    if report.recommended_max_open_positions > 0 {
        updated.global.max_open_positions = report.recommended_max_open_positions;
    }
    updated
}

fn hash_symbol(symbol: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    symbol.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_result() -> SimResult {
        SimResult {
            trades: 40,
            wins: 30,
            losses: 10,
            total_pnl: 120.0,
            profit_factor: 2.0,
            sharpe: 1.2,
            max_drawdown: 30.0,
            stop_rate: 0.2,
            win_rate: 0.75,
            liquidations: 0,
            skipped_unfilled: 3,
        }
    }

    fn safe_params() -> CandidateParams {
        CandidateParams {
            long_threshold: 10_000.0,
            short_threshold: 10_000.0,
            tp_percent: 1.0,
            sl_percent: 2.0,
            leverage: 10,
            margin_usdt: 20.0,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            long_trade_size: 0.0,
            short_trade_size: 0.0,
        }
    }

    #[test]
    fn healthy_candidate_survives() {
        assert_eq!(rejection_reason(&safe_params(), &passing_result()), None);
    }

    #[test]
    fn every_rejection_predicate_fires() {
        // (a) liquidation
        let mut r = passing_result();
        r.liquidations = 1;
        assert!(rejection_reason(&safe_params(), &r).is_some());

        // (b) profit factor / stop rate
        let mut r = passing_result();
        r.profit_factor = 1.0;
        assert_eq!(
            rejection_reason(&safe_params(), &r),
            Some("profit factor below 1.05")
        );
        let mut r = passing_result();
        r.stop_rate = 0.7;
        assert_eq!(
            rejection_reason(&safe_params(), &r),
            Some("stop rate above 0.65")
        );

        // (c) SL inside 90% of the liquidation distance: 10x => 10%, 0.9*10 = 9.
        let mut p = safe_params();
        p.sl_percent = 9.0;
        p.tp_percent = 3.0;
        assert_eq!(
            rejection_reason(&p, &passing_result()),
            Some("stop inside liquidation distance")
        );

        // (d) TP/SL ratio
        let mut p = safe_params();
        p.tp_percent = 0.5;
        p.sl_percent = 2.0;
        assert_eq!(
            rejection_reason(&p, &passing_result()),
            Some("tp/sl ratio below 0.33")
        );

        // (e) win rate below breakeven + 5%: breakeven = 2/(1+2) = 0.667.
        let mut r = passing_result();
        r.win_rate = 0.68;
        assert_eq!(
            rejection_reason(&safe_params(), &r),
            Some("win rate below breakeven edge")
        );
    }

    #[test]
    fn score_clamps_sharpe_and_weights_mix() {
        let weights = OptimizerWeights::default();
        let mut r = passing_result();
        r.sharpe = 50.0;
        let capped = score(&r, &weights);
        r.sharpe = 5.0;
        let at_cap = score(&r, &weights);
        assert!((capped - at_cap).abs() < 1e-12);

        // Pure-pnl weighting scores exactly the pnl.
        let pnl_only = OptimizerWeights {
            pnl: 1.0,
            sharpe: 0.0,
            drawdown: 0.0,
        };
        assert!((score(&passing_result(), &pnl_only) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn weights_normalize_to_unit_sum() {
        let mut weights = OptimizerWeights {
            pnl: 5.0,
            sharpe: 3.0,
            drawdown: 2.0,
        };
        weights.normalize();
        assert!((weights.pnl - 0.5).abs() < 1e-12);
        assert!((weights.sharpe - 0.3).abs() < 1e-12);
        assert!((weights.drawdown - 0.2).abs() < 1e-12);
    }

    #[test]
    fn grid_covers_expected_volume() {
        let grid = candidate_grid(20.0);
        // 3 thresholds x 3 tp x 3 sl x 3 leverage x 3 windows x 2 cooldowns.
        assert_eq!(grid.len(), 486);
        assert!(grid.iter().all(|p| p.margin_usdt == 20.0));
    }

    #[test]
    fn apply_report_rewrites_symbol_settings() {
        let mut config = Config::default();
        config
            .symbols
            .insert("ASTERUSDT".to_string(), Default::default());
        let report = OptimizationReport {
            recommendations: vec![SymbolRecommendation {
                symbol: "ASTERUSDT".to_string(),
                params: CandidateParams {
                    long_threshold: 20_000.0,
                    short_threshold: 20_000.0,
                    tp_percent: 2.0,
                    sl_percent: 4.0,
                    leverage: 5,
                    margin_usdt: 20.0,
                    window_ms: 120_000,
                    cooldown_ms: 60_000,
                    long_trade_size: 0.0,
                    short_trade_size: 0.0,
                },
                score: 1.0,
                result: passing_result(),
            }],
            recommended_max_open_positions: 1,
            symbols_without_candidates: vec![],
        };
        let updated = apply_report(&config, &report);
        let sym = &updated.symbols["ASTERUSDT"];
        assert_eq!(sym.leverage, 5);
        assert_eq!(sym.long_volume_threshold_usdt, Some(20_000.0));
        assert_eq!(updated.global.max_open_positions, 1);
    }
}
