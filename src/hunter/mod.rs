//! Hunter.
//!
//! Consumes the liquidation stream, runs the signal gate (thresholds,
//! cooldowns, mark-price proximity, VWAP policy, capacity), translates a
//! passing signal into a normalized entry order, and tracks the order in the
//! pending registry until the position manager confirms it.

pub mod pending;
pub mod thresholds;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, SharedConfig, SymbolSettings};
use crate::errors::ExchangeError;
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::exchange::client::{ExchangeClient, OrderParams};
use crate::exchange::filters::{SymbolCatalog, Validation};
use crate::exchange::price_feed::PriceFeed;
use crate::exchange::rate_limit::Priority;
use crate::exchange::types::{OrderTradeUpdate, OrderUpdateDetail, UserDataEvent};
use crate::models::{
    now_ms, BlockReason, LiquidationEvent, OrderType, PositionMode, SignalDirection,
    TradeDecision,
};
use crate::position::PositionTracker;
use crate::storage::LiquidationSink;

use pending::PendingOrderRegistry;
use thresholds::ThresholdMonitor;

/// Mark-price proximity band: a long signal needs price/mark < 1.01, a short
/// needs > 0.99.
const MARK_PROXIMITY: f64 = 0.01;
/// Budget for the single MARKET fallback, measured from the first attempt.
const FALLBACK_BUDGET: Duration = Duration::from_secs(15);
/// Symbol throttle after an insufficient-balance rejection.
const BALANCE_THROTTLE_MS: i64 = 60_000;
/// Paper order ids live far above anything the venue assigns.
const PAPER_ORDER_ID_BASE: i64 = 9_000_000_000_000;

pub struct Hunter {
    config: SharedConfig,
    catalog: Arc<SymbolCatalog>,
    client: Arc<ExchangeClient>,
    price_feed: Arc<PriceFeed>,
    sink: LiquidationSink,
    pub monitor: ThresholdMonitor,
    pub pending: PendingOrderRegistry,
    bus: StatusBroadcaster,
    tracker: RwLock<Option<Arc<dyn PositionTracker>>>,
    /// Local view of the venue position mode; resynced every 2 min and on
    /// -4061 rejections.
    hedge_mode: AtomicBool,
    throttled_until: Mutex<HashMap<String, i64>>,
    leverage_applied: Mutex<HashMap<String, u32>>,
    paper_stream: Mutex<Option<mpsc::UnboundedSender<UserDataEvent>>>,
    paper_order_seq: AtomicI64,
}

impl Hunter {
    pub fn new(
        config: SharedConfig,
        catalog: Arc<SymbolCatalog>,
        client: Arc<ExchangeClient>,
        price_feed: Arc<PriceFeed>,
        sink: LiquidationSink,
        bus: StatusBroadcaster,
    ) -> Self {
        let hedge = config.read().global.position_mode.is_hedge();
        Self {
            config,
            catalog,
            client,
            price_feed,
            sink,
            monitor: ThresholdMonitor::new(),
            pending: PendingOrderRegistry::new(),
            bus,
            tracker: RwLock::new(None),
            hedge_mode: AtomicBool::new(hedge),
            throttled_until: Mutex::new(HashMap::new()),
            leverage_applied: Mutex::new(HashMap::new()),
            paper_stream: Mutex::new(None),
            paper_order_seq: AtomicI64::new(0),
        }
    }

    pub fn set_position_tracker(&self, tracker: Arc<dyn PositionTracker>) {
        *self.tracker.write() = Some(tracker);
    }

    /// Paper mode: synthetic fills are injected into the user-data channel so
    /// the position manager exercises the same reconciliation path.
    pub fn set_paper_stream(&self, tx: mpsc::UnboundedSender<UserDataEvent>) {
        *self.paper_stream.lock() = Some(tx);
    }

    pub fn is_hedge_mode(&self) -> bool {
        self.hedge_mode.load(Ordering::Relaxed)
    }

    /// Atomic config swap. Returns the changed field paths; an identical
    /// config is a no-op. The caller rebuilds streams on paper/live flips.
    pub fn update_config(&self, new_config: Config) -> Vec<String> {
        let changed = {
            let current = self.config.read();
            current.diff(&new_config)
        };
        if changed.is_empty() {
            debug!("config update carries no changes");
            return changed;
        }
        info!(fields = ?changed, "applying config update");
        *self.config.write() = new_config;
        self.bus.emit(StatusEvent::ConfigUpdated {
            changed: changed.clone(),
        });
        changed
    }

    /// Entry point for every liquidation print. Persists the event, updates
    /// the rolling windows, and walks the signal gate.
    pub async fn on_liquidation(&self, event: LiquidationEvent) {
        // Persist and count unconditionally, even for unconfigured symbols.
        self.sink.offer(event.clone());
        let (symbol_cfg, global) = {
            let config = self.config.read();
            (
                config.symbols.get(&event.symbol).cloned(),
                config.global.clone(),
            )
        };
        let window_ms = symbol_cfg
            .as_ref()
            .map(|c| c.threshold_time_window_ms)
            .unwrap_or(60_000);
        self.monitor.record(&event, window_ms);

        let Some(cfg) = symbol_cfg else {
            return;
        };

        let direction = SignalDirection::from_liquidation_side(event.side);
        let threshold = cfg.threshold_for(direction);
        let now = event.event_time;

        // Threshold gate: cumulative window volume, or the single print in
        // instant mode.
        let use_threshold = global.use_threshold_system && cfg.use_threshold;
        let volume = if use_threshold {
            self.monitor
                .cumulative(&event.symbol, direction, now, cfg.threshold_time_window_ms)
        } else {
            event.notional()
        };
        if volume < threshold {
            debug!(
                symbol = %event.symbol,
                direction = %direction,
                volume,
                threshold,
                "below threshold"
            );
            return;
        }

        // Cooldowns apply in both modes.
        let cooldowns = self.monitor.cooldown_state(
            &event.symbol,
            direction,
            now,
            cfg.threshold_cooldown_ms,
            global.hunter_cooldown_ms,
        );
        if cooldowns.blocked() {
            self.block(
                &event.symbol,
                direction,
                BlockReason::Cooldown {
                    remaining_ms: cooldowns.report_ms(),
                },
            );
            return;
        }

        // The signal fired: stamp both cooldown clocks before any await so a
        // replay of the same burst cannot double-trigger.
        self.monitor.mark_trigger(&event.symbol, direction, now);

        let mark = match self.price_feed.mark_price_or_fetch(&event.symbol).await {
            Ok(mark) => mark,
            Err(e) => {
                warn!(symbol = %event.symbol, error = %e, "no mark price, skipping signal");
                return;
            }
        };

        // The print must sit within 1% of the mark on the correct side.
        let ratio = event.price / mark;
        let proximate = match direction {
            SignalDirection::Long => ratio < 1.0 + MARK_PROXIMITY,
            SignalDirection::Short => ratio > 1.0 - MARK_PROXIMITY,
        };
        if !proximate {
            self.block(
                &event.symbol,
                direction,
                BlockReason::PriceDeviation {
                    mark,
                    price: event.price,
                },
            );
            return;
        }

        // VWAP trend filter.
        let mut vwap_source = None;
        if cfg.vwap_protection {
            let reading = self
                .price_feed
                .vwap_or_fetch(&event.symbol, &cfg.vwap_timeframe, cfg.vwap_lookback)
                .await;
            match reading {
                Ok((vwap, source)) => {
                    if source != "stream" {
                        vwap_source = Some(source.to_string());
                    }
                    let allowed = match direction {
                        SignalDirection::Long => event.price < vwap,
                        SignalDirection::Short => event.price > vwap,
                    };
                    if !allowed {
                        self.block(
                            &event.symbol,
                            direction,
                            BlockReason::VwapFilter {
                                vwap,
                                price: event.price,
                            },
                        );
                        return;
                    }
                }
                Err(e) => {
                    // Stale inputs are never traded on.
                    warn!(symbol = %event.symbol, error = %e, "vwap unavailable, skipping signal");
                    return;
                }
            }
        }

        if !self.capacity_checks(&event.symbol, direction, &cfg, &global).await {
            return;
        }

        let confidence = (volume / threshold).min(2.0) / 2.0;
        self.bus.emit(StatusEvent::TradeDecision(TradeDecision {
            symbol: event.symbol.clone(),
            direction,
            reason: format!(
                "liquidation volume {:.0} USDT over threshold {:.0}",
                volume, threshold
            ),
            confidence,
            vwap_source,
        }));

        self.submit_entry(&event, direction, &cfg, global.paper_mode, mark)
            .await;
    }

    /// Capacity gates: throttle, pending guard, global cap, per-symbol caps,
    /// margin budget, wallet margin.
    async fn capacity_checks(
        &self,
        symbol: &str,
        direction: SignalDirection,
        cfg: &SymbolSettings,
        global: &crate::config::GlobalSettings,
    ) -> bool {
        let now = now_ms();
        if let Some(until) = self.throttled_until.lock().get(symbol).copied() {
            if until > now {
                self.block(
                    symbol,
                    direction,
                    BlockReason::SymbolThrottled {
                        remaining_ms: until - now,
                    },
                );
                return false;
            }
        }

        if self.pending.has_pending_for_symbol(symbol) {
            self.block(symbol, direction, BlockReason::PendingOrder);
            return false;
        }

        let tracker = self.tracker.read().clone();
        let Some(tracker) = tracker else {
            warn!("no position tracker wired, refusing entry");
            return false;
        };

        let open = tracker.unique_position_count();
        if open >= global.max_open_positions {
            self.block(
                symbol,
                direction,
                BlockReason::MaxPositions {
                    open,
                    max: global.max_open_positions,
                },
            );
            return false;
        }

        if let Err(reason) = tracker.can_open_position(symbol, direction) {
            self.block(symbol, direction, BlockReason::PositionLimit { reason });
            return false;
        }

        let margin = cfg.margin_for(direction);
        let used = tracker.margin_usage(symbol);
        if used + margin > cfg.max_position_margin_usdt {
            self.block(
                symbol,
                direction,
                BlockReason::MarginCap {
                    used,
                    max: cfg.max_position_margin_usdt,
                },
            );
            return false;
        }

        if !global.paper_mode {
            match self.client.available_usdt().await {
                Ok(available) if available < margin => {
                    self.block(
                        symbol,
                        direction,
                        BlockReason::InsufficientMargin {
                            required: margin,
                            available,
                        },
                    );
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "balance check failed, skipping signal");
                    return false;
                }
            }
        }

        true
    }

    /// Compute, normalize, and submit the entry order.
    async fn submit_entry(
        &self,
        event: &LiquidationEvent,
        direction: SignalDirection,
        cfg: &SymbolSettings,
        paper_mode: bool,
        mark: f64,
    ) {
        let symbol = &event.symbol;
        let filter = match self.catalog.ensure(symbol).await {
            Ok(filter) => filter,
            Err(e) => {
                self.trading_error("SYMBOL_FILTER", &e.to_string(), symbol);
                return;
            }
        };

        let margin = cfg.margin_for(direction);
        let leverage = cfg.leverage.max(1);
        let notional = (margin * leverage as f64).max(filter.min_notional * 1.01);
        let side = direction.entry_side();
        let mode = if self.is_hedge_mode() {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        };
        let position_side = direction.position_side(mode);

        // Maker-side offset from the mark.
        let offset = cfg.price_offset_bps / 10_000.0;
        let optimal = match direction {
            SignalDirection::Long => mark * (1.0 - offset),
            SignalDirection::Short => mark * (1.0 + offset),
        };
        let price = self.catalog.format_price(symbol, optimal);

        let mut order_type = cfg.order_type;
        if cfg.force_market_entry {
            order_type = OrderType::Market;
        } else if order_type == OrderType::Limit {
            let slippage_bps = ((price - mark).abs() / mark) * 10_000.0;
            if slippage_bps > cfg.max_slippage_bps {
                debug!(symbol = %symbol, slippage_bps, "limit offset beyond slippage cap, using market");
                order_type = OrderType::Market;
            }
        }

        let price_basis = match order_type {
            OrderType::Limit => price,
            OrderType::Market => mark,
        };
        let mut quantity = self.catalog.format_quantity(symbol, notional / price_basis);
        if quantity < filter.min_qty || quantity <= 0.0 {
            self.block(
                symbol,
                direction,
                BlockReason::TradeSizeTooSmall {
                    recommended_min: filter.min_notional * 1.01 / leverage as f64,
                },
            );
            return;
        }
        match self.catalog.validate(symbol, price_basis, quantity) {
            Validation::Ok => {}
            Validation::Adjusted { quantity: q, .. } => quantity = q,
            Validation::Rejected(reason) => {
                self.trading_error("FILTER_REJECT", &reason, symbol);
                return;
            }
        }

        if !paper_mode {
            self.ensure_leverage(symbol, leverage).await;
        }

        let Some(temp_key) = self.pending.reserve(symbol, side, now_ms()) else {
            self.block(symbol, direction, BlockReason::PendingOrder);
            return;
        };

        let params = match order_type {
            OrderType::Limit => {
                let mut p = OrderParams::limit(symbol, side, position_side, quantity, price);
                if cfg.use_post_only {
                    p = p.post_only();
                }
                p
            }
            OrderType::Market => OrderParams::market(symbol, side, position_side, quantity),
        };

        if paper_mode {
            self.simulate_entry(&temp_key, &params, price_basis);
            return;
        }

        let attempt_start = Instant::now();
        match self
            .client
            .place_order(&params, mode.is_hedge(), Priority::High)
            .await
        {
            Ok(ack) => {
                self.pending.confirm(&temp_key, ack.order_id);
                info!(
                    symbol = %symbol,
                    order_id = ack.order_id,
                    side = %side,
                    qty = quantity,
                    order_type = %params.order_type,
                    "entry order placed"
                );
            }
            Err(ExchangeError::PositionModeMismatch { .. }) => {
                self.retry_after_mode_requery(&temp_key, params, direction).await;
            }
            Err(ExchangeError::InsufficientBalance { msg }) => {
                self.pending.remove(&temp_key);
                self.throttled_until
                    .lock()
                    .insert(symbol.clone(), now_ms() + BALANCE_THROTTLE_MS);
                self.trading_error("INSUFFICIENT_BALANCE", &msg, symbol);
            }
            Err(e) if e.is_deterministic_reject() => {
                self.pending.remove(&temp_key);
                self.trading_error("ORDER_REJECTED", &e.to_string(), symbol);
            }
            Err(e) => {
                self.pending.remove(&temp_key);
                if params.order_type == "LIMIT" && attempt_start.elapsed() < FALLBACK_BUDGET {
                    warn!(symbol = %symbol, error = %e, "limit entry failed, trying market fallback");
                    self.market_fallback(&params, direction, mode.is_hedge()).await;
                } else {
                    self.trading_error("ENTRY_FAILED", &e.to_string(), symbol);
                }
            }
        }
    }

    /// -4061: the local position-mode flag drifted from the venue. Re-query
    /// once, flip the flag if it differs, and retry the order a single time.
    async fn retry_after_mode_requery(
        &self,
        temp_key: &str,
        mut params: OrderParams,
        direction: SignalDirection,
    ) {
        let symbol = params.symbol.clone();
        let venue_hedge = match self.client.position_mode().await {
            Ok(dual) => dual,
            Err(e) => {
                self.pending.remove(temp_key);
                self.trading_error("MODE_QUERY_FAILED", &e.to_string(), &symbol);
                return;
            }
        };
        let local_hedge = self.is_hedge_mode();
        if venue_hedge == local_hedge {
            self.pending.remove(temp_key);
            self.trading_error(
                "POSITION_MODE",
                "venue rejected position side but mode matches",
                &symbol,
            );
            return;
        }
        info!(
            venue_hedge,
            local_hedge, "position mode drift detected, updating local flag"
        );
        self.hedge_mode.store(venue_hedge, Ordering::Relaxed);
        let mode = if venue_hedge {
            PositionMode::Hedge
        } else {
            PositionMode::OneWay
        };
        params.position_side = direction.position_side(mode);
        match self.client.place_order(&params, venue_hedge, Priority::High).await {
            Ok(ack) => {
                self.pending.confirm(temp_key, ack.order_id);
                info!(symbol = %symbol, order_id = ack.order_id, "entry placed after mode retry");
            }
            Err(e) => {
                self.pending.remove(temp_key);
                self.trading_error("ENTRY_FAILED", &e.to_string(), &symbol);
            }
        }
    }

    /// Single MARKET fallback with the original quantity.
    async fn market_fallback(&self, original: &OrderParams, direction: SignalDirection, hedge: bool) {
        let symbol = original.symbol.clone();
        let Some(qty) = original.quantity else { return };
        let Some(temp_key) = self.pending.reserve(&symbol, original.side, now_ms()) else {
            return;
        };
        let params = OrderParams::market(&symbol, original.side, original.position_side, qty);
        match self.client.place_order(&params, hedge, Priority::High).await {
            Ok(ack) => {
                self.pending.confirm(&temp_key, ack.order_id);
                info!(symbol = %symbol, order_id = ack.order_id, direction = %direction, "market fallback filled the entry");
            }
            Err(e) => {
                self.pending.remove(&temp_key);
                self.trading_error("MARKET_FALLBACK_FAILED", &e.to_string(), &symbol);
            }
        }
    }

    /// Paper path: immediate synthetic ack + fill through the user-data
    /// channel so downstream state handling is identical to live.
    fn simulate_entry(&self, temp_key: &str, params: &OrderParams, fill_price: f64) {
        let order_id =
            PAPER_ORDER_ID_BASE + self.paper_order_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.confirm(temp_key, order_id);
        info!(
            symbol = %params.symbol,
            order_id,
            side = %params.side,
            qty = ?params.quantity,
            "paper entry filled"
        );
        if let Some(tx) = self.paper_stream.lock().as_ref() {
            let update = OrderTradeUpdate {
                event_time: now_ms(),
                order: OrderUpdateDetail {
                    symbol: params.symbol.clone(),
                    order_id,
                    side: params.side.as_str().to_string(),
                    position_side: params.position_side.as_str().to_string(),
                    order_type: params.order_type.clone(),
                    original_type: params.order_type.clone(),
                    status: "FILLED".to_string(),
                    execution_type: "TRADE".to_string(),
                    quantity: params.quantity.unwrap_or(0.0),
                    filled_qty: params.quantity.unwrap_or(0.0),
                    avg_price: fill_price,
                    last_price: fill_price,
                    realized_profit: 0.0,
                    reduce_only: false,
                    close_position: false,
                },
            };
            let _ = tx.send(UserDataEvent::OrderTradeUpdate(update));
        }
    }

    async fn ensure_leverage(&self, symbol: &str, leverage: u32) {
        let already = self.leverage_applied.lock().get(symbol).copied();
        if already == Some(leverage) {
            return;
        }
        match self.client.set_leverage(symbol, leverage).await {
            Ok(()) => {
                self.leverage_applied
                    .lock()
                    .insert(symbol.to_string(), leverage);
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "leverage update failed"),
        }
    }

    /// Reconcile the local hedge flag with the venue; runs every 2 min. In
    /// paper mode the configured mode is authoritative.
    pub async fn sync_position_mode(&self) {
        let (paper, want_hedge) = {
            let config = self.config.read();
            (
                config.global.paper_mode,
                config.global.position_mode.is_hedge(),
            )
        };
        if paper {
            self.hedge_mode.store(want_hedge, Ordering::Relaxed);
            return;
        }
        match self.client.position_mode().await {
            Ok(venue_hedge) => {
                if venue_hedge != want_hedge {
                    match self.client.set_position_mode(want_hedge).await {
                        Ok(()) => {
                            info!(hedge = want_hedge, "venue position mode updated");
                            self.hedge_mode.store(want_hedge, Ordering::Relaxed);
                        }
                        Err(ExchangeError::PositionModeLocked { msg }) => {
                            // Open orders/positions pin the mode; adopt the venue's.
                            warn!(reason = %msg, "cannot change position mode, adopting venue setting");
                            self.hedge_mode.store(venue_hedge, Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(error = %e, "position mode change failed");
                            self.hedge_mode.store(venue_hedge, Ordering::Relaxed);
                        }
                    }
                } else {
                    self.hedge_mode.store(venue_hedge, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(error = %e, "position mode query failed"),
        }
    }

    fn block(&self, symbol: &str, direction: SignalDirection, reason: BlockReason) {
        self.bus.emit(StatusEvent::TradeBlocked {
            symbol: symbol.to_string(),
            direction,
            reason,
        });
    }

    fn trading_error(&self, code: &str, reason: &str, symbol: &str) {
        error!(symbol = %symbol, code = %code, "{reason}");
        self.bus.emit(StatusEvent::TradingError {
            code: code.to_string(),
            reason: reason.to_string(),
            component: "hunter".to_string(),
        });
    }

    // -- background tasks ----------------------------------------------------

    /// Main ingest loop over the liquidation channel.
    pub fn spawn_ingest(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<LiquidationEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => self.on_liquidation(event).await,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// 30 s sweep of stale pending records.
    pub fn spawn_pending_sweeper(
        self: Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = self.pending.sweep(now_ms());
                        if removed > 0 {
                            warn!(removed, "swept stale pending orders");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// 2 min position-mode sync.
    pub fn spawn_mode_sync(
        self: Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(120));
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sync_position_mode().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Purge pending records when the position manager reports entry fills
    /// or cancellations.
    pub fn spawn_fill_listener(
        self: Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.bus.subscribe();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(StatusEvent::OrderFilled { order_id, reduce_only: false, .. }) => {
                            if self.pending.remove_by_order_id(order_id).is_some() {
                                debug!(order_id, "entry fill confirmed, pending record purged");
                            }
                        }
                        Ok(StatusEvent::OrderCancelled { order_id, .. }) => {
                            self.pending.remove_by_order_id(order_id);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "fill listener lagged on status bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, GlobalSettings};
    use crate::exchange::filters::SymbolFilter;
    use crate::exchange::rate_limit::RateLimitGovernor;
    use crate::storage::{spawn_writer, LiquidationStore};
    use crate::models::TradeSide;

    struct StubTracker {
        open: usize,
        margin: f64,
        refuse: Option<String>,
    }

    impl PositionTracker for StubTracker {
        fn margin_usage(&self, _symbol: &str) -> f64 {
            self.margin
        }
        fn can_open_position(&self, _symbol: &str, _direction: SignalDirection) -> Result<(), String> {
            match &self.refuse {
                Some(reason) => Err(reason.clone()),
                None => Ok(()),
            }
        }
        fn position_count_for_symbol_side(&self, _symbol: &str, _direction: SignalDirection) -> usize {
            0
        }
        fn unique_position_count(&self) -> usize {
            self.open
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.global = GlobalSettings {
            paper_mode: true,
            max_open_positions: 5,
            hunter_cooldown_ms: 120_000,
            ..GlobalSettings::default()
        };
        let mut sym = SymbolSettings::default();
        sym.volume_threshold_usdt = 10_000.0;
        sym.trade_size = 20.0;
        sym.leverage = 10;
        sym.price_offset_bps = 1.0;
        config.symbols.insert("ASTERUSDT".to_string(), sym);
        config
    }

    async fn test_hunter(config: Config, tracker: StubTracker) -> (Arc<Hunter>, StatusBroadcaster) {
        let governor = RateLimitGovernor::new(Default::default());
        let client = Arc::new(ExchangeClient::new(
            "https://example.invalid",
            crate::config::ApiCredentials::paper(),
            governor,
        ));
        let mut filters = HashMap::new();
        filters.insert(
            "ASTERUSDT".to_string(),
            SymbolFilter {
                tick_size: 0.0001,
                step_size: 1.0,
                min_qty: 1.0,
                min_notional: 5.0,
                price_scale: 4,
                qty_scale: 0,
            },
        );
        let catalog = Arc::new(SymbolCatalog::with_static(filters, None));
        let feed = Arc::new(PriceFeed::detached());
        feed.update_mark("ASTERUSDT", 1.0, now_ms());
        let store = Arc::new(LiquidationStore::open_in_memory().unwrap());
        let (sink, _writer) = spawn_writer(store, 64);
        let bus = StatusBroadcaster::new(64);
        let hunter = Arc::new(Hunter::new(
            shared(config),
            catalog,
            client,
            feed,
            sink,
            bus.clone(),
        ));
        hunter.set_position_tracker(Arc::new(tracker));
        (hunter, bus)
    }

    fn liq(symbol: &str, side: TradeSide, notional: f64, time: i64) -> LiquidationEvent {
        LiquidationEvent {
            symbol: symbol.to_string(),
            side,
            price: 0.995,
            quantity: notional / 0.995,
            event_time: time,
            ingress_time: time,
        }
    }

    #[tokio::test]
    async fn cascade_over_threshold_emits_decision_and_fills_paper_entry() {
        let (hunter, bus) = test_hunter(
            test_config(),
            StubTracker {
                open: 0,
                margin: 0.0,
                refuse: None,
            },
        )
        .await;
        let (paper_tx, mut paper_rx) = mpsc::unbounded_channel();
        hunter.set_paper_stream(paper_tx);
        let mut events = bus.subscribe();

        let t0 = now_ms();
        hunter.on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 4_000.0, t0)).await;
        hunter.on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 3_000.0, t0 + 20_000)).await;
        hunter.on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 4_000.0, t0 + 40_000)).await;

        // Decision fired on the third print (11k >= 10k).
        let mut saw_decision = false;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::TradeDecision(d) = event {
                assert_eq!(d.symbol, "ASTERUSDT");
                assert_eq!(d.direction, SignalDirection::Long);
                saw_decision = true;
            }
        }
        assert!(saw_decision);

        // Paper fill reached the user-data channel; qty = 20*10/limit price.
        match paper_rx.try_recv().unwrap() {
            UserDataEvent::OrderTradeUpdate(update) => {
                assert_eq!(update.order.symbol, "ASTERUSDT");
                assert_eq!(update.order.side, "BUY");
                assert!(update.order.is_filled());
                assert_eq!(update.order.quantity, 200.0);
            }
            other => panic!("unexpected paper event {other:?}"),
        }
        // Registry holds the paper order id until the fill listener purges it.
        assert!(hunter.pending.has_pending_for_symbol("ASTERUSDT"));
    }

    #[tokio::test]
    async fn cooldown_blocks_immediate_retrigger() {
        let (hunter, bus) = test_hunter(
            test_config(),
            StubTracker {
                open: 0,
                margin: 0.0,
                refuse: None,
            },
        )
        .await;
        let (paper_tx, _paper_rx) = mpsc::unbounded_channel();
        hunter.set_paper_stream(paper_tx);
        let mut events = bus.subscribe();

        let t0 = now_ms();
        hunter.on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 11_000.0, t0)).await;
        // Second burst 10s later: inside both cooldowns.
        hunter.on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 10_000.0, t0 + 10_000)).await;

        let mut blocked = None;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::TradeBlocked { reason, .. } = event {
                blocked = Some(reason);
            }
        }
        match blocked {
            Some(BlockReason::Cooldown { remaining_ms }) => assert!(remaining_ms > 0),
            other => panic!("expected cooldown block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn vwap_filter_blocks_long_above_vwap() {
        let mut config = test_config();
        config
            .symbols
            .get_mut("ASTERUSDT")
            .unwrap()
            .vwap_protection = true;
        let (hunter, bus) = test_hunter(
            config,
            StubTracker {
                open: 0,
                margin: 0.0,
                refuse: None,
            },
        )
        .await;
        // VWAP below the print price: long entries must be blocked.
        hunter.price_feed.on_kline(
            "ASTERUSDT",
            &crate::exchange::types::KlineDetail {
                open_time: 0,
                close_time: 59_999,
                open: 0.98,
                high: 0.98,
                low: 0.98,
                close: 0.98,
                volume: 1000.0,
                quote_volume: 0.0,
                closed: true,
            },
            20,
        );
        let mut events = bus.subscribe();
        hunter
            .on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 11_000.0, now_ms()))
            .await;

        let mut saw_vwap_block = false;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::TradeBlocked {
                reason: BlockReason::VwapFilter { .. },
                ..
            } = event
            {
                saw_vwap_block = true;
            }
        }
        assert!(saw_vwap_block);
        assert!(hunter.pending.is_empty());
    }

    #[tokio::test]
    async fn max_positions_blocks_entry() {
        let (hunter, bus) = test_hunter(
            test_config(),
            StubTracker {
                open: 5,
                margin: 0.0,
                refuse: None,
            },
        )
        .await;
        let mut events = bus.subscribe();
        hunter
            .on_liquidation(liq("ASTERUSDT", TradeSide::Sell, 11_000.0, now_ms()))
            .await;
        let mut saw_cap = false;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::TradeBlocked {
                reason: BlockReason::MaxPositions { open: 5, max: 5 },
                ..
            } = event
            {
                saw_cap = true;
            }
        }
        assert!(saw_cap);
    }

    #[tokio::test]
    async fn unconfigured_symbol_is_persisted_but_not_traded() {
        let (hunter, bus) = test_hunter(
            test_config(),
            StubTracker {
                open: 0,
                margin: 0.0,
                refuse: None,
            },
        )
        .await;
        let mut events = bus.subscribe();
        hunter
            .on_liquidation(liq("DOGEUSDT", TradeSide::Sell, 50_000.0, now_ms()))
            .await;
        assert!(events.try_recv().is_err());
        assert!(hunter.pending.is_empty());
    }

    #[test]
    fn identical_config_update_is_noop() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (hunter, _bus) = test_hunter(
                test_config(),
                StubTracker {
                    open: 0,
                    margin: 0.0,
                    refuse: None,
                },
            )
            .await;
            assert!(hunter.update_config(test_config()).is_empty());
            let mut changed_config = test_config();
            changed_config.global.max_open_positions = 9;
            let changed = hunter.update_config(changed_config);
            assert_eq!(changed, vec!["global.max_open_positions".to_string()]);
        });
    }
}
