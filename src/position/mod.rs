//! Position manager.
//!
//! Owns the authoritative local view of exchange positions and the protective
//! orders guarding them. State changes arrive on the user-data stream;
//! reconciliation against REST runs at startup, after every reconnect, and on
//! a 30 s audit tick. Every open position must end up with exactly one
//! stop-loss and one take-profit sized to match; orphans and duplicates are
//! cancelled.

pub mod locks;
pub mod protection;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{SharedConfig, SymbolSettings};
use crate::errors::ExchangeError;
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::exchange::client::{ExchangeClient, OrderParams};
use crate::exchange::filters::SymbolCatalog;
use crate::exchange::price_feed::PriceFeed;
use crate::exchange::rate_limit::Priority;
use crate::exchange::types::{OpenOrder, OrderUpdateDetail, PositionRisk, UserDataEvent};
use crate::models::{PositionSide, SignalDirection, TradeSide};
use crate::storage::OperationalStore;

use locks::NamedLocks;
use protection::{
    clamp_stop_to_mark, protective_prices, realized_pnl, take_profit_exceeded,
};

/// Quantity match tolerance when adopting untracked protective orders.
const QTY_TOLERANCE: f64 = 1e-8;
/// Position amounts below this are venue dust for a closed key.
const ZERO_EPS: f64 = 1e-12;
const CLOSE_REASON_TP_EXCEEDED: &str = "auto-closed at market (exceeded TP target)";
/// Synthetic protective-order ids used in paper mode.
const PAPER_PROTECT_ID_BASE: i64 = 8_000_000_000_000;

/// Read-only query surface handed to the hunter.
pub trait PositionTracker: Send + Sync {
    fn margin_usage(&self, symbol: &str) -> f64;
    fn can_open_position(&self, symbol: &str, direction: SignalDirection) -> Result<(), String>;
    fn position_count_for_symbol_side(&self, symbol: &str, direction: SignalDirection) -> usize;
    fn unique_position_count(&self) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub symbol: String,
    pub side: PositionSide,
}

impl PositionKey {
    pub fn new(symbol: &str, side: PositionSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Position {
    pub symbol: String,
    pub position_side: PositionSide,
    /// Signed amount; negative = short in one-way mode.
    pub quantity: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub liquidation_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(&self.symbol, self.position_side)
    }

    pub fn direction(&self) -> SignalDirection {
        match self.position_side {
            PositionSide::Long => SignalDirection::Long,
            PositionSide::Short => SignalDirection::Short,
            PositionSide::Both => {
                if self.quantity >= 0.0 {
                    SignalDirection::Long
                } else {
                    SignalDirection::Short
                }
            }
        }
    }

    pub fn abs_quantity(&self) -> f64 {
        self.quantity.abs()
    }

    /// Initial margin tied up by this position.
    pub fn margin(&self) -> f64 {
        self.abs_quantity() * self.entry_price / self.leverage.max(1.0)
    }

    /// Side a protective or closing order must carry.
    pub fn exit_side(&self) -> TradeSide {
        self.direction().entry_side().opposite()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtectiveBinding {
    pub stop_loss_id: Option<i64>,
    pub take_profit_id: Option<i64>,
}

impl ProtectiveBinding {
    pub fn contains(&self, order_id: i64) -> bool {
        self.stop_loss_id == Some(order_id) || self.take_profit_id == Some(order_id)
    }

    pub fn leg_count(&self) -> usize {
        self.stop_loss_id.is_some() as usize + self.take_profit_id.is_some() as usize
    }

    pub fn sibling_of(&self, order_id: i64) -> Option<i64> {
        if self.stop_loss_id == Some(order_id) {
            self.take_profit_id
        } else if self.take_profit_id == Some(order_id) {
            self.stop_loss_id
        } else {
            None
        }
    }
}

/// Outcome of matching venue orders against one position.
#[derive(Debug, Default, PartialEq)]
struct LegResolution {
    stop_loss_id: Option<i64>,
    take_profit_id: Option<i64>,
    /// Tracked legs whose quantity no longer matches; cancel then replace.
    cancel: Vec<i64>,
    need_stop: bool,
    need_take_profit: bool,
}

/// Match candidate protective orders to a position: prefer previously
/// tracked ids, otherwise adopt by exact quantity; every order is assigned to
/// at most one position. A tracked leg tolerates one step-size unit of drift
/// before it is declared wrong-sized.
fn resolve_protective_legs(
    position: &Position,
    orders: &[OpenOrder],
    tracked: ProtectiveBinding,
    step_size: f64,
    assigned: &mut HashSet<i64>,
) -> LegResolution {
    let mut resolution = LegResolution::default();
    let target_qty = position.abs_quantity();
    let tracked_tolerance = step_size.max(QTY_TOLERANCE) + QTY_TOLERANCE;

    let mut resolve_leg = |is_stop_leg: bool, tracked_id: Option<i64>| -> (Option<i64>, bool) {
        let candidates: Vec<&OpenOrder> = orders
            .iter()
            .filter(|o| {
                o.symbol == position.symbol
                    && o.trade_side() == Some(position.exit_side())
                    && (if is_stop_leg { o.is_stop() } else { o.is_take_profit() })
                    && protective_like(o)
                    && side_compatible(o, position)
                    && !assigned.contains(&o.order_id)
            })
            .collect();

        if let Some(id) = tracked_id {
            if let Some(order) = candidates.iter().find(|o| o.order_id == id) {
                assigned.insert(id);
                let qty_matches = order.close_position
                    || (order.orig_qty - target_qty).abs() <= tracked_tolerance;
                if qty_matches {
                    return (Some(id), false);
                }
                // Wrong size: cancel and re-place.
                resolution.cancel.push(id);
                return (None, true);
            }
        }
        if let Some(order) = candidates
            .iter()
            .find(|o| (o.orig_qty - target_qty).abs() <= QTY_TOLERANCE)
        {
            assigned.insert(order.order_id);
            return (Some(order.order_id), false);
        }
        (None, true)
    };

    let (sl, need_sl) = resolve_leg(true, tracked.stop_loss_id);
    let (tp, need_tp) = resolve_leg(false, tracked.take_profit_id);
    resolution.stop_loss_id = sl;
    resolution.take_profit_id = tp;
    resolution.need_stop = need_sl;
    resolution.need_take_profit = need_tp;
    resolution
}

fn protective_like(order: &OpenOrder) -> bool {
    // Hedge-mode orders carry no reduceOnly flag; the opposing position side
    // makes them reducing.
    order.reduce_only || order.close_position || order.position_side() != PositionSide::Both
}

fn side_compatible(order: &OpenOrder, position: &Position) -> bool {
    position.position_side == PositionSide::Both
        || order.position_side() == position.position_side
        || order.position_side() == PositionSide::Both
}

pub struct PositionManager {
    config: SharedConfig,
    client: Arc<ExchangeClient>,
    catalog: Arc<SymbolCatalog>,
    price_feed: Arc<PriceFeed>,
    bus: StatusBroadcaster,
    error_store: Option<Arc<OperationalStore>>,
    positions: RwLock<HashMap<PositionKey, Position>>,
    bindings: RwLock<HashMap<PositionKey, ProtectiveBinding>>,
    previous_sizes: Mutex<HashMap<PositionKey, f64>>,
    /// Leverage from ACCOUNT_CONFIG_UPDATE; positionRisk reports 0 transiently.
    leverage_cache: Mutex<HashMap<String, f64>>,
    locks: NamedLocks,
    paper_protect_seq: AtomicI64,
}

impl PositionManager {
    pub fn new(
        config: SharedConfig,
        client: Arc<ExchangeClient>,
        catalog: Arc<SymbolCatalog>,
        price_feed: Arc<PriceFeed>,
        bus: StatusBroadcaster,
        error_store: Option<Arc<OperationalStore>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            client,
            catalog,
            price_feed,
            bus,
            error_store,
            positions: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            previous_sizes: Mutex::new(HashMap::new()),
            leverage_cache: Mutex::new(HashMap::new()),
            locks: NamedLocks::new(),
            paper_protect_seq: AtomicI64::new(0),
        })
    }

    fn paper_mode(&self) -> bool {
        self.config.read().global.paper_mode
    }

    fn symbol_settings(&self, symbol: &str) -> SymbolSettings {
        self.config
            .read()
            .symbols
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn bindings_snapshot(&self) -> Vec<(PositionKey, ProtectiveBinding)> {
        self.bindings
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    // -- reconciliation ------------------------------------------------------

    /// Full resync: rebuild the position map from `positionRisk`, match every
    /// open protective order, repair wrong/missing legs, cancel orphans.
    pub fn sync(self: &Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.paper_mode() {
                self.paper_audit().await;
                return;
            }
            let risks = match self.client.position_risk().await {
                Ok(risks) => risks,
                Err(e) => {
                    warn!(error = %e, "positionRisk fetch failed, audit skipped");
                    return;
                }
            };
            let orders = match self.client.open_orders(None).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(error = %e, "openOrders fetch failed, audit skipped");
                    return;
                }
            };
            self.reconcile(risks, orders).await;
        })
    }

    async fn reconcile(self: &Arc<Self>, risks: Vec<PositionRisk>, orders: Vec<OpenOrder>) {
        // 1. Rebuild the position map.
        let mut fresh: HashMap<PositionKey, Position> = HashMap::new();
        for risk in &risks {
            if risk.position_amt.abs() <= ZERO_EPS {
                continue;
            }
            let leverage = if risk.leverage > 0.0 {
                risk.leverage
            } else {
                self.leverage_cache
                    .lock()
                    .get(&risk.symbol)
                    .copied()
                    .unwrap_or_else(|| self.symbol_settings(&risk.symbol).leverage as f64)
            };
            let position = Position {
                symbol: risk.symbol.clone(),
                position_side: risk.side(),
                quantity: risk.position_amt,
                entry_price: risk.entry_price,
                leverage,
                liquidation_price: risk.liquidation_price,
                mark_price: risk.mark_price,
                unrealized_pnl: risk.unrealized_profit,
            };
            fresh.insert(position.key(), position);
        }

        let stale_keys: Vec<PositionKey> = {
            let mut positions = self.positions.write();
            let stale = positions
                .keys()
                .filter(|k| !fresh.contains_key(k))
                .cloned()
                .collect();
            *positions = fresh.clone();
            stale
        };
        for key in stale_keys {
            self.previous_sizes.lock().remove(&key);
            self.bindings.write().remove(&key);
            debug!(symbol = %key.symbol, side = %key.side, "position gone on venue, dropped");
        }
        for position in fresh.values() {
            self.previous_sizes
                .lock()
                .insert(position.key(), position.quantity);
        }

        // 2-3. Match and repair protective legs per position.
        let mut assigned: HashSet<i64> = HashSet::new();
        for position in fresh.values() {
            let tracked = self
                .bindings
                .read()
                .get(&position.key())
                .copied()
                .unwrap_or_default();
            let resolution = resolve_protective_legs(
                position,
                &orders,
                tracked,
                self.step_for(&position.symbol),
                &mut assigned,
            );
            self.apply_resolution(position, resolution).await;
        }

        // 4. Orphans: reduce-only/protective orders assigned to no position.
        for order in &orders {
            let kind_protective = order.reduce_only
                || order.close_position
                || ((order.is_stop() || order.is_take_profit()) && protective_like(order));
            if kind_protective && !assigned.contains(&order.order_id) {
                info!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    "cancelling orphan protective order"
                );
                self.cancel_with_retry(&order.symbol, order.order_id, Priority::High)
                    .await;
            }
        }
    }

    /// Cancel wrong-sized legs and place missing ones, serialized per
    /// position key.
    async fn apply_resolution(self: &Arc<Self>, position: &Position, resolution: LegResolution) {
        let key = position.key();
        let lock_name = format!("adjust_{}_{}", key.symbol, key.side);
        let _guard = self.locks.acquire(&lock_name).await;

        for order_id in &resolution.cancel {
            self.cancel_with_retry(&position.symbol, *order_id, Priority::High)
                .await;
        }

        {
            let mut bindings = self.bindings.write();
            let binding = bindings.entry(key.clone()).or_default();
            binding.stop_loss_id = resolution.stop_loss_id;
            binding.take_profit_id = resolution.take_profit_id;
        }

        if resolution.need_stop || resolution.need_take_profit {
            if resolution.need_stop && resolution.need_take_profit {
                error!(
                    symbol = %position.symbol,
                    side = %position.position_side,
                    critical = true,
                    "open position has no protective orders"
                );
                self.persist_error(
                    "critical",
                    &format!(
                        "position {}/{} missing both protective legs",
                        position.symbol, position.position_side
                    ),
                );
            }
            self.place_protective_legs(
                position,
                resolution.need_stop,
                resolution.need_take_profit,
            )
            .await;
        }
    }

    /// Place the missing legs; SL+TP together go through the batch endpoint.
    /// A take-profit the mark already exceeded becomes an immediate
    /// reduce-only market close instead.
    async fn place_protective_legs(
        self: &Arc<Self>,
        position: &Position,
        need_stop: bool,
        need_take_profit: bool,
    ) {
        let cfg = self.symbol_settings(&position.symbol);
        let prices = protective_prices(
            position.direction(),
            position.entry_price,
            cfg.tp_percent,
            cfg.sl_percent,
        );
        let mark = match self.price_feed.mark_price_or_fetch(&position.symbol).await {
            Ok(mark) => mark,
            Err(e) => {
                // Never price protective legs off stale data.
                warn!(symbol = %position.symbol, error = %e, "no mark price, protective placement deferred");
                return;
            }
        };

        if need_take_profit
            && take_profit_exceeded(position.direction(), prices.take_profit, mark)
        {
            info!(
                symbol = %position.symbol,
                mark,
                take_profit = prices.take_profit,
                "mark beyond take-profit target, closing at market"
            );
            self.close_position_at_market(position, mark, CLOSE_REASON_TP_EXCEEDED)
                .await;
            return;
        }

        let (stop_price, buffered) =
            clamp_stop_to_mark(position.direction(), prices.stop_loss, mark);
        if buffered {
            warn!(
                symbol = %position.symbol,
                requested = prices.stop_loss,
                adjusted = stop_price,
                "stop would trigger immediately, buffered past the mark"
            );
        }

        let qty = self
            .catalog
            .format_quantity(&position.symbol, position.abs_quantity());
        let stop_price = self.catalog.format_price(&position.symbol, stop_price);
        let tp_price = self
            .catalog
            .format_price(&position.symbol, prices.take_profit);
        let exit_side = position.exit_side();

        if self.paper_mode() {
            let mut bindings = self.bindings.write();
            let binding = bindings.entry(position.key()).or_default();
            if need_stop {
                binding.stop_loss_id =
                    Some(PAPER_PROTECT_ID_BASE + self.paper_protect_seq.fetch_add(1, Ordering::Relaxed));
            }
            if need_take_profit {
                binding.take_profit_id =
                    Some(PAPER_PROTECT_ID_BASE + self.paper_protect_seq.fetch_add(1, Ordering::Relaxed));
            }
            return;
        }

        let hedge = position.position_side != PositionSide::Both;
        let stop_order = OrderParams::stop_market(
            &position.symbol,
            exit_side,
            position.position_side,
            qty,
            stop_price,
        );
        let tp_order = OrderParams::take_profit_market(
            &position.symbol,
            exit_side,
            position.position_side,
            qty,
            tp_price,
        );

        if need_stop && need_take_profit {
            // One batch call saves a request-weight unit over two singles.
            match self
                .client
                .place_batch_orders(&[stop_order, tp_order], hedge, Priority::Critical)
                .await
            {
                Ok(results) => {
                    let mut bindings = self.bindings.write();
                    let binding = bindings.entry(position.key()).or_default();
                    for (index, result) in results.into_iter().enumerate() {
                        match result {
                            Ok(ack) => {
                                if index == 0 {
                                    binding.stop_loss_id = Some(ack.order_id);
                                } else {
                                    binding.take_profit_id = Some(ack.order_id);
                                }
                            }
                            // Expected when the level is already crossed; the
                            // next audit resolves the position state.
                            Err(ExchangeError::WouldTriggerImmediately { msg }) => {
                                debug!(symbol = %position.symbol, leg = index, "{msg}");
                            }
                            Err(e) => self.protective_failure(position, &e),
                        }
                    }
                }
                Err(e) => self.protective_failure(position, &e),
            }
            return;
        }

        let (params, is_stop_leg) = if need_stop {
            (stop_order, true)
        } else {
            (tp_order, false)
        };
        match self.client.place_order(&params, hedge, Priority::Critical).await {
            Ok(ack) => {
                let mut bindings = self.bindings.write();
                let binding = bindings.entry(position.key()).or_default();
                if is_stop_leg {
                    binding.stop_loss_id = Some(ack.order_id);
                } else {
                    binding.take_profit_id = Some(ack.order_id);
                }
            }
            Err(ExchangeError::WouldTriggerImmediately { msg }) => {
                debug!(symbol = %position.symbol, "{msg}");
            }
            Err(e) => self.protective_failure(position, &e),
        }
    }

    fn protective_failure(&self, position: &Position, err: &ExchangeError) {
        error!(
            symbol = %position.symbol,
            side = %position.position_side,
            error = %err,
            critical = true,
            "protective order placement failed"
        );
        self.persist_error(
            "critical",
            &format!(
                "protective placement failed for {}/{}: {err}",
                position.symbol, position.position_side
            ),
        );
        self.bus.emit(StatusEvent::TradingError {
            code: "PROTECTIVE_PLACEMENT".to_string(),
            reason: err.to_string(),
            component: "position_manager".to_string(),
        });
    }

    /// Reduce-only market close of the full position.
    async fn close_position_at_market(self: &Arc<Self>, position: &Position, mark: f64, reason: &str) {
        let key = position.key();
        let pnl = realized_pnl(
            position.direction(),
            position.entry_price,
            mark,
            position.abs_quantity(),
        );

        if !self.paper_mode() {
            let qty = self
                .catalog
                .format_quantity(&position.symbol, position.abs_quantity());
            let params = OrderParams::market(
                &position.symbol,
                position.exit_side(),
                position.position_side,
                qty,
            )
            .reduce_only();
            let hedge = position.position_side != PositionSide::Both;
            if let Err(e) = self.client.place_order(&params, hedge, Priority::Critical).await {
                match e {
                    ExchangeError::ReduceOnlyRejected { .. } => {
                        // State divergence: our view says open, venue says
                        // otherwise. Resync immediately.
                        warn!(symbol = %position.symbol, "reduce-only rejected, forcing resync");
                        let manager = Arc::clone(self);
                        tokio::spawn(async move { manager.sync().await });
                    }
                    other => self.protective_failure(position, &other),
                }
                return;
            }
        }

        // Cancel the surviving leg and drop local state.
        let binding = self.bindings.write().remove(&key).unwrap_or_default();
        if !self.paper_mode() {
            for leg in [binding.stop_loss_id, binding.take_profit_id].into_iter().flatten() {
                self.cancel_with_retry(&position.symbol, leg, Priority::High).await;
            }
        }
        self.positions.write().remove(&key);
        self.previous_sizes.lock().remove(&key);
        self.bus.emit(StatusEvent::PositionClosed {
            symbol: position.symbol.clone(),
            position_side: position.position_side,
            pnl,
            exit_price: mark,
            reason: reason.to_string(),
        });
    }

    /// Cancel with 3 retries (1 s, 2 s, 4 s). "Unknown order" (-2011) counts
    /// as success: the order is already gone.
    async fn cancel_with_retry(&self, symbol: &str, order_id: i64, priority: Priority) {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=3u32 {
            match self.client.cancel_order(symbol, order_id, priority).await {
                Ok(_) => return,
                Err(ExchangeError::UnknownOrder { .. }) => return,
                Err(e) if attempt < 3 => {
                    debug!(symbol = %symbol, order_id, attempt, error = %e, "cancel retry");
                    sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    warn!(symbol = %symbol, order_id, error = %e, "cancel failed after retries");
                }
            }
        }
    }

    // -- user-data stream ----------------------------------------------------

    pub async fn handle_event(self: &Arc<Self>, event: UserDataEvent) {
        match event {
            UserDataEvent::Connected => {
                info!("user-data stream (re)connected, resyncing");
                self.sync().await;
            }
            UserDataEvent::AccountUpdate(update) => {
                for delta in &update.data.positions {
                    self.apply_position_delta(
                        &delta.symbol,
                        delta.side(),
                        delta.position_amount,
                        delta.entry_price,
                        delta.unrealized_pnl,
                    )
                    .await;
                }
            }
            UserDataEvent::OrderTradeUpdate(update) => {
                self.apply_order_update(update.order).await;
            }
            UserDataEvent::AccountConfigUpdate(update) => {
                if let Some(change) = update.leverage_change {
                    debug!(symbol = %change.symbol, leverage = change.leverage, "leverage cache updated");
                    self.leverage_cache
                        .lock()
                        .insert(change.symbol, change.leverage as f64);
                }
            }
            UserDataEvent::ListenKeyExpired => {}
        }
    }

    /// Partial-update semantics: only symbols present in the update change
    /// state; a zero amount closes exactly that key.
    async fn apply_position_delta(
        self: &Arc<Self>,
        symbol: &str,
        side: PositionSide,
        amount: f64,
        entry_price: f64,
        unrealized_pnl: f64,
    ) {
        let key = PositionKey::new(symbol, side);
        if amount.abs() <= ZERO_EPS {
            let removed = self.positions.write().remove(&key);
            self.previous_sizes.lock().remove(&key);
            if let Some(old) = removed {
                // The order-fill path usually got here first; this covers
                // liquidations and closes from outside the bot.
                self.bus.emit(StatusEvent::PositionClosed {
                    symbol: symbol.to_string(),
                    position_side: side,
                    pnl: old.unrealized_pnl,
                    exit_price: self
                        .price_feed
                        .mark_price(symbol)
                        .map(|(p, _)| p)
                        .unwrap_or(old.entry_price),
                    reason: "position closed on account update".to_string(),
                });
                let binding = self.bindings.write().remove(&key).unwrap_or_default();
                if !self.paper_mode() {
                    for leg in [binding.stop_loss_id, binding.take_profit_id].into_iter().flatten() {
                        self.cancel_with_retry(symbol, leg, Priority::High).await;
                    }
                }
            }
            return;
        }

        let leverage = self
            .leverage_cache
            .lock()
            .get(symbol)
            .copied()
            .unwrap_or_else(|| self.symbol_settings(symbol).leverage as f64);
        let previous = self.previous_sizes.lock().insert(key.clone(), amount);
        let position = Position {
            symbol: symbol.to_string(),
            position_side: side,
            quantity: amount,
            entry_price,
            leverage,
            liquidation_price: 0.0,
            mark_price: self
                .price_feed
                .mark_price(symbol)
                .map(|(p, _)| p)
                .unwrap_or(entry_price),
            unrealized_pnl,
        };
        self.positions.write().insert(key.clone(), position.clone());
        self.bus.emit(StatusEvent::PositionUpdated {
            symbol: symbol.to_string(),
            position_side: side,
            quantity: amount,
            entry_price,
        });

        let size_changed = previous.map(|p| (p - amount).abs() > ZERO_EPS).unwrap_or(true);
        if size_changed && !self.paper_mode() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                manager.adjust_single(position).await;
            });
        }
    }

    /// Targeted adjustment after a size change on one key.
    async fn adjust_single(self: &Arc<Self>, position: Position) {
        let orders = match self.client.open_orders(Some(&position.symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "openOrders fetch failed, audit will retry");
                return;
            }
        };
        let tracked = self
            .bindings
            .read()
            .get(&position.key())
            .copied()
            .unwrap_or_default();
        let mut assigned = HashSet::new();
        let resolution = resolve_protective_legs(
            &position,
            &orders,
            tracked,
            self.step_for(&position.symbol),
            &mut assigned,
        );
        self.apply_resolution(&position, resolution).await;
    }

    fn step_for(&self, symbol: &str) -> f64 {
        self.catalog
            .get(symbol)
            .map(|filter| filter.step_size)
            .unwrap_or(0.0)
    }

    async fn apply_order_update(self: &Arc<Self>, order: OrderUpdateDetail) {
        let key = PositionKey::new(&order.symbol, order.position_side());
        let tracked_binding = self.bindings.read().get(&key).copied().unwrap_or_default();

        if order.is_filled() {
            let closing = order.reduce_only
                || order.close_position
                || tracked_binding.contains(order.order_id)
                || hedge_exit_side(&order);

            if closing {
                self.handle_closing_fill(&key, &order, tracked_binding).await;
            } else {
                self.handle_entry_fill(&key, &order).await;
            }
            return;
        }

        if matches!(order.status.as_str(), "CANCELED" | "EXPIRED" | "REJECTED") {
            // A cancelled protective leg keeps the position tracked; the next
            // audit replaces the leg.
            if tracked_binding.contains(order.order_id) {
                let mut bindings = self.bindings.write();
                if let Some(binding) = bindings.get_mut(&key) {
                    if binding.stop_loss_id == Some(order.order_id) {
                        binding.stop_loss_id = None;
                    }
                    if binding.take_profit_id == Some(order.order_id) {
                        binding.take_profit_id = None;
                    }
                }
                warn!(
                    symbol = %order.symbol,
                    order_id = order.order_id,
                    "tracked protective order cancelled, audit will replace it"
                );
            }
            self.bus.emit(StatusEvent::OrderCancelled {
                symbol: order.symbol.clone(),
                order_id: order.order_id,
            });
        }
    }

    async fn handle_entry_fill(self: &Arc<Self>, key: &PositionKey, order: &OrderUpdateDetail) {
        let fill_price = if order.avg_price > 0.0 {
            order.avg_price
        } else {
            order.last_price
        };
        self.bus.emit(StatusEvent::OrderFilled {
            symbol: order.symbol.clone(),
            order_id: order.order_id,
            side: order.trade_side().unwrap_or(TradeSide::Buy),
            position_side: order.position_side(),
            quantity: order.filled_qty,
            price: fill_price,
            reduce_only: false,
        });

        if !self.paper_mode() {
            // Live state flows from the ACCOUNT_UPDATE that follows.
            return;
        }

        // Paper: the fill is the only source of truth. Apply it directly and
        // bind synthetic protective legs.
        let signed = match order.trade_side() {
            Some(TradeSide::Buy) => order.filled_qty,
            Some(TradeSide::Sell) => -order.filled_qty,
            None => return,
        };
        let leverage = self.symbol_settings(&order.symbol).leverage as f64;
        let position = {
            let mut positions = self.positions.write();
            let entry = positions.entry(key.clone()).or_insert(Position {
                symbol: order.symbol.clone(),
                position_side: order.position_side(),
                quantity: 0.0,
                entry_price: fill_price,
                leverage,
                liquidation_price: 0.0,
                mark_price: fill_price,
                unrealized_pnl: 0.0,
            });
            entry.quantity += signed;
            entry.entry_price = fill_price;
            entry.clone()
        };
        self.previous_sizes
            .lock()
            .insert(key.clone(), position.quantity);
        self.bus.emit(StatusEvent::PositionUpdated {
            symbol: order.symbol.clone(),
            position_side: order.position_side(),
            quantity: position.quantity,
            entry_price: fill_price,
        });
        self.place_protective_legs(&position, true, true).await;
    }

    async fn handle_closing_fill(
        self: &Arc<Self>,
        key: &PositionKey,
        order: &OrderUpdateDetail,
        binding: ProtectiveBinding,
    ) {
        let removed = self.positions.write().remove(key);
        self.previous_sizes.lock().remove(key);
        self.bindings.write().remove(key);

        let Some(position) = removed else {
            // ACCOUNT_UPDATE got here first; both paths must be idempotent.
            return;
        };

        let exit_price = if order.avg_price > 0.0 {
            order.avg_price
        } else {
            order.last_price
        };
        // Venue-provided realized P&L wins over our own arithmetic.
        let pnl = if order.realized_profit != 0.0 {
            order.realized_profit
        } else {
            realized_pnl(
                position.direction(),
                position.entry_price,
                exit_price,
                position.abs_quantity(),
            )
        };
        let reason = if binding.stop_loss_id == Some(order.order_id) {
            "stop-loss filled"
        } else if binding.take_profit_id == Some(order.order_id) {
            "take-profit filled"
        } else {
            "position reduced to zero"
        };

        self.bus.emit(StatusEvent::OrderFilled {
            symbol: order.symbol.clone(),
            order_id: order.order_id,
            side: order.trade_side().unwrap_or(TradeSide::Sell),
            position_side: order.position_side(),
            quantity: order.filled_qty,
            price: exit_price,
            reduce_only: true,
        });
        self.bus.emit(StatusEvent::PositionClosed {
            symbol: order.symbol.clone(),
            position_side: order.position_side(),
            pnl,
            exit_price,
            reason: reason.to_string(),
        });

        // Cancel the surviving sibling leg.
        if let Some(sibling) = binding.sibling_of(order.order_id) {
            if !self.paper_mode() {
                self.cancel_with_retry(&order.symbol, sibling, Priority::High)
                    .await;
            }
        }
    }

    // -- paper audit ---------------------------------------------------------

    /// Paper mode has no venue orders to reconcile; instead, walk positions
    /// against the mark and close any whose simulated SL/TP has been crossed.
    async fn paper_audit(self: &Arc<Self>) {
        let positions = self.positions_snapshot();
        for position in positions {
            let cfg = self.symbol_settings(&position.symbol);
            let Some((mark, _)) = self.price_feed.mark_price(&position.symbol) else {
                continue;
            };
            let prices = protective_prices(
                position.direction(),
                position.entry_price,
                cfg.tp_percent,
                cfg.sl_percent,
            );
            let direction = position.direction();
            if take_profit_exceeded(direction, prices.take_profit, mark) {
                self.close_position_at_market(&position, mark, CLOSE_REASON_TP_EXCEEDED)
                    .await;
            } else if stop_crossed(direction, prices.stop_loss, mark) {
                self.close_position_at_market(&position, mark, "stop-loss filled (paper)")
                    .await;
            }
        }
    }

    fn persist_error(&self, severity: &str, message: &str) {
        if let Some(store) = &self.error_store {
            if let Err(e) = store.log_error(severity, "position_manager", message, None) {
                warn!(error = %e, "error-log persistence failed");
            }
        }
    }

    // -- background tasks ----------------------------------------------------

    pub fn spawn_event_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<UserDataEvent>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// 30 s protective-order audit + orphan scan.
    pub fn spawn_audit(
        self: Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sync().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

fn stop_crossed(direction: SignalDirection, stop: f64, mark: f64) -> bool {
    match direction {
        SignalDirection::Long => mark <= stop,
        SignalDirection::Short => mark >= stop,
    }
}

/// Hedge-mode closes carry no reduceOnly flag; a fill whose side opposes its
/// position side is an exit.
fn hedge_exit_side(order: &OrderUpdateDetail) -> bool {
    match (order.position_side(), order.trade_side()) {
        (PositionSide::Long, Some(TradeSide::Sell)) => true,
        (PositionSide::Short, Some(TradeSide::Buy)) => true,
        _ => false,
    }
}

impl PositionTracker for PositionManager {
    fn margin_usage(&self, symbol: &str) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .map(|p| p.margin())
            .sum()
    }

    fn can_open_position(&self, symbol: &str, direction: SignalDirection) -> Result<(), String> {
        let (hedge, cfg) = {
            let config = self.config.read();
            (
                config.global.position_mode.is_hedge(),
                config.symbols.get(symbol).cloned().unwrap_or_default(),
            )
        };
        let same_direction = self.position_count_for_symbol_side(symbol, direction);
        if hedge && same_direction >= 1 && !cfg.allow_pair_stacking {
            return Err(format!(
                "hedge mode already holds a {direction} position on {symbol}"
            ));
        }
        if same_direction >= cfg.direction_cap(direction) {
            return Err(format!(
                "per-pair {direction} cap reached ({same_direction}/{})",
                cfg.direction_cap(direction)
            ));
        }
        let total_on_symbol = self
            .positions
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .count();
        if !hedge && total_on_symbol >= cfg.max_positions_per_pair {
            return Err(format!(
                "pair cap reached ({total_on_symbol}/{})",
                cfg.max_positions_per_pair
            ));
        }
        Ok(())
    }

    fn position_count_for_symbol_side(&self, symbol: &str, direction: SignalDirection) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.symbol == symbol && p.direction() == direction)
            .count()
    }

    /// Distinct symbols with exposure; a hedged long+short pair counts once.
    fn unique_position_count(&self) -> usize {
        let positions = self.positions.read();
        let symbols: HashSet<&str> = positions.values().map(|p| p.symbol.as_str()).collect();
        symbols.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, ApiCredentials, Config};
    use crate::exchange::rate_limit::RateLimitGovernor;
    use crate::models::now_ms;

    fn open_order(
        order_id: i64,
        symbol: &str,
        side: &str,
        order_type: &str,
        qty: f64,
        reduce_only: bool,
        position_side: &str,
    ) -> OpenOrder {
        serde_json::from_value(serde_json::json!({
            "orderId": order_id,
            "symbol": symbol,
            "side": side,
            "positionSide": position_side,
            "type": order_type,
            "origType": order_type,
            "price": "0",
            "stopPrice": "0.95",
            "origQty": qty.to_string(),
            "reduceOnly": reduce_only,
            "status": "NEW"
        }))
        .unwrap()
    }

    fn long_position(symbol: &str, qty: f64, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            position_side: PositionSide::Both,
            quantity: qty,
            entry_price: entry,
            leverage: 10.0,
            liquidation_price: 0.0,
            mark_price: entry,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn resolution_keeps_tracked_legs_with_matching_qty() {
        let position = long_position("ASTERUSDT", 200.0, 1.0);
        let orders = vec![
            open_order(11, "ASTERUSDT", "SELL", "STOP_MARKET", 200.0, true, "BOTH"),
            open_order(12, "ASTERUSDT", "SELL", "TAKE_PROFIT_MARKET", 200.0, true, "BOTH"),
        ];
        let tracked = ProtectiveBinding {
            stop_loss_id: Some(11),
            take_profit_id: Some(12),
        };
        let mut assigned = HashSet::new();
        let resolution =
            resolve_protective_legs(&position, &orders, tracked, 1.0, &mut assigned);
        assert_eq!(resolution.stop_loss_id, Some(11));
        assert_eq!(resolution.take_profit_id, Some(12));
        assert!(!resolution.need_stop && !resolution.need_take_profit);
        assert!(resolution.cancel.is_empty());
    }

    #[test]
    fn resolution_adopts_untracked_exact_qty_match() {
        let position = long_position("ASTERUSDT", 200.0, 1.0);
        let orders = vec![open_order(
            21, "ASTERUSDT", "SELL", "STOP_MARKET", 200.0, true, "BOTH",
        )];
        let mut assigned = HashSet::new();
        let resolution = resolve_protective_legs(
            &position,
            &orders,
            ProtectiveBinding::default(),
            1.0,
            &mut assigned,
        );
        assert_eq!(resolution.stop_loss_id, Some(21));
        assert!(!resolution.need_stop);
        // No TP on the venue: leg marked missing.
        assert!(resolution.need_take_profit);
        assert!(assigned.contains(&21));
    }

    #[test]
    fn resolution_cancels_tracked_leg_with_wrong_qty() {
        // Position grew to 300 but the stop still covers 200.
        let position = long_position("ASTERUSDT", 300.0, 1.0);
        let orders = vec![open_order(
            31, "ASTERUSDT", "SELL", "STOP_MARKET", 200.0, true, "BOTH",
        )];
        let tracked = ProtectiveBinding {
            stop_loss_id: Some(31),
            take_profit_id: None,
        };
        let mut assigned = HashSet::new();
        let resolution =
            resolve_protective_legs(&position, &orders, tracked, 1.0, &mut assigned);
        assert_eq!(resolution.cancel, vec![31]);
        assert!(resolution.need_stop);
    }

    #[test]
    fn each_order_assigned_to_at_most_one_position() {
        let first = long_position("ASTERUSDT", 200.0, 1.0);
        let second = long_position("ASTERUSDT", 200.0, 1.0);
        let orders = vec![open_order(
            41, "ASTERUSDT", "SELL", "STOP_MARKET", 200.0, true, "BOTH",
        )];
        let mut assigned = HashSet::new();
        let r1 =
            resolve_protective_legs(&first, &orders, Default::default(), 1.0, &mut assigned);
        let r2 =
            resolve_protective_legs(&second, &orders, Default::default(), 1.0, &mut assigned);
        assert_eq!(r1.stop_loss_id, Some(41));
        assert!(r2.stop_loss_id.is_none() && r2.need_stop);
    }

    #[test]
    fn wrong_side_orders_are_not_candidates() {
        let position = long_position("ASTERUSDT", 200.0, 1.0);
        // BUY stop cannot protect a long.
        let orders = vec![open_order(
            51, "ASTERUSDT", "BUY", "STOP_MARKET", 200.0, true, "BOTH",
        )];
        let mut assigned = HashSet::new();
        let resolution = resolve_protective_legs(
            &position,
            &orders,
            ProtectiveBinding::default(),
            1.0,
            &mut assigned,
        );
        assert!(resolution.need_stop);
        assert!(assigned.is_empty());
    }

    // -- manager-level tests (paper mode, no venue) --------------------------

    fn paper_manager() -> Arc<PositionManager> {
        let mut config = Config::default();
        config.global.paper_mode = true;
        let mut sym = SymbolSettings::default();
        sym.tp_percent = 1.0;
        sym.sl_percent = 5.0;
        sym.leverage = 10;
        config.symbols.insert("ASTERUSDT".to_string(), sym);
        let governor = RateLimitGovernor::new(Default::default());
        let client = Arc::new(ExchangeClient::new(
            "https://example.invalid",
            ApiCredentials::paper(),
            governor,
        ));
        let catalog = Arc::new(SymbolCatalog::with_static(HashMap::new(), Some(Default::default())));
        let feed = Arc::new(PriceFeed::detached());
        feed.update_mark("ASTERUSDT", 1.0, now_ms());
        PositionManager::new(
            shared(config),
            client,
            catalog,
            feed,
            StatusBroadcaster::new(64),
            None,
        )
    }

    fn entry_fill(order_id: i64, symbol: &str, side: &str, qty: f64, price: f64) -> OrderUpdateDetail {
        serde_json::from_value(serde_json::json!({
            "s": symbol, "i": order_id, "S": side, "ps": "BOTH",
            "o": "LIMIT", "ot": "LIMIT", "X": "FILLED", "x": "TRADE",
            "q": qty.to_string(), "z": qty.to_string(),
            "ap": price.to_string(), "L": price.to_string(),
            "rp": "0", "R": false, "cp": false
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn paper_entry_fill_builds_position_and_bindings() {
        let manager = paper_manager();
        manager
            .apply_order_update(entry_fill(1001, "ASTERUSDT", "BUY", 200.0, 0.9999))
            .await;

        let positions = manager.positions_snapshot();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 200.0);
        assert_eq!(manager.unique_position_count(), 1);
        assert!(manager.margin_usage("ASTERUSDT") > 0.0);

        // Invariant: at most one leg of each kind, both bound.
        let bindings = manager.bindings_snapshot();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].1.leg_count(), 2);
    }

    #[tokio::test]
    async fn closing_fill_prefers_venue_realized_pnl() {
        let manager = paper_manager();
        manager
            .apply_order_update(entry_fill(1001, "ASTERUSDT", "BUY", 200.0, 1.0))
            .await;
        let mut events = manager.bus.subscribe();

        let close: OrderUpdateDetail = serde_json::from_value(serde_json::json!({
            "s": "ASTERUSDT", "i": 2002, "S": "SELL", "ps": "BOTH",
            "o": "TAKE_PROFIT_MARKET", "ot": "TAKE_PROFIT_MARKET",
            "X": "FILLED", "x": "TRADE",
            "q": "200", "z": "200", "ap": "1.01", "L": "1.01",
            "rp": "2.00", "R": true, "cp": false
        }))
        .unwrap();
        manager.apply_order_update(close).await;

        assert!(manager.positions_snapshot().is_empty());
        let mut saw_closed = false;
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::PositionClosed { pnl, .. } = event {
                assert!((pnl - 2.0).abs() < 1e-9);
                saw_closed = true;
            }
        }
        assert!(saw_closed);

        // Replay of the same fill is a no-op.
        let replay: OrderUpdateDetail = serde_json::from_value(serde_json::json!({
            "s": "ASTERUSDT", "i": 2002, "S": "SELL", "ps": "BOTH",
            "o": "TAKE_PROFIT_MARKET", "ot": "TAKE_PROFIT_MARKET",
            "X": "FILLED", "x": "TRADE",
            "q": "200", "z": "200", "ap": "1.01", "L": "1.01",
            "rp": "2.00", "R": true, "cp": false
        }))
        .unwrap();
        manager.apply_order_update(replay).await;
        assert!(manager.positions_snapshot().is_empty());
    }

    #[tokio::test]
    async fn account_update_partial_semantics() {
        let manager = paper_manager();
        manager
            .apply_position_delta("ASTERUSDT", PositionSide::Both, 200.0, 1.0, 0.0)
            .await;
        manager
            .apply_position_delta("BTCUSDT", PositionSide::Both, 0.01, 60_000.0, 0.0)
            .await;
        assert_eq!(manager.unique_position_count(), 2);

        // Update mentioning only BTCUSDT with zero closes BTC, leaves ASTER.
        manager
            .apply_position_delta("BTCUSDT", PositionSide::Both, 0.0, 0.0, 0.0)
            .await;
        assert_eq!(manager.unique_position_count(), 1);
        assert_eq!(
            manager.positions_snapshot()[0].symbol,
            "ASTERUSDT".to_string()
        );
    }

    #[tokio::test]
    async fn paper_audit_closes_position_past_tp() {
        let manager = paper_manager();
        manager
            .apply_order_update(entry_fill(1001, "ASTERUSDT", "BUY", 200.0, 1.0))
            .await;
        let mut events = manager.bus.subscribe();
        // Mark runs 2% above entry; TP is 1%.
        manager.price_feed.update_mark("ASTERUSDT", 1.02, now_ms());
        manager.paper_audit().await;

        assert!(manager.positions_snapshot().is_empty());
        let mut reason = String::new();
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::PositionClosed { reason: r, pnl, .. } = event {
                assert!(pnl > 0.0);
                reason = r;
            }
        }
        assert_eq!(reason, CLOSE_REASON_TP_EXCEEDED);
    }

    #[tokio::test]
    async fn hedge_mode_refuses_second_long_on_symbol() {
        let manager = paper_manager();
        {
            let mut config = manager.config.write();
            config.global.position_mode = crate::models::PositionMode::Hedge;
            config
                .symbols
                .get_mut("ASTERUSDT")
                .unwrap()
                .max_positions_per_pair = 5;
        }
        manager
            .apply_position_delta("ASTERUSDT", PositionSide::Long, 200.0, 1.0, 0.0)
            .await;
        // A second LONG is refused even though the pair cap would allow it.
        let refused = manager.can_open_position("ASTERUSDT", SignalDirection::Long);
        assert!(refused.is_err());
        // The opposite direction is fine.
        assert!(manager
            .can_open_position("ASTERUSDT", SignalDirection::Short)
            .is_ok());
    }

    #[tokio::test]
    async fn cancelled_protective_leg_keeps_position_tracked() {
        let manager = paper_manager();
        manager
            .apply_order_update(entry_fill(1001, "ASTERUSDT", "BUY", 200.0, 1.0))
            .await;
        let binding = manager.bindings_snapshot()[0].1;
        let sl_id = binding.stop_loss_id.unwrap();

        let cancel: OrderUpdateDetail = serde_json::from_value(serde_json::json!({
            "s": "ASTERUSDT", "i": sl_id, "S": "SELL", "ps": "BOTH",
            "o": "STOP_MARKET", "ot": "STOP_MARKET", "X": "CANCELED", "x": "CANCELED",
            "q": "200", "z": "0", "ap": "0", "L": "0", "rp": "0", "R": true, "cp": false
        }))
        .unwrap();
        manager.apply_order_update(cancel).await;

        assert_eq!(manager.positions_snapshot().len(), 1);
        let binding = manager.bindings_snapshot()[0].1;
        assert!(binding.stop_loss_id.is_none());
        assert!(binding.take_profit_id.is_some());
    }
}
