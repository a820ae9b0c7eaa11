//! Copy-trading fan-out.
//!
//! Mirrors master position events to follower wallets. Each follower gets its
//! own sized MARKET order, its own protective legs, and its own failure
//! isolation: one wallet erroring never blocks the rest. Mirror records
//! persist in the operational store keyed by the master order id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ApiCredentials, SharedConfig};
use crate::events::{FollowerOutcome, StatusBroadcaster, StatusEvent};
use crate::exchange::client::{ExchangeClient, OrderParams};
use crate::exchange::filters::SymbolCatalog;
use crate::exchange::rate_limit::{Priority, RateLimitGovernor};
use crate::models::{PositionSide, SignalDirection, TradeSide};
use crate::position::protection::{protective_prices, realized_pnl};
use crate::storage::{FollowerPosition, FollowerPositionStatus, FollowerWallet, OperationalStore};

const PAPER_FOLLOWER_ID_BASE: i64 = 7_000_000_000_000;

pub struct CopyTrader {
    config: SharedConfig,
    store: Arc<OperationalStore>,
    catalog: Arc<SymbolCatalog>,
    bus: StatusBroadcaster,
    rest_base: String,
    /// One client (and rate budget) per follower account.
    clients: Mutex<HashMap<i64, Arc<ExchangeClient>>>,
    /// Master entry order ids currently mirrored, by position key. Close
    /// events arrive keyed by (symbol, side), not order id.
    open_masters: Mutex<HashMap<(String, PositionSide), Vec<i64>>>,
    paper_order_seq: AtomicI64,
}

/// Aggregate outcome of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct FanOutResult {
    pub successful: usize,
    pub failed: usize,
    pub outcomes: Vec<FollowerOutcome>,
}

impl CopyTrader {
    pub fn new(
        config: SharedConfig,
        store: Arc<OperationalStore>,
        catalog: Arc<SymbolCatalog>,
        bus: StatusBroadcaster,
        rest_base: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            catalog,
            bus,
            rest_base: rest_base.into(),
            clients: Mutex::new(HashMap::new()),
            open_masters: Mutex::new(HashMap::new()),
            paper_order_seq: AtomicI64::new(0),
        })
    }

    fn enabled(&self) -> bool {
        self.config.read().global.copy_trading.enabled
    }

    fn paper_mode(&self) -> bool {
        self.config.read().global.paper_mode
    }

    fn client_for(&self, wallet: &FollowerWallet) -> Arc<ExchangeClient> {
        let mut clients = self.clients.lock();
        Arc::clone(clients.entry(wallet.id).or_insert_with(|| {
            // Each follower account has its own venue rate budget.
            let governor = RateLimitGovernor::new(self.config.read().global.rate_limit.clone());
            Arc::new(ExchangeClient::new(
                self.rest_base.clone(),
                ApiCredentials {
                    api_key: wallet.api_key.clone(),
                    api_secret: wallet.api_secret.clone(),
                },
                governor,
            ))
        }))
    }

    /// Mirror a master entry to every enabled follower.
    pub async fn handle_master_open(
        self: &Arc<Self>,
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        master_order_id: i64,
        master_quantity: f64,
    ) -> FanOutResult {
        let wallets = match self.store.enabled_wallets() {
            Ok(wallets) => wallets,
            Err(e) => {
                warn!(error = %e, "follower wallet load failed");
                return FanOutResult::default();
            }
        };
        let max_multiplier = self.config.read().global.copy_trading.max_multiplier;
        let mut result = FanOutResult::default();

        for wallet in wallets {
            let outcome = self
                .mirror_to_wallet(
                    &wallet,
                    symbol,
                    side,
                    position_side,
                    master_order_id,
                    master_quantity,
                    max_multiplier,
                )
                .await;
            match outcome.status.as_str() {
                "copied" => result.successful += 1,
                "error" => result.failed += 1,
                _ => {}
            }
            result.outcomes.push(outcome);
        }

        if result.successful > 0 {
            self.open_masters
                .lock()
                .entry((symbol.to_string(), position_side))
                .or_default()
                .push(master_order_id);
        }

        self.bus.emit(StatusEvent::CopyTradeCompleted {
            master_order_id,
            successful: result.successful,
            failed: result.failed,
            followers: result.outcomes.clone(),
        });
        result
    }

    async fn mirror_to_wallet(
        &self,
        wallet: &FollowerWallet,
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        master_order_id: i64,
        master_quantity: f64,
        max_multiplier: f64,
    ) -> FollowerOutcome {
        let skip = |detail: &str| FollowerOutcome {
            wallet: wallet.name.clone(),
            status: "skipped".to_string(),
            detail: Some(detail.to_string()),
        };

        if !wallet.allows_symbol(symbol) {
            debug!(wallet = %wallet.name, symbol = %symbol, "follower allow-list excludes symbol");
            return skip("symbol not in allow-list");
        }
        match self.store.open_position_count(wallet.id, symbol) {
            Ok(count) if count >= wallet.max_positions_per_pair => {
                return skip(&format!(
                    "pair cap reached ({count}/{})",
                    wallet.max_positions_per_pair
                ));
            }
            Ok(_) => {}
            Err(e) => {
                return self.record_failure(
                    wallet,
                    symbol,
                    side,
                    position_side,
                    master_order_id,
                    0.0,
                    &e.to_string(),
                )
            }
        }

        let multiplier = wallet.multiplier.min(max_multiplier);
        if multiplier <= 0.0 {
            return skip("multiplier is zero");
        }
        let quantity = self
            .catalog
            .format_quantity(symbol, master_quantity * multiplier);
        if quantity <= 0.0 {
            return skip("scaled quantity rounds to zero");
        }

        let leverage = {
            let config = self.config.read();
            config
                .symbols
                .get(symbol)
                .map(|s| s.leverage)
                .unwrap_or(10)
        };

        if self.paper_mode() {
            let order_id =
                PAPER_FOLLOWER_ID_BASE + self.paper_order_seq.fetch_add(1, Ordering::Relaxed);
            return self.record_success(
                wallet,
                symbol,
                side,
                position_side,
                master_order_id,
                Some(order_id),
                quantity,
                None,
            );
        }

        let client = self.client_for(wallet);
        if let Err(e) = client.set_leverage(symbol, leverage).await {
            debug!(wallet = %wallet.name, error = %e, "follower leverage update failed");
        }
        let hedge = position_side != PositionSide::Both;
        let params = OrderParams::market(symbol, side, position_side, quantity);
        match client.place_order(&params, hedge, Priority::High).await {
            Ok(ack) => {
                let entry_price = if ack.avg_price > 0.0 {
                    Some(ack.avg_price)
                } else {
                    None
                };
                let outcome = self.record_success(
                    wallet,
                    symbol,
                    side,
                    position_side,
                    master_order_id,
                    Some(ack.order_id),
                    quantity,
                    entry_price,
                );
                self.place_follower_protection(&client, wallet, symbol, side, position_side, quantity, entry_price)
                    .await;
                outcome
            }
            Err(e) => self.record_failure(
                wallet,
                symbol,
                side,
                position_side,
                master_order_id,
                quantity,
                &e.to_string(),
            ),
        }
    }

    /// Followers carry their own SL/TP sized to their own quantity.
    async fn place_follower_protection(
        &self,
        client: &Arc<ExchangeClient>,
        wallet: &FollowerWallet,
        symbol: &str,
        entry_side: TradeSide,
        position_side: PositionSide,
        quantity: f64,
        entry_price: Option<f64>,
    ) {
        let Some(entry) = entry_price else {
            debug!(wallet = %wallet.name, "no fill price, protective legs deferred to audit");
            return;
        };
        let (tp_percent, sl_percent) = {
            let config = self.config.read();
            let cfg = config.symbols.get(symbol).cloned().unwrap_or_default();
            (cfg.tp_percent, cfg.sl_percent)
        };
        let direction = match entry_side {
            TradeSide::Buy => SignalDirection::Long,
            TradeSide::Sell => SignalDirection::Short,
        };
        let prices = protective_prices(direction, entry, tp_percent, sl_percent);
        let exit_side = entry_side.opposite();
        let hedge = position_side != PositionSide::Both;
        let orders = [
            OrderParams::stop_market(
                symbol,
                exit_side,
                position_side,
                quantity,
                self.catalog.format_price(symbol, prices.stop_loss),
            ),
            OrderParams::take_profit_market(
                symbol,
                exit_side,
                position_side,
                quantity,
                self.catalog.format_price(symbol, prices.take_profit),
            ),
        ];
        match client.place_batch_orders(&orders, hedge, Priority::High).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(wallet = %wallet.name, symbol = %symbol, error = %e, "follower protective leg failed");
                    }
                }
            }
            Err(e) => {
                warn!(wallet = %wallet.name, symbol = %symbol, error = %e, "follower protective batch failed")
            }
        }
    }

    fn record_success(
        &self,
        wallet: &FollowerWallet,
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        master_order_id: i64,
        follower_order_id: Option<i64>,
        quantity: f64,
        entry_price: Option<f64>,
    ) -> FollowerOutcome {
        let position = FollowerPosition {
            id: 0,
            master_order_id,
            wallet_id: wallet.id,
            follower_order_id,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            position_side: position_side.as_str().to_string(),
            quantity,
            entry_price,
            exit_price: None,
            pnl: None,
            status: FollowerPositionStatus::Open,
            error: None,
        };
        if let Err(e) = self.store.record_follower_position(&position) {
            warn!(wallet = %wallet.name, error = %e, "follower position persistence failed");
        }
        info!(
            wallet = %wallet.name,
            symbol = %symbol,
            qty = quantity,
            master_order_id,
            "copied master entry"
        );
        FollowerOutcome {
            wallet: wallet.name.clone(),
            status: "copied".to_string(),
            detail: None,
        }
    }

    fn record_failure(
        &self,
        wallet: &FollowerWallet,
        symbol: &str,
        side: TradeSide,
        position_side: PositionSide,
        master_order_id: i64,
        quantity: f64,
        error: &str,
    ) -> FollowerOutcome {
        warn!(wallet = %wallet.name, symbol = %symbol, "copy failed: {error}");
        let position = FollowerPosition {
            id: 0,
            master_order_id,
            wallet_id: wallet.id,
            follower_order_id: None,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            position_side: position_side.as_str().to_string(),
            quantity,
            entry_price: None,
            exit_price: None,
            pnl: None,
            status: FollowerPositionStatus::Error,
            error: Some(error.to_string()),
        };
        if let Err(e) = self.store.record_follower_position(&position) {
            warn!(wallet = %wallet.name, error = %e, "follower error persistence failed");
        }
        FollowerOutcome {
            wallet: wallet.name.clone(),
            status: "error".to_string(),
            detail: Some(error.to_string()),
        }
    }

    /// Close every follower position linked to masters on this key.
    pub async fn handle_master_close(self: &Arc<Self>, symbol: &str, position_side: PositionSide, exit_price: f64) {
        let master_ids = self
            .open_masters
            .lock()
            .remove(&(symbol.to_string(), position_side))
            .unwrap_or_default();
        for master_order_id in master_ids {
            self.close_followers_for(master_order_id, exit_price).await;
        }
    }

    async fn close_followers_for(&self, master_order_id: i64, exit_price: f64) {
        let positions = match self.store.open_positions_for_master(master_order_id) {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, master_order_id, "follower position lookup failed");
                return;
            }
        };
        for position in positions {
            let wallet = match self.store.find_wallet(position.wallet_id) {
                Ok(Some(wallet)) => wallet,
                _ => {
                    warn!(wallet_id = position.wallet_id, "follower wallet missing, marking error");
                    let _ = self
                        .store
                        .mark_follower_position_error(position.id, "wallet record missing");
                    continue;
                }
            };

            let side = TradeSide::parse(&position.side).unwrap_or(TradeSide::Buy);
            let direction = match side {
                TradeSide::Buy => SignalDirection::Long,
                TradeSide::Sell => SignalDirection::Short,
            };
            let pnl = position
                .entry_price
                .map(|entry| realized_pnl(direction, entry, exit_price, position.quantity))
                .unwrap_or(0.0);

            if self.paper_mode() {
                let _ = self
                    .store
                    .close_follower_position(position.id, exit_price, pnl);
                continue;
            }

            let client = self.client_for(&wallet);
            // Close with the position side the mirror was opened under, not
            // whatever the config says now; the mode may have changed since.
            let position_side =
                PositionSide::parse(&position.position_side).unwrap_or(PositionSide::Both);
            let hedge = position_side != PositionSide::Both;
            let close_params = OrderParams::market(
                &position.symbol,
                side.opposite(),
                position_side,
                position.quantity,
            )
            .reduce_only();
            match client.place_order(&close_params, hedge, Priority::Critical).await {
                Ok(ack) => {
                    let realized_exit = if ack.avg_price > 0.0 {
                        ack.avg_price
                    } else {
                        exit_price
                    };
                    let pnl = position
                        .entry_price
                        .map(|entry| realized_pnl(direction, entry, realized_exit, position.quantity))
                        .unwrap_or(0.0);
                    if let Err(e) =
                        self.store
                            .close_follower_position(position.id, realized_exit, pnl)
                    {
                        warn!(error = %e, "follower close persistence failed");
                    }
                    info!(wallet = %wallet.name, symbol = %position.symbol, pnl, "follower position closed");
                }
                Err(e) => {
                    warn!(wallet = %wallet.name, error = %e, "follower close failed");
                    let _ = self
                        .store
                        .mark_follower_position_error(position.id, &e.to_string());
                }
            }
        }
    }

    /// Master TP/SL settings changed: rebuild follower protective orders
    /// sized to each follower's open quantity.
    pub async fn refresh_follower_protection(self: &Arc<Self>, symbol: &str) {
        if self.paper_mode() {
            return;
        }
        let masters: Vec<i64> = self
            .open_masters
            .lock()
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .flat_map(|(_, ids)| ids.clone())
            .collect();
        for master_order_id in masters {
            let positions = match self.store.open_positions_for_master(master_order_id) {
                Ok(positions) => positions,
                Err(_) => continue,
            };
            for position in positions {
                let Ok(Some(wallet)) = self.store.find_wallet(position.wallet_id) else {
                    continue;
                };
                let client = self.client_for(&wallet);
                // Drop existing protective legs, then re-place at new levels.
                if let Ok(orders) = client.open_orders(Some(symbol)).await {
                    for order in orders {
                        if (order.is_stop() || order.is_take_profit())
                            && (order.reduce_only || order.close_position)
                        {
                            let _ = client
                                .cancel_order(symbol, order.order_id, Priority::High)
                                .await;
                        }
                    }
                }
                let side = TradeSide::parse(&position.side).unwrap_or(TradeSide::Buy);
                // Re-place legs under the open-time position side.
                let position_side =
                    PositionSide::parse(&position.position_side).unwrap_or(PositionSide::Both);
                self.place_follower_protection(
                    &client,
                    &wallet,
                    symbol,
                    side,
                    position_side,
                    position.quantity,
                    position.entry_price,
                )
                .await;
            }
        }
    }

    /// Wire the fan-out to the status bus: master entry fills open mirrors,
    /// master closes unwind them.
    pub fn spawn_listener(
        self: Arc<Self>,
        shutdown: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.bus.subscribe();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(StatusEvent::OrderFilled {
                            symbol,
                            order_id,
                            side,
                            position_side,
                            quantity,
                            reduce_only: false,
                            ..
                        }) => {
                            if self.enabled() {
                                self.handle_master_open(&symbol, side, position_side, order_id, quantity)
                                    .await;
                            }
                        }
                        Ok(StatusEvent::PositionClosed { symbol, position_side, exit_price, .. }) => {
                            if self.enabled() {
                                self.handle_master_close(&symbol, position_side, exit_price).await;
                            }
                        }
                        Ok(StatusEvent::ConfigUpdated { changed }) => {
                            // Master TP/SL changes propagate to follower legs.
                            if self.enabled() {
                                for symbol in symbols_with_protection_changes(&changed) {
                                    self.refresh_follower_protection(&symbol).await;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "copy trader lagged on status bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

/// Symbols whose `tp_percent`/`sl_percent` appear in a config diff
/// (paths look like `symbols.BTCUSDT.tp_percent`).
fn symbols_with_protection_changes(changed: &[String]) -> Vec<String> {
    let mut symbols = Vec::new();
    for path in changed {
        let mut parts = path.split('.');
        if parts.next() != Some("symbols") {
            continue;
        }
        let (Some(symbol), Some(field)) = (parts.next(), parts.next()) else {
            continue;
        };
        if matches!(field, "tp_percent" | "sl_percent") && !symbols.iter().any(|s| s == symbol) {
            symbols.push(symbol.to_string());
        }
    }
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{shared, Config, SymbolSettings};
    use crate::exchange::filters::SymbolFilter;

    fn copy_trader(store: Arc<OperationalStore>) -> Arc<CopyTrader> {
        let mut config = Config::default();
        config.global.paper_mode = true;
        config.global.copy_trading.enabled = true;
        config.global.copy_trading.max_multiplier = 10.0;
        let mut sym = SymbolSettings::default();
        sym.leverage = 10;
        config.symbols.insert("BTCUSDT".to_string(), sym);

        let mut filters = HashMap::new();
        filters.insert(
            "BTCUSDT".to_string(),
            SymbolFilter {
                tick_size: 0.1,
                step_size: 0.001,
                min_qty: 0.001,
                min_notional: 5.0,
                price_scale: 1,
                qty_scale: 3,
            },
        );
        let catalog = Arc::new(SymbolCatalog::with_static(filters, None));
        CopyTrader::new(
            shared(config),
            store,
            catalog,
            StatusBroadcaster::new(64),
            "https://example.invalid",
        )
    }

    fn wallet(name: &str, multiplier: f64, allowlist: Option<Vec<&str>>, pair_max: usize) -> FollowerWallet {
        FollowerWallet {
            id: 0,
            name: name.to_string(),
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            enabled: true,
            multiplier,
            max_positions_per_pair: pair_max,
            symbol_allowlist: allowlist.map(|l| l.into_iter().map(String::from).collect()),
        }
    }

    #[tokio::test]
    async fn fan_out_skips_filtered_and_capped_followers() {
        let store = Arc::new(OperationalStore::open_in_memory().unwrap());
        // A: pair cap already reached. B: allow-list excludes the symbol.
        let a_id = store
            .upsert_wallet(&wallet("A", 0.5, Some(vec!["BTCUSDT"]), 2))
            .unwrap();
        store
            .upsert_wallet(&wallet("B", 2.0, Some(vec!["ETHUSDT"]), 2))
            .unwrap();
        for master in [1, 2] {
            store
                .record_follower_position(&FollowerPosition {
                    id: 0,
                    master_order_id: master,
                    wallet_id: a_id,
                    follower_order_id: Some(master * 10),
                    symbol: "BTCUSDT".to_string(),
                    side: "BUY".to_string(),
                    position_side: "BOTH".to_string(),
                    quantity: 0.005,
                    entry_price: Some(60_000.0),
                    exit_price: None,
                    pnl: None,
                    status: FollowerPositionStatus::Open,
                    error: None,
                })
                .unwrap();
        }

        let trader = copy_trader(Arc::clone(&store));
        let result = trader
            .handle_master_open("BTCUSDT", TradeSide::Buy, PositionSide::Both, 42, 0.010)
            .await;

        assert_eq!(result.successful, 0);
        assert_eq!(result.failed, 0);
        assert_eq!(result.outcomes.len(), 2);
        assert!(result.outcomes.iter().all(|o| o.status == "skipped"));
        let details: Vec<&str> = result
            .outcomes
            .iter()
            .filter_map(|o| o.detail.as_deref())
            .collect();
        assert!(details.iter().any(|d| d.contains("pair cap")));
        assert!(details.iter().any(|d| d.contains("allow-list")));
    }

    #[tokio::test]
    async fn paper_fan_out_records_scaled_position() {
        let store = Arc::new(OperationalStore::open_in_memory().unwrap());
        let a_id = store.upsert_wallet(&wallet("A", 0.5, None, 2)).unwrap();
        let trader = copy_trader(Arc::clone(&store));

        let result = trader
            .handle_master_open("BTCUSDT", TradeSide::Buy, PositionSide::Both, 42, 0.010)
            .await;
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 0);

        let open = store.open_positions_for_master(42).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].wallet_id, a_id);
        // 0.010 * 0.5 = 0.005
        assert!((open[0].quantity - 0.005).abs() < 1e-12);
    }

    #[tokio::test]
    async fn follower_record_keeps_open_time_position_side() {
        let store = Arc::new(OperationalStore::open_in_memory().unwrap());
        store.upsert_wallet(&wallet("A", 1.0, None, 2)).unwrap();
        let trader = copy_trader(Arc::clone(&store));
        trader
            .handle_master_open("BTCUSDT", TradeSide::Buy, PositionSide::Long, 77, 0.010)
            .await;

        // The hedge-mode side used at open time is what the close path will
        // replay, regardless of later position_mode config edits.
        let open = store.open_positions_for_master(77).unwrap();
        assert_eq!(open[0].position_side, "LONG");
        {
            let mut config = trader.config.write();
            config.global.position_mode = crate::models::PositionMode::OneWay;
        }
        trader
            .handle_master_close("BTCUSDT", PositionSide::Long, 61_000.0)
            .await;
        assert!(store.open_positions_for_master(77).unwrap().is_empty());
    }

    #[tokio::test]
    async fn master_close_unwinds_paper_followers() {
        let store = Arc::new(OperationalStore::open_in_memory().unwrap());
        store.upsert_wallet(&wallet("A", 1.0, None, 2)).unwrap();
        let trader = copy_trader(Arc::clone(&store));
        trader
            .handle_master_open("BTCUSDT", TradeSide::Buy, PositionSide::Both, 42, 0.010)
            .await;
        assert_eq!(store.open_positions_for_master(42).unwrap().len(), 1);

        trader
            .handle_master_close("BTCUSDT", PositionSide::Both, 61_000.0)
            .await;
        assert!(store.open_positions_for_master(42).unwrap().is_empty());
    }

    #[test]
    fn protection_change_detection_parses_diff_paths() {
        let changed = vec![
            "global.max_open_positions".to_string(),
            "symbols.BTCUSDT.tp_percent".to_string(),
            "symbols.BTCUSDT.sl_percent".to_string(),
            "symbols.ETHUSDT.leverage".to_string(),
        ];
        assert_eq!(symbols_with_protection_changes(&changed), vec!["BTCUSDT"]);
    }

    #[tokio::test]
    async fn zero_multiplier_is_skipped_not_failed() {
        let store = Arc::new(OperationalStore::open_in_memory().unwrap());
        store.upsert_wallet(&wallet("Z", 0.0, None, 2)).unwrap();
        let trader = copy_trader(Arc::clone(&store));
        let result = trader
            .handle_master_open("BTCUSDT", TradeSide::Buy, PositionSide::Both, 7, 0.010)
            .await;
        assert_eq!(result.successful + result.failed, 0);
        assert_eq!(result.outcomes[0].status, "skipped");
    }
}
