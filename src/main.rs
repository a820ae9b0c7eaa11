//! CascadeBot binary.
//!
//! Subcommands: `start` runs the live/paper agent, `status` prints a
//! snapshot of catalog, rate budget, positions and recent errors, and
//! `optimize` runs the offline parameter search. Exit codes: 0 success,
//! 1 fatal configuration or runtime error, 2 exchange unreachable after
//! retries.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cascadebot::backtest::candles::CandleCache;
use cascadebot::backtest::optimizer::{
    apply_report, overwrite_confirmed, Optimizer, OptimizerWeights,
};
use cascadebot::config::{shared, ApiCredentials, Config};
use cascadebot::copytrade::CopyTrader;
use cascadebot::events::StatusBroadcaster;
use cascadebot::exchange::{
    streams, ExchangeClient, PriceFeed, RateLimitGovernor, SymbolCatalog, DEFAULT_REST_BASE,
    DEFAULT_WS_BASE,
};
use cascadebot::hunter::Hunter;
use cascadebot::position::{PositionManager, PositionTracker};
use cascadebot::storage::{spawn_writer, LiquidationStore, OperationalStore};

const EXIT_CONFIG: i32 = 1;
const EXIT_UNREACHABLE: i32 = 2;

#[derive(Parser)]
#[command(name = "cascadebot", about = "Liquidation-cascade mean-reversion trading agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading agent.
    Start {
        #[arg(long, default_value = "cascadebot.toml")]
        config: PathBuf,
    },
    /// Print a one-shot snapshot of catalog, budget, positions and errors.
    Status {
        #[arg(long, default_value = "cascadebot.toml")]
        config: PathBuf,
    },
    /// Replay stored liquidations to recommend per-symbol parameters.
    Optimize {
        #[arg(long, default_value = "cascadebot.toml")]
        config: PathBuf,
    },
}

fn rest_base() -> String {
    std::env::var("EXCHANGE_REST_BASE").unwrap_or_else(|_| DEFAULT_REST_BASE.to_string())
}

fn ws_base() -> String {
    std::env::var("EXCHANGE_WS_BASE").unwrap_or_else(|_| DEFAULT_WS_BASE.to_string())
}

fn load_config(path: &PathBuf) -> Config {
    match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

fn credentials(config: &Config) -> ApiCredentials {
    if config.global.paper_mode {
        return ApiCredentials::paper();
    }
    match ApiCredentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            error!("missing credentials for live mode: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cascadebot=info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Start { config } => run_start(config).await,
        Command::Status { config } => run_status(config).await,
        Command::Optimize { config } => run_optimize(config).await,
    };
    std::process::exit(code);
}

async fn run_start(config_path: PathBuf) -> i32 {
    let config = load_config(&config_path);
    let paper = config.global.paper_mode;
    info!(
        paper,
        symbols = config.symbols.len(),
        "starting cascadebot"
    );
    let creds = credentials(&config);
    let shared_config = shared(config.clone());

    let bus = StatusBroadcaster::new(1024);
    let governor = RateLimitGovernor::new(config.global.rate_limit.clone());
    let client = Arc::new(
        ExchangeClient::new(rest_base(), creds, Arc::clone(&governor))
            .with_broadcaster(bus.clone()),
    );

    // Symbol filters are required before any order math; an unreachable
    // venue is fatal in live mode.
    let catalog = Arc::new(SymbolCatalog::new(Arc::clone(&client)));
    if let Err(e) = catalog.load().await {
        if paper {
            warn!(error = %e, "exchangeInfo unavailable, using fallback filters");
        } else {
            error!(error = %e, "exchange unreachable");
            return EXIT_UNREACHABLE;
        }
    }

    let liquidation_store = match LiquidationStore::open(std::path::Path::new("liquidations.db")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("liquidation store: {e:#}");
            return EXIT_CONFIG;
        }
    };
    let operational_store = match OperationalStore::open(std::path::Path::new("operational.db")) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("operational store: {e:#}");
            return EXIT_CONFIG;
        }
    };
    let (sink, _writer_handle) = spawn_writer(Arc::clone(&liquidation_store), 4096);

    let (shutdown, _shutdown_rx) = broadcast::channel::<()>(8);
    let price_feed = Arc::new(PriceFeed::new(Arc::clone(&client)));

    // Mark prices for every symbol; candles only where VWAP protection is on.
    tokio::spawn(streams::run_mark_price_stream(
        ws_base(),
        Arc::clone(&price_feed),
        bus.clone(),
        shutdown.clone(),
    ));
    let kline_subscriptions: Vec<(String, String, u32)> = config
        .symbols
        .iter()
        .filter(|(_, s)| s.vwap_protection)
        .map(|(symbol, s)| (symbol.clone(), s.vwap_timeframe.clone(), s.vwap_lookback))
        .collect();
    tokio::spawn(streams::run_kline_streams(
        ws_base(),
        kline_subscriptions,
        Arc::clone(&price_feed),
        bus.clone(),
        shutdown.clone(),
    ));

    // Position manager. Initial reconciliation runs to completion here:
    // positions and protective bindings are rebuilt from REST before the
    // user-data stream, the liquidation stream, or the hunter ingest task is
    // spawned, so no signal can be evaluated against empty maps.
    let manager = PositionManager::new(
        shared_config.clone(),
        Arc::clone(&client),
        Arc::clone(&catalog),
        Arc::clone(&price_feed),
        bus.clone(),
        Some(Arc::clone(&operational_store)),
    );
    manager.sync().await;

    let (user_tx, user_rx) = mpsc::unbounded_channel();
    if !paper {
        tokio::spawn(streams::run_user_stream(
            ws_base(),
            Arc::clone(&client),
            user_tx.clone(),
            bus.clone(),
            shutdown.clone(),
        ));
    }
    Arc::clone(&manager).spawn_event_loop(user_rx, shutdown.clone());
    Arc::clone(&manager).spawn_audit(shutdown.clone());

    // Hunter and the liquidation feed.
    let hunter = Arc::new(Hunter::new(
        shared_config.clone(),
        Arc::clone(&catalog),
        Arc::clone(&client),
        Arc::clone(&price_feed),
        sink,
        bus.clone(),
    ));
    let tracker: Arc<dyn PositionTracker> = Arc::clone(&manager) as Arc<dyn PositionTracker>;
    hunter.set_position_tracker(tracker);
    if paper {
        hunter.set_paper_stream(user_tx.clone());
    }
    hunter.sync_position_mode().await;

    let (liq_tx, liq_rx) = mpsc::unbounded_channel();
    tokio::spawn(streams::run_liquidation_stream(
        ws_base(),
        liq_tx,
        bus.clone(),
        shutdown.clone(),
    ));
    Arc::clone(&hunter).spawn_ingest(liq_rx, shutdown.clone());
    Arc::clone(&hunter).spawn_pending_sweeper(shutdown.clone());
    Arc::clone(&hunter).spawn_mode_sync(shutdown.clone());
    Arc::clone(&hunter).spawn_fill_listener(shutdown.clone());

    // Copy trading fan-out.
    if config.global.copy_trading.enabled {
        let copy_trader = CopyTrader::new(
            shared_config.clone(),
            Arc::clone(&operational_store),
            Arc::clone(&catalog),
            bus.clone(),
            rest_base(),
        );
        copy_trader.spawn_listener(shutdown.clone());
    }

    governor.spawn_drainer(shutdown.subscribe());

    // Retention purge once an hour.
    {
        let store = Arc::clone(&liquidation_store);
        let retention_days = config.global.liquidation_retention_days.max(1);
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let cutoff = cascadebot::models::now_ms()
                            - retention_days * 24 * 60 * 60 * 1000;
                        if let Err(e) = store.purge(cutoff) {
                            warn!(error = %e, "liquidation purge failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    info!("cascadebot running; ctrl-c to stop");

    if tokio::signal::ctrl_c().await.is_err() {
        error!("signal handler failed");
        let _ = shutdown.send(());
        return EXIT_CONFIG;
    }
    info!("shutdown requested, draining tasks");
    let _ = shutdown.send(());
    // Tasks exit at their next suspension point; force exit after 5 s.
    tokio::time::sleep(Duration::from_secs(5)).await;
    0
}

async fn run_status(config_path: PathBuf) -> i32 {
    let config = load_config(&config_path);
    let creds = credentials(&config);
    let governor = RateLimitGovernor::new(config.global.rate_limit.clone());
    let client = Arc::new(ExchangeClient::new(rest_base(), creds, Arc::clone(&governor)));

    let catalog = SymbolCatalog::new(Arc::clone(&client));
    match catalog.load().await {
        Ok(count) => println!("symbol filters loaded: {count}"),
        Err(e) => {
            error!("exchange unreachable: {e}");
            return EXIT_UNREACHABLE;
        }
    }

    let snap = governor.snapshot();
    println!(
        "rate budget: weight {}/{}, orders {}/{}, queued {}",
        snap.weight_used, snap.weight_limit, snap.orders_used, snap.orders_limit, snap.queued
    );

    if let Ok(store) = LiquidationStore::open(std::path::Path::new("liquidations.db")) {
        if let Ok(stats) = store.stats(24 * 60 * 60 * 1000) {
            println!(
                "liquidations (24h): {} events, {:.0} USDT notional",
                stats.count, stats.total_notional
            );
            for (symbol, count, notional) in stats.per_symbol.iter().take(10) {
                println!("  {symbol}: {count} events, {notional:.0} USDT");
            }
        }
    }

    if !config.global.paper_mode {
        match client.position_risk().await {
            Ok(risks) => {
                let open: Vec<_> = risks.iter().filter(|r| r.position_amt.abs() > 1e-12).collect();
                println!("open positions: {}", open.len());
                for risk in open {
                    println!(
                        "  {} {} qty {} entry {} uPnL {:.2}",
                        risk.symbol,
                        risk.position_side,
                        risk.position_amt,
                        risk.entry_price,
                        risk.unrealized_profit
                    );
                }
            }
            Err(e) => warn!(error = %e, "position fetch failed"),
        }
        match client.open_orders(None).await {
            Ok(orders) => println!("open orders: {}", orders.len()),
            Err(e) => warn!(error = %e, "open-orders fetch failed"),
        }
    }

    if let Ok(store) = OperationalStore::open(std::path::Path::new("operational.db")) {
        if let Ok(errors) = store.recent_errors(5) {
            if !errors.is_empty() {
                println!("recent errors:");
                for (severity, component, message) in errors {
                    println!("  [{severity}] {component}: {message}");
                }
            }
        }
    }
    0
}

async fn run_optimize(config_path: PathBuf) -> i32 {
    match optimize_inner(&config_path).await {
        Ok(()) => 0,
        Err(e) => {
            error!("optimization failed: {e:#}");
            EXIT_CONFIG
        }
    }
}

async fn optimize_inner(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path);
    let store = LiquidationStore::open(std::path::Path::new("liquidations.db"))
        .context("opening liquidation store")?;
    let cache =
        CandleCache::open(std::path::Path::new("liquidations.db")).context("opening candle cache")?;

    // Candle fetch only needs public endpoints; paper credentials suffice.
    let governor = RateLimitGovernor::new(config.global.rate_limit.clone());
    let client = ExchangeClient::new(rest_base(), ApiCredentials::paper(), governor);

    let weights = OptimizerWeights::from_env();
    let optimizer = Optimizer::new(weights, 42, config.global.hunter_cooldown_ms);
    let report = optimizer
        .run(&config, &store, &cache, Some(&client))
        .await?;

    println!("=== optimizer report ===");
    println!("weights: pnl {:.2} sharpe {:.2} drawdown {:.2}", weights.pnl, weights.sharpe, weights.drawdown);
    for rec in &report.recommendations {
        println!(
            "{}: score {:.2} | pnl {:.2} USDT over {} trades | win {:.0}% stop {:.0}% dd {:.2}",
            rec.symbol,
            rec.score,
            rec.result.total_pnl,
            rec.result.trades,
            rec.result.win_rate * 100.0,
            rec.result.stop_rate * 100.0,
            rec.result.max_drawdown
        );
        println!(
            "  threshold {:.0}/{:.0} tp {}% sl {}% lev {}x window {}s cooldown {}s",
            rec.params.long_threshold,
            rec.params.short_threshold,
            rec.params.tp_percent,
            rec.params.sl_percent,
            rec.params.leverage,
            rec.params.window_ms / 1000,
            rec.params.cooldown_ms / 1000
        );
    }
    for symbol in &report.symbols_without_candidates {
        println!("{symbol}: no candidate survived the rejection gates");
    }
    println!(
        "recommended max_open_positions: {}",
        report.recommended_max_open_positions
    );

    if report.recommendations.is_empty() {
        return Ok(());
    }
    if overwrite_confirmed() {
        let updated = apply_report(&config, &report);
        let rendered = toml::to_string_pretty(&updated).context("serializing updated config")?;
        std::fs::write(config_path, rendered)
            .with_context(|| format!("writing {}", config_path.display()))?;
        println!("config updated: {}", config_path.display());
    } else {
        println!(
            "dry run: set FORCE_OPTIMIZER_OVERWRITE=1 (or FORCE_OPTIMIZER_CONFIRM=1) to apply"
        );
    }
    Ok(())
}
