//! Liquidation store.
//!
//! Append-only market-data persistence. The ingress path never blocks: events
//! go through a bounded channel into a dedicated writer task, and overflow
//! drops the row while bumping a logged counter. Reads serve the dashboard
//! queries and the offline optimizer.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::models::{now_ms, LiquidationEvent, TradeSide};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS liquidations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    price REAL NOT NULL,
    quantity REAL NOT NULL,
    notional REAL NOT NULL,
    event_time INTEGER NOT NULL,
    ingress_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_liq_event_time
    ON liquidations(event_time DESC);

CREATE INDEX IF NOT EXISTS idx_liq_symbol_time
    ON liquidations(symbol, event_time DESC);
"#;

#[derive(Debug, Clone, Default)]
pub struct LiquidationStats {
    pub count: u64,
    pub total_notional: f64,
    pub per_symbol: Vec<(String, u64, f64)>,
}

pub struct LiquidationStore {
    conn: Arc<Mutex<Connection>>,
}

impl LiquidationStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening liquidation db {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying liquidation schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert(&self, event: &LiquidationEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO liquidations (symbol, side, price, quantity, notional, event_time, ingress_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.symbol,
                event.side.as_str(),
                event.price,
                event.quantity,
                event.notional(),
                event.event_time,
                event.ingress_time,
            ],
        )?;
        Ok(())
    }

    /// Chronological page, oldest first.
    pub fn query(
        &self,
        symbol: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LiquidationEvent>> {
        let mut sql = String::from(
            "SELECT symbol, side, price, quantity, event_time, ingress_time
             FROM liquidations WHERE 1=1",
        );
        let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(s) = symbol {
            sql.push_str(" AND symbol = ?");
            bindings.push(Box::new(s.to_string()));
        }
        if let Some(t) = from {
            sql.push_str(" AND event_time >= ?");
            bindings.push(Box::new(t));
        }
        if let Some(t) = to {
            sql.push_str(" AND event_time <= ?");
            bindings.push(Box::new(t));
        }
        sql.push_str(" ORDER BY event_time ASC LIMIT ? OFFSET ?");
        bindings.push(Box::new(limit));
        bindings.push(Box::new(offset));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(bindings.iter().map(|b| b.as_ref())),
            |row| {
                Ok(LiquidationEvent {
                    symbol: row.get(0)?,
                    side: TradeSide::parse(&row.get::<_, String>(1)?)
                        .unwrap_or(TradeSide::Sell),
                    price: row.get(2)?,
                    quantity: row.get(3)?,
                    event_time: row.get(4)?,
                    ingress_time: row.get(5)?,
                })
            },
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Aggregate stats over the trailing window.
    pub fn stats(&self, window_ms: i64) -> Result<LiquidationStats> {
        let cutoff = now_ms() - window_ms;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, COUNT(*), COALESCE(SUM(notional), 0)
             FROM liquidations WHERE event_time >= ?1
             GROUP BY symbol ORDER BY SUM(notional) DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        let mut stats = LiquidationStats::default();
        for row in rows.filter_map(|r| r.ok()) {
            stats.count += row.1;
            stats.total_notional += row.2;
            stats.per_symbol.push(row);
        }
        Ok(stats)
    }

    /// Drop rows older than the retention cutoff. Returns rows deleted.
    pub fn purge(&self, older_than_ms: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM liquidations WHERE event_time < ?1",
            params![older_than_ms],
        )?;
        if deleted > 0 {
            info!(deleted, "purged expired liquidations");
        }
        Ok(deleted)
    }
}

/// Non-blocking handle the ingress path writes through.
#[derive(Clone)]
pub struct LiquidationSink {
    tx: mpsc::Sender<LiquidationEvent>,
    dropped: Arc<AtomicU64>,
}

impl LiquidationSink {
    /// Fire-and-forget insert; drops (and counts) on a full backlog.
    pub fn offer(&self, event: LiquidationEvent) {
        if self.tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 100 == 1 {
                warn!(dropped, "liquidation writer backlog full, dropping events");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Start the writer task; returns the sink handed to the ingress path.
pub fn spawn_writer(
    store: Arc<LiquidationStore>,
    backlog: usize,
) -> (LiquidationSink, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<LiquidationEvent>(backlog);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = store.insert(&event) {
                warn!(error = %e, symbol = %event.symbol, "liquidation insert failed");
            }
        }
    });
    (
        LiquidationSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        handle,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(symbol: &str, side: TradeSide, notional: f64, event_time: i64) -> LiquidationEvent {
        LiquidationEvent {
            symbol: symbol.to_string(),
            side,
            price: 2.0,
            quantity: notional / 2.0,
            event_time,
            ingress_time: event_time + 5,
        }
    }

    #[test]
    fn insert_then_query_round_trips() {
        let store = LiquidationStore::open_in_memory().unwrap();
        store.insert(&event("BTCUSDT", TradeSide::Sell, 1000.0, 100)).unwrap();
        store.insert(&event("BTCUSDT", TradeSide::Buy, 2000.0, 200)).unwrap();
        store.insert(&event("ETHUSDT", TradeSide::Sell, 500.0, 150)).unwrap();

        let all = store.query(None, None, None, 100, 0).unwrap();
        assert_eq!(all.len(), 3);
        // Chronological order.
        assert_eq!(all[0].event_time, 100);
        assert_eq!(all[2].event_time, 200);

        let btc = store.query(Some("BTCUSDT"), None, None, 100, 0).unwrap();
        assert_eq!(btc.len(), 2);

        let ranged = store.query(None, Some(120), Some(180), 100, 0).unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].symbol, "ETHUSDT");
    }

    #[test]
    fn pagination_applies_limit_and_offset() {
        let store = LiquidationStore::open_in_memory().unwrap();
        for i in 0..10 {
            store.insert(&event("BTCUSDT", TradeSide::Sell, 100.0, i)).unwrap();
        }
        let page = store.query(None, None, None, 3, 4).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].event_time, 4);
    }

    #[test]
    fn stats_aggregate_per_symbol() {
        let store = LiquidationStore::open_in_memory().unwrap();
        let now = now_ms();
        store.insert(&event("BTCUSDT", TradeSide::Sell, 1000.0, now)).unwrap();
        store.insert(&event("BTCUSDT", TradeSide::Sell, 500.0, now)).unwrap();
        store.insert(&event("ETHUSDT", TradeSide::Buy, 200.0, now)).unwrap();
        // Outside the window:
        store.insert(&event("ETHUSDT", TradeSide::Buy, 9999.0, now - 120_000)).unwrap();

        let stats = store.stats(60_000).unwrap();
        assert_eq!(stats.count, 3);
        assert!((stats.total_notional - 1700.0).abs() < 1e-6);
        assert_eq!(stats.per_symbol[0].0, "BTCUSDT");
    }

    #[test]
    fn purge_respects_cutoff() {
        let store = LiquidationStore::open_in_memory().unwrap();
        store.insert(&event("BTCUSDT", TradeSide::Sell, 100.0, 100)).unwrap();
        store.insert(&event("BTCUSDT", TradeSide::Sell, 100.0, 200)).unwrap();
        let deleted = store.purge(150).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.query(None, None, None, 10, 0).unwrap().len(), 1);
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("liq.db");
        {
            let store = LiquidationStore::open(&path).unwrap();
            store.insert(&event("BTCUSDT", TradeSide::Sell, 750.0, 42)).unwrap();
        }
        let reopened = LiquidationStore::open(&path).unwrap();
        let rows = reopened.query(None, None, None, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].notional() - 750.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn writer_task_persists_offered_events() {
        let store = Arc::new(LiquidationStore::open_in_memory().unwrap());
        let (sink, handle) = spawn_writer(Arc::clone(&store), 16);
        sink.offer(event("BTCUSDT", TradeSide::Sell, 300.0, 1));
        // Let the writer drain, then close the channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(sink);
        handle.await.unwrap();
        assert_eq!(store.query(None, None, None, 10, 0).unwrap().len(), 1);
    }
}
