//! Candle cache.
//!
//! One-minute bars fetched over REST and kept in the market-data database so
//! repeated optimizer runs replay from disk. Keyed (symbol, interval,
//! open_time); upserts make re-fetches idempotent.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::exchange::client::ExchangeClient;
use crate::exchange::types::Candle;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS candles (
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    close_time INTEGER NOT NULL,
    quote_volume REAL NOT NULL,
    PRIMARY KEY (symbol, interval, open_time)
) WITHOUT ROWID;
"#;

/// Page size the klines endpoint allows.
const FETCH_LIMIT: u32 = 1000;

pub struct CandleCache {
    conn: Arc<Mutex<Connection>>,
}

impl CandleCache {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening candle cache {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying candle schema")?;
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

    pub fn upsert(&self, symbol: &str, interval: &str, candles: &[Candle]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO candles
                    (symbol, interval, open_time, open, high, low, close, volume, close_time, quote_volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
                    open = excluded.open, high = excluded.high, low = excluded.low,
                    close = excluded.close, volume = excluded.volume,
                    close_time = excluded.close_time, quote_volume = excluded.quote_volume",
            )?;
            for candle in candles {
                stmt.execute(params![
                    symbol,
                    interval,
                    candle.open_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                    candle.close_time,
                    candle.quote_volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load(&self, symbol: &str, interval: &str, from: i64, to: i64) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT open_time, open, high, low, close, volume, close_time, quote_volume
             FROM candles
             WHERE symbol = ?1 AND interval = ?2 AND open_time >= ?3 AND open_time <= ?4
             ORDER BY open_time ASC",
        )?;
        let rows = stmt.query_map(params![symbol, interval, from, to], |row| {
            Ok(Candle {
                open_time: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
                close_time: row.get(6)?,
                quote_volume: row.get(7)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn latest_open_time(&self, symbol: &str, interval: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let latest = conn
            .query_row(
                "SELECT MAX(open_time) FROM candles WHERE symbol = ?1 AND interval = ?2",
                params![symbol, interval],
                |row| row.get::<_, Option<i64>>(0),
            )
            .unwrap_or(None);
        Ok(latest)
    }

    /// Pull any bars missing from [from, to] off the venue, paging forward
    /// from the newest cached bar.
    pub async fn ensure_range(
        &self,
        client: &ExchangeClient,
        symbol: &str,
        interval: &str,
        from: i64,
        to: i64,
    ) -> Result<()> {
        let mut cursor = match self.latest_open_time(symbol, interval)? {
            Some(latest) if latest >= from => latest + 1,
            _ => from,
        };
        let mut fetched = 0usize;
        while cursor < to {
            let page = client
                .klines(symbol, interval, FETCH_LIMIT, Some(cursor), Some(to))
                .await
                .with_context(|| format!("fetching {interval} candles for {symbol}"))?;
            if page.is_empty() {
                break;
            }
            fetched += page.len();
            let last_open = page.last().map(|c| c.open_time).unwrap_or(to);
            self.upsert(symbol, interval, &page)?;
            if last_open <= cursor {
                break;
            }
            cursor = last_open + 1;
            if page.len() < FETCH_LIMIT as usize {
                break;
            }
        }
        if fetched > 0 {
            info!(symbol = %symbol, interval = %interval, fetched, "candle cache extended");
        } else {
            debug!(symbol = %symbol, interval = %interval, "candle cache already current");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            close_time: open_time + 59_999,
            quote_volume: close,
        }
    }

    #[test]
    fn upsert_and_load_ordered() {
        let cache = CandleCache::open_in_memory().unwrap();
        cache
            .upsert("BTCUSDT", "1m", &[candle(120_000, 2.0), candle(0, 1.0), candle(60_000, 1.5)])
            .unwrap();
        let loaded = cache.load("BTCUSDT", "1m", 0, 200_000).unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.windows(2).all(|w| w[0].open_time < w[1].open_time));
        assert_eq!(cache.latest_open_time("BTCUSDT", "1m").unwrap(), Some(120_000));
    }

    #[test]
    fn upsert_is_idempotent_and_updates() {
        let cache = CandleCache::open_in_memory().unwrap();
        cache.upsert("BTCUSDT", "1m", &[candle(0, 1.0)]).unwrap();
        cache.upsert("BTCUSDT", "1m", &[candle(0, 9.0)]).unwrap();
        let loaded = cache.load("BTCUSDT", "1m", 0, 10).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].close, 9.0);
    }

    #[test]
    fn intervals_are_isolated() {
        let cache = CandleCache::open_in_memory().unwrap();
        cache.upsert("BTCUSDT", "1m", &[candle(0, 1.0)]).unwrap();
        cache.upsert("BTCUSDT", "5m", &[candle(0, 2.0)]).unwrap();
        assert_eq!(cache.load("BTCUSDT", "1m", 0, 10).unwrap().len(), 1);
        assert_eq!(cache.load("BTCUSDT", "1m", 0, 10).unwrap()[0].close, 1.0);
    }
}
