//! Operational store.
//!
//! Follower wallets and their mirrored positions, plus the persisted error
//! log. Lives in its own database so market-data retention purges never touch
//! operator state.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS follower_wallets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    api_key TEXT NOT NULL,
    api_secret TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    multiplier REAL NOT NULL DEFAULT 1.0,
    max_positions_per_pair INTEGER NOT NULL DEFAULT 1,
    symbol_allowlist TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS follower_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    master_order_id INTEGER NOT NULL,
    wallet_id INTEGER NOT NULL,
    follower_order_id INTEGER,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    position_side TEXT NOT NULL DEFAULT 'BOTH',
    quantity REAL NOT NULL,
    entry_price REAL,
    exit_price REAL,
    pnl REAL,
    status TEXT NOT NULL DEFAULT 'open',
    error TEXT,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    FOREIGN KEY (wallet_id) REFERENCES follower_wallets(id)
);

CREATE INDEX IF NOT EXISTS idx_follower_positions_master
    ON follower_positions(master_order_id, status);

CREATE INDEX IF NOT EXISTS idx_follower_positions_wallet
    ON follower_positions(wallet_id, symbol, status);

CREATE TABLE IF NOT EXISTS error_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    severity TEXT NOT NULL,
    component TEXT NOT NULL,
    message TEXT NOT NULL,
    context TEXT,
    created_at TEXT NOT NULL
);
"#;

/// A follower account mirrored by the copy trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerWallet {
    pub id: i64,
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub enabled: bool,
    /// Position-size multiplier applied to the master quantity.
    pub multiplier: f64,
    pub max_positions_per_pair: usize,
    /// None mirrors every symbol.
    pub symbol_allowlist: Option<Vec<String>>,
}

impl FollowerWallet {
    pub fn allows_symbol(&self, symbol: &str) -> bool {
        match &self.symbol_allowlist {
            Some(list) => list.iter().any(|s| s.eq_ignore_ascii_case(symbol)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowerPositionStatus {
    Open,
    Closed,
    Error,
}

impl FollowerPositionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FollowerPositionStatus::Open => "open",
            FollowerPositionStatus::Closed => "closed",
            FollowerPositionStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> FollowerPositionStatus {
        match s {
            "closed" => FollowerPositionStatus::Closed,
            "error" => FollowerPositionStatus::Error,
            _ => FollowerPositionStatus::Open,
        }
    }
}

/// Links a master order to the follower order mirroring it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowerPosition {
    pub id: i64,
    pub master_order_id: i64,
    pub wallet_id: i64,
    pub follower_order_id: Option<i64>,
    pub symbol: String,
    pub side: String,
    /// Position side the mirror was opened with. Closes and protective
    /// re-placements reuse it verbatim; the account mode may have changed
    /// since open.
    pub position_side: String,
    pub quantity: f64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub status: FollowerPositionStatus,
    pub error: Option<String>,
}

pub struct OperationalStore {
    conn: Arc<Mutex<Connection>>,
}

impl OperationalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening operational db {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("applying operational schema")?;
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

    // -- wallets -------------------------------------------------------------

    pub fn upsert_wallet(&self, wallet: &FollowerWallet) -> Result<i64> {
        let allowlist = wallet
            .symbol_allowlist
            .as_ref()
            .map(|l| serde_json::to_string(l))
            .transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO follower_wallets
                (name, api_key, api_secret, enabled, multiplier, max_positions_per_pair, symbol_allowlist, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(name) DO UPDATE SET
                api_key = excluded.api_key,
                api_secret = excluded.api_secret,
                enabled = excluded.enabled,
                multiplier = excluded.multiplier,
                max_positions_per_pair = excluded.max_positions_per_pair,
                symbol_allowlist = excluded.symbol_allowlist",
            params![
                wallet.name,
                wallet.api_key,
                wallet.api_secret,
                wallet.enabled,
                wallet.multiplier,
                wallet.max_positions_per_pair as i64,
                allowlist,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM follower_wallets WHERE name = ?1",
            params![wallet.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn enabled_wallets(&self) -> Result<Vec<FollowerWallet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, api_key, api_secret, enabled, multiplier, max_positions_per_pair, symbol_allowlist
             FROM follower_wallets WHERE enabled = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let allowlist: Option<String> = row.get(7)?;
            Ok(FollowerWallet {
                id: row.get(0)?,
                name: row.get(1)?,
                api_key: row.get(2)?,
                api_secret: row.get(3)?,
                enabled: row.get(4)?,
                multiplier: row.get(5)?,
                max_positions_per_pair: row.get::<_, i64>(6)? as usize,
                symbol_allowlist: allowlist
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // -- follower positions --------------------------------------------------

    pub fn record_follower_position(&self, position: &FollowerPosition) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO follower_positions
                (master_order_id, wallet_id, follower_order_id, symbol, side, position_side,
                 quantity, entry_price, status, error, opened_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                position.master_order_id,
                position.wallet_id,
                position.follower_order_id,
                position.symbol,
                position.side,
                position.position_side,
                position.quantity,
                position.entry_price,
                position.status.as_str(),
                position.error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn open_positions_for_master(&self, master_order_id: i64) -> Result<Vec<FollowerPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, master_order_id, wallet_id, follower_order_id, symbol, side, position_side,
                    quantity, entry_price, exit_price, pnl, status, error
             FROM follower_positions WHERE master_order_id = ?1 AND status = 'open'",
        )?;
        let rows = stmt.query_map(params![master_order_id], |row| {
            Ok(FollowerPosition {
                id: row.get(0)?,
                master_order_id: row.get(1)?,
                wallet_id: row.get(2)?,
                follower_order_id: row.get(3)?,
                symbol: row.get(4)?,
                side: row.get(5)?,
                position_side: row.get(6)?,
                quantity: row.get(7)?,
                entry_price: row.get(8)?,
                exit_price: row.get(9)?,
                pnl: row.get(10)?,
                status: FollowerPositionStatus::parse(&row.get::<_, String>(11)?),
                error: row.get(12)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn close_follower_position(&self, id: i64, exit_price: f64, pnl: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE follower_positions
             SET status = 'closed', exit_price = ?2, pnl = ?3, closed_at = ?4
             WHERE id = ?1",
            params![id, exit_price, pnl, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_follower_position_error(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE follower_positions SET status = 'error', error = ?2, closed_at = ?3 WHERE id = ?1",
            params![id, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Open mirrored positions for one wallet on one symbol; backs the
    /// per-pair cap.
    pub fn open_position_count(&self, wallet_id: i64, symbol: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM follower_positions
             WHERE wallet_id = ?1 AND symbol = ?2 AND status = 'open'",
            params![wallet_id, symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn find_wallet(&self, id: i64) -> Result<Option<FollowerWallet>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, api_key, api_secret, enabled, multiplier, max_positions_per_pair, symbol_allowlist
             FROM follower_wallets WHERE id = ?1",
            params![id],
            |row| {
                let allowlist: Option<String> = row.get(7)?;
                Ok(FollowerWallet {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    api_key: row.get(2)?,
                    api_secret: row.get(3)?,
                    enabled: row.get(4)?,
                    multiplier: row.get(5)?,
                    max_positions_per_pair: row.get::<_, i64>(6)? as usize,
                    symbol_allowlist: allowlist.and_then(|raw| serde_json::from_str(&raw).ok()),
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    // -- error log -----------------------------------------------------------

    pub fn log_error(&self, severity: &str, component: &str, message: &str, context: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_log (severity, component, message, context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![severity, component, message, context, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_errors(&self, limit: u32) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT severity, component, message FROM error_log
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
