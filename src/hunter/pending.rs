//! Pending-order registry.
//!
//! The duplicate-entry guard. A record is created under a temp key before
//! submission, re-keyed to the exchange order id on ack, and removed on fill,
//! cancel, rejection, or staleness. At most one record exists per
//! (symbol, side) at any time.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::models::TradeSide;

#[derive(Debug, Clone)]
pub struct PendingOrder {
    pub symbol: String,
    pub side: TradeSide,
    pub created_at: i64,
    pub order_id: Option<i64>,
}

/// Records older than this are swept.
pub const PENDING_MAX_AGE_MS: i64 = 5 * 60 * 1000;

pub struct PendingOrderRegistry {
    inner: Mutex<HashMap<String, PendingOrder>>,
}

impl PendingOrderRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the (symbol, side) slot. Returns the temp key, or None when an
    /// entry for that pair is already in flight.
    pub fn reserve(&self, symbol: &str, side: TradeSide, now: i64) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner
            .values()
            .any(|p| p.symbol == symbol && p.side == side)
        {
            return None;
        }
        let key = format!("temp_{now}_{symbol}_{}", side.as_str());
        inner.insert(
            key.clone(),
            PendingOrder {
                symbol: symbol.to_string(),
                side,
                created_at: now,
                order_id: None,
            },
        );
        Some(key)
    }

    /// Swap the temp key for the exchange order id after an ack.
    pub fn confirm(&self, temp_key: &str, order_id: i64) {
        let mut inner = self.inner.lock();
        if let Some(mut record) = inner.remove(temp_key) {
            record.order_id = Some(order_id);
            inner.insert(format!("order_{order_id}"), record);
        }
    }

    pub fn remove(&self, key: &str) -> Option<PendingOrder> {
        self.inner.lock().remove(key)
    }

    pub fn remove_by_order_id(&self, order_id: i64) -> Option<PendingOrder> {
        let mut inner = self.inner.lock();
        let key = inner
            .iter()
            .find(|(_, p)| p.order_id == Some(order_id))
            .map(|(k, _)| k.clone())?;
        inner.remove(&key)
    }

    pub fn has_pending_for_symbol(&self, symbol: &str) -> bool {
        self.inner.lock().values().any(|p| p.symbol == symbol)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop stale records; returns how many were removed.
    pub fn sweep(&self, now: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, p| now - p.created_at <= PENDING_MAX_AGE_MS);
        before - inner.len()
    }

    pub fn snapshot(&self) -> Vec<(String, PendingOrder)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for PendingOrderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_blocks_duplicate_symbol_side() {
        let registry = PendingOrderRegistry::new();
        let key = registry.reserve("BTCUSDT", TradeSide::Buy, 1_000).unwrap();
        assert!(key.starts_with("temp_1000_BTCUSDT_BUY"));
        // Same pair refused, opposite side allowed.
        assert!(registry.reserve("BTCUSDT", TradeSide::Buy, 2_000).is_none());
        assert!(registry.reserve("BTCUSDT", TradeSide::Sell, 2_000).is_some());
        assert!(registry.has_pending_for_symbol("BTCUSDT"));
        assert!(!registry.has_pending_for_symbol("ETHUSDT"));
    }

    #[test]
    fn confirm_rekeys_to_exchange_order_id() {
        let registry = PendingOrderRegistry::new();
        let key = registry.reserve("BTCUSDT", TradeSide::Buy, 1_000).unwrap();
        registry.confirm(&key, 987_654);
        assert!(registry.remove(&key).is_none());
        // Still guarding the symbol under the new key.
        assert!(registry.has_pending_for_symbol("BTCUSDT"));
        let removed = registry.remove_by_order_id(987_654).unwrap();
        assert_eq!(removed.order_id, Some(987_654));
        assert!(registry.is_empty());
    }

    #[test]
    fn sweep_removes_only_stale_records() {
        let registry = PendingOrderRegistry::new();
        registry.reserve("BTCUSDT", TradeSide::Buy, 0).unwrap();
        registry.reserve("ETHUSDT", TradeSide::Sell, 280_000).unwrap();
        // At t=301s the first record (t=0) is past the 5-minute age limit.
        let removed = registry.sweep(301_000);
        assert_eq!(removed, 1);
        assert!(!registry.has_pending_for_symbol("BTCUSDT"));
        assert!(registry.has_pending_for_symbol("ETHUSDT"));
    }

    #[test]
    fn released_slot_can_be_reserved_again() {
        let registry = PendingOrderRegistry::new();
        let key = registry.reserve("BTCUSDT", TradeSide::Buy, 1_000).unwrap();
        registry.remove(&key);
        assert!(registry.reserve("BTCUSDT", TradeSide::Buy, 2_000).is_some());
    }
}
