//! Named lock set.
//!
//! Per-(symbol, role) string locks serialize concurrent protective-order
//! adjustments. Plain local mutexes held across the async placement or
//! cancellation; nothing distributed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct NamedLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock for `name`, creating it on first use. The guard may be
    /// held across awaits.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock();
            Arc::clone(
                inner
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Non-blocking attempt; None when someone else holds it.
    pub fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut inner = self.inner.lock();
            Arc::clone(
                inner
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.try_lock_owned().ok()
    }
}

impl Default for NamedLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_name_serializes() {
        let locks = NamedLocks::new();
        let guard = locks.acquire("adjust_BTCUSDT").await;
        assert!(locks.try_acquire("adjust_BTCUSDT").is_none());
        // Different name is independent.
        assert!(locks.try_acquire("adjust_ETHUSDT").is_some());
        drop(guard);
        assert!(locks.try_acquire("adjust_BTCUSDT").is_some());
    }
}
