//! Rate-limit governor.
//!
//! Sliding one-minute windows over request weight and order count. Requests
//! carry a priority; lower priorities are refused earlier so a reserve band
//! stays free for protective-order placement and position closes. Deferred
//! requests park in bounded per-priority FIFO queues drained as the window
//! slides.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::RateLimitSettings;
use crate::errors::{ExchangeError, ExchangeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub weight_used: u32,
    pub weight_limit: u32,
    pub orders_used: u32,
    pub orders_limit: u32,
    pub queued: usize,
}

struct Waiter {
    weight: u32,
    is_order: bool,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

struct GovernorState {
    weight_events: VecDeque<(Instant, u32)>,
    order_events: VecDeque<Instant>,
    /// Latest usage reported by response headers, trusted for one window.
    header_weight: Option<(Instant, u32)>,
    header_orders: Option<(Instant, u32)>,
    queues: [VecDeque<Waiter>; 4],
}

pub struct RateLimitGovernor {
    settings: RateLimitSettings,
    window: Duration,
    state: Mutex<GovernorState>,
}

impl RateLimitGovernor {
    pub fn new(settings: RateLimitSettings) -> Arc<Self> {
        Self::with_window(settings, Duration::from_secs(60))
    }

    pub fn with_window(settings: RateLimitSettings, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            settings,
            window,
            state: Mutex::new(GovernorState {
                weight_events: VecDeque::new(),
                order_events: VecDeque::new(),
                header_weight: None,
                header_orders: None,
                queues: Default::default(),
            }),
        })
    }

    /// Fraction of the budget a priority may consume. Critical sees the full
    /// window; each band below leaves a slice of the reserve untouched.
    fn allowed_fraction(&self, priority: Priority) -> f64 {
        let reserve = self.settings.reserve_percent / 100.0;
        match priority {
            Priority::Critical => 1.0,
            Priority::High => 1.0 - reserve / 3.0,
            Priority::Medium => 1.0 - reserve * 2.0 / 3.0,
            Priority::Low => 1.0 - reserve,
        }
    }

    fn evict(&self, state: &mut GovernorState, now: Instant) {
        while let Some((t, _)) = state.weight_events.front() {
            if now.duration_since(*t) >= self.window {
                state.weight_events.pop_front();
            } else {
                break;
            }
        }
        while let Some(t) = state.order_events.front() {
            if now.duration_since(*t) >= self.window {
                state.order_events.pop_front();
            } else {
                break;
            }
        }
    }

    fn usage(&self, state: &GovernorState, now: Instant) -> (u32, u32) {
        let local_weight: u32 = state.weight_events.iter().map(|(_, w)| *w).sum();
        let local_orders = state.order_events.len() as u32;
        let header_weight = state
            .header_weight
            .filter(|(t, _)| now.duration_since(*t) < self.window)
            .map(|(_, w)| w)
            .unwrap_or(0);
        let header_orders = state
            .header_orders
            .filter(|(t, _)| now.duration_since(*t) < self.window)
            .map(|(_, o)| o)
            .unwrap_or(0);
        (
            local_weight.max(header_weight),
            local_orders.max(header_orders),
        )
    }

    fn admits(&self, state: &GovernorState, now: Instant, weight: u32, is_order: bool, priority: Priority) -> bool {
        let (weight_used, orders_used) = self.usage(state, now);
        let fraction = self.allowed_fraction(priority);
        let weight_cap = (self.settings.weight_limit_per_min as f64 * fraction) as u32;
        if weight_used + weight > weight_cap {
            return false;
        }
        if is_order {
            let order_cap = (self.settings.order_limit_per_min as f64 * fraction) as u32;
            if orders_used + 1 > order_cap {
                return false;
            }
        }
        true
    }

    /// Non-consuming admission probe.
    pub fn can_make_request(&self, weight: u32, is_order: bool, priority: Priority) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        self.admits(&state, now, weight, is_order, priority)
    }

    fn record_locked(&self, state: &mut GovernorState, now: Instant, weight: u32, is_order: bool) {
        state.weight_events.push_back((now, weight));
        if is_order {
            state.order_events.push_back(now);
        }
    }

    /// Record usage without admission (e.g. after a critical bypass).
    pub fn record(&self, weight: u32, is_order: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        self.record_locked(&mut state, now, weight, is_order);
    }

    /// Resync from `X-MBX-USED-WEIGHT-1M` / `X-MBX-ORDER-COUNT-1M` headers.
    pub fn sync_from_headers(&self, weight_used: Option<u32>, orders_used: Option<u32>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(w) = weight_used {
            state.header_weight = Some((now, w));
        }
        if let Some(o) = orders_used {
            state.header_orders = Some((now, o));
        }
    }

    /// Admit now or park in the priority queue until budget frees up.
    /// Critical requests skip the queue entirely while the full budget holds.
    pub async fn acquire(&self, weight: u32, is_order: bool, priority: Priority) -> ExchangeResult<()> {
        let rx = {
            let now = Instant::now();
            let mut state = self.state.lock();
            self.evict(&mut state, now);
            if self.admits(&state, now, weight, is_order, priority) {
                self.record_locked(&mut state, now, weight, is_order);
                return Ok(());
            }
            let queue = &mut state.queues[priority.index()];
            if queue.len() >= self.settings.queue_capacity {
                return Err(ExchangeError::RateLimit {
                    msg: format!("{:?} queue full", priority),
                });
            }
            let (tx, rx) = oneshot::channel();
            queue.push_back(Waiter {
                weight,
                is_order,
                enqueued_at: now,
                tx,
            });
            rx
        };

        let timeout = Duration::from_millis(self.settings.queue_timeout_ms);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(ExchangeError::RateLimit {
                msg: format!("queued request timed out after {}ms", timeout.as_millis()),
            }),
        }
    }

    /// Pop queued waiters whose admission now passes, highest priority first.
    /// Expired waiters are dropped; their `acquire` future times out.
    pub fn drain(&self) {
        let now = Instant::now();
        let timeout = Duration::from_millis(self.settings.queue_timeout_ms);
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        for idx in (0..4).rev() {
            let priority = match idx {
                3 => Priority::Critical,
                2 => Priority::High,
                1 => Priority::Medium,
                _ => Priority::Low,
            };
            loop {
                let expired = matches!(
                    state.queues[idx].front(),
                    Some(w) if now.duration_since(w.enqueued_at) > timeout
                );
                if expired {
                    state.queues[idx].pop_front();
                    continue;
                }
                let admit = matches!(
                    state.queues[idx].front(),
                    Some(w) if self.admits(&state, now, w.weight, w.is_order, priority)
                );
                if !admit {
                    break;
                }
                let waiter = state.queues[idx].pop_front().expect("front checked");
                self.record_locked(&mut state, now, waiter.weight, waiter.is_order);
                if waiter.tx.send(()).is_err() {
                    debug!("queued requester went away before admission");
                }
            }
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        let (weight_used, orders_used) = self.usage(&state, now);
        RateLimitSnapshot {
            weight_used,
            weight_limit: self.settings.weight_limit_per_min,
            orders_used,
            orders_limit: self.settings.order_limit_per_min,
            queued: state.queues.iter().map(|q| q.len()).sum(),
        }
    }

    /// Background pump: drains queues as the window slides and logs usage
    /// once a minute.
    pub fn spawn_drainer(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut drain_tick = tokio::time::interval(Duration::from_millis(100));
            let mut status_tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = drain_tick.tick() => governor.drain(),
                    _ = status_tick.tick() => {
                        let snap = governor.snapshot();
                        if snap.weight_used * 2 > snap.weight_limit {
                            warn!(
                                weight = snap.weight_used,
                                limit = snap.weight_limit,
                                queued = snap.queued,
                                "rate budget above 50%"
                            );
                        } else {
                            debug!(
                                weight = snap.weight_used,
                                orders = snap.orders_used,
                                queued = snap.queued,
                                "rate budget"
                            );
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(weight: u32, orders: u32) -> RateLimitSettings {
        RateLimitSettings {
            weight_limit_per_min: weight,
            order_limit_per_min: orders,
            reserve_percent: 20.0,
            queue_timeout_ms: 200,
            queue_capacity: 2,
        }
    }

    #[test]
    fn reserve_band_refuses_low_before_critical() {
        let governor = RateLimitGovernor::new(settings(100, 100));
        // Burn 81 weight: low (cap 80) must refuse, critical (cap 100) still passes.
        governor.record(81, false);
        assert!(!governor.can_make_request(1, false, Priority::Low));
        assert!(governor.can_make_request(1, false, Priority::Critical));
    }

    #[test]
    fn order_budget_tracked_separately() {
        let governor = RateLimitGovernor::new(settings(1000, 2));
        governor.record(1, true);
        governor.record(1, true);
        assert!(governor.can_make_request(1, false, Priority::Critical));
        assert!(!governor.can_make_request(1, true, Priority::Critical));
    }

    #[test]
    fn header_sync_raises_usage_floor() {
        let governor = RateLimitGovernor::new(settings(100, 100));
        governor.record(5, false);
        governor.sync_from_headers(Some(90), None);
        assert!(!governor.can_make_request(5, false, Priority::Low));
        assert_eq!(governor.snapshot().weight_used, 90);
    }

    #[tokio::test]
    async fn queue_rejects_when_full() {
        let governor = RateLimitGovernor::new(settings(10, 10));
        governor.record(10, false);
        // Capacity 2: the third deferred request fails immediately.
        let g1 = Arc::clone(&governor);
        let h1 = tokio::spawn(async move { g1.acquire(1, false, Priority::Low).await });
        let g2 = Arc::clone(&governor);
        let h2 = tokio::spawn(async move { g2.acquire(1, false, Priority::Low).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let third = governor.acquire(1, false, Priority::Low).await;
        assert!(matches!(third, Err(ExchangeError::RateLimit { .. })));
        // The first two eventually time out (nothing drains the queue here).
        assert!(h1.await.unwrap().is_err());
        assert!(h2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn drain_admits_waiter_after_window_slides() {
        let governor =
            RateLimitGovernor::with_window(settings(10, 10), Duration::from_millis(100));
        governor.record(10, false);
        let waiter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.acquire(2, false, Priority::High).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        governor.drain();
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(governor.snapshot().weight_used, 2);
    }
}
