//! Symbol catalog.
//!
//! Caches per-symbol trading filters from the instrument-metadata endpoint
//! and formats prices/quantities against them. Rounding always reduces
//! exposure: quantities and prices floor to their step. Unknown symbols fall
//! back to configured defaults unless the fallback is disabled.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::{ExchangeError, ExchangeResult};
use crate::exchange::client::ExchangeClient;
use crate::exchange::types::SymbolInfo;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilter {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub min_notional: f64,
    pub price_scale: u32,
    pub qty_scale: u32,
}

impl Default for SymbolFilter {
    fn default() -> Self {
        // Conservative venue-wide fallbacks.
        Self {
            tick_size: 0.0001,
            step_size: 0.001,
            min_qty: 0.001,
            min_notional: 5.0,
            price_scale: 4,
            qty_scale: 3,
        }
    }
}

impl SymbolFilter {
    fn from_info(info: &SymbolInfo) -> SymbolFilter {
        let mut filter = SymbolFilter {
            price_scale: info.price_precision,
            qty_scale: info.quantity_precision,
            ..SymbolFilter::default()
        };
        for raw in &info.filters {
            match raw.filter_type.as_str() {
                "PRICE_FILTER" => {
                    if let Some(tick) = raw.tick_size.filter(|t| *t > 0.0) {
                        filter.tick_size = tick;
                    }
                }
                "LOT_SIZE" | "MARKET_LOT_SIZE" => {
                    if let Some(step) = raw.step_size.filter(|s| *s > 0.0) {
                        filter.step_size = step;
                    }
                    if let Some(min) = raw.min_qty.filter(|q| *q > 0.0) {
                        filter.min_qty = min;
                    }
                }
                "MIN_NOTIONAL" | "NOTIONAL" => {
                    if let Some(min) = raw.notional.or(raw.min_notional).filter(|n| *n > 0.0) {
                        filter.min_notional = min;
                    }
                }
                _ => {}
            }
        }
        filter
    }
}

/// Outcome of the pre-order filter check.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Ok,
    /// Inputs were bumped to satisfy venue minimums.
    Adjusted { price: f64, quantity: f64 },
    Rejected(String),
}

pub struct SymbolCatalog {
    filters: RwLock<HashMap<String, SymbolFilter>>,
    fallback: Option<SymbolFilter>,
    client: Option<Arc<ExchangeClient>>,
}

impl SymbolCatalog {
    pub fn new(client: Arc<ExchangeClient>) -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
            fallback: Some(SymbolFilter::default()),
            client: Some(client),
        }
    }

    /// Offline catalog for tests and the backtester.
    pub fn with_static(filters: HashMap<String, SymbolFilter>, fallback: Option<SymbolFilter>) -> Self {
        Self {
            filters: RwLock::new(filters),
            fallback,
            client: None,
        }
    }

    /// Fetch the full instrument list and rebuild the cache. Called at start
    /// and on reconnect; filters are immutable between refreshes.
    pub async fn load(&self) -> ExchangeResult<usize> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ExchangeError::DataIntegrity("catalog has no client".to_string()))?;
        let info = client.exchange_info().await?;
        let mut filters = self.filters.write();
        filters.clear();
        for symbol in &info.symbols {
            filters.insert(symbol.symbol.clone(), SymbolFilter::from_info(symbol));
        }
        info!(symbols = filters.len(), "symbol filters loaded");
        Ok(filters.len())
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolFilter> {
        self.filters.read().get(symbol).copied()
    }

    pub fn len(&self) -> usize {
        self.filters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.read().is_empty()
    }

    /// Resolve a filter, refreshing the cache once for an unknown symbol
    /// before falling back.
    pub async fn ensure(&self, symbol: &str) -> ExchangeResult<SymbolFilter> {
        if let Some(filter) = self.get(symbol) {
            return Ok(filter);
        }
        if self.client.is_some() {
            debug!(symbol = %symbol, "symbol missing from catalog, refreshing");
            self.load().await?;
            if let Some(filter) = self.get(symbol) {
                return Ok(filter);
            }
        }
        self.fallback
            .ok_or_else(|| ExchangeError::SymbolUnknown(symbol.to_string()))
    }

    fn resolve(&self, symbol: &str) -> SymbolFilter {
        self.get(symbol)
            .or(self.fallback)
            .unwrap_or_default()
    }

    /// Floor to tick size, clipped to the price scale.
    pub fn format_price(&self, symbol: &str, raw: f64) -> f64 {
        let filter = self.resolve(symbol);
        clip_scale(floor_to_step(raw, filter.tick_size), filter.price_scale)
    }

    /// Floor to step size, clipped to the quantity scale.
    pub fn format_quantity(&self, symbol: &str, raw: f64) -> f64 {
        let filter = self.resolve(symbol);
        clip_scale(floor_to_step(raw, filter.step_size), filter.qty_scale)
    }

    /// Enforce min-notional and min-quantity, bumping upward when feasible.
    pub fn validate(&self, symbol: &str, price: f64, quantity: f64) -> Validation {
        let filter = self.resolve(symbol);
        if price <= 0.0 {
            return Validation::Rejected("non-positive price".to_string());
        }
        if quantity <= 0.0 {
            return Validation::Rejected("non-positive quantity".to_string());
        }

        let mut qty = quantity;
        let mut adjusted = false;

        if qty < filter.min_qty {
            qty = filter.min_qty;
            adjusted = true;
        }
        if price * qty < filter.min_notional {
            qty = clip_scale(ceil_to_step(filter.min_notional / price, filter.step_size), filter.qty_scale);
            adjusted = true;
        }
        // The bump itself must still clear the venue floor after rounding.
        if price * qty < filter.min_notional || qty < filter.min_qty {
            return Validation::Rejected(format!(
                "cannot satisfy min notional {} at price {}",
                filter.min_notional, price
            ));
        }

        if adjusted {
            Validation::Adjusted {
                price,
                quantity: qty,
            }
        } else {
            Validation::Ok
        }
    }
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    // Epsilon guards against 0.07/0.01 = 6.999... style float fuzz.
    (value / step + 1e-9).floor() * step
}

fn ceil_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step - 1e-9).ceil() * step
}

fn clip_scale(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (value * factor + 1e-6).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SymbolCatalog {
        let mut filters = HashMap::new();
        filters.insert(
            "BTCUSDT".to_string(),
            SymbolFilter {
                tick_size: 0.1,
                step_size: 0.001,
                min_qty: 0.001,
                min_notional: 100.0,
                price_scale: 1,
                qty_scale: 3,
            },
        );
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
        SymbolCatalog::with_static(filters, Some(SymbolFilter::default()))
    }

    #[test]
    fn price_floors_to_tick() {
        let c = catalog();
        assert_eq!(c.format_price("BTCUSDT", 60_000.17), 60_000.1);
        assert_eq!(c.format_price("ASTERUSDT", 0.99995), 0.9999);
    }

    #[test]
    fn quantity_floors_to_step() {
        let c = catalog();
        assert_eq!(c.format_quantity("BTCUSDT", 0.0129), 0.012);
        assert_eq!(c.format_quantity("ASTERUSDT", 200.7), 200.0);
    }

    #[test]
    fn step_rounding_handles_float_fuzz() {
        let c = catalog();
        // 0.07 is not representable exactly; flooring must not lose a step.
        assert_eq!(c.format_quantity("BTCUSDT", 0.07), 0.07);
        assert_eq!(c.format_price("BTCUSDT", 60_000.1), 60_000.1);
    }

    #[test]
    fn validate_bumps_to_min_notional() {
        let c = catalog();
        // 0.001 BTC at 60k = 60 USDT < 100 min notional.
        match c.validate("BTCUSDT", 60_000.0, 0.001) {
            Validation::Adjusted { quantity, .. } => {
                assert!(quantity * 60_000.0 >= 100.0);
                assert_eq!(quantity, 0.002);
            }
            other => panic!("expected adjustment, got {other:?}"),
        }
    }

    #[test]
    fn validate_passes_clean_order() {
        let c = catalog();
        assert_eq!(c.validate("BTCUSDT", 60_000.0, 0.01), Validation::Ok);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let c = catalog();
        assert!(matches!(
            c.validate("BTCUSDT", 0.0, 1.0),
            Validation::Rejected(_)
        ));
    }

    #[test]
    fn unknown_symbol_uses_fallback_then_errs_without_one() {
        let c = SymbolCatalog::with_static(HashMap::new(), None);
        // No client, no fallback: resolve still formats (default), but ensure errs.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = rt.block_on(c.ensure("NOPEUSDT")).unwrap_err();
        assert!(matches!(err, ExchangeError::SymbolUnknown(_)));

        let with_fallback =
            SymbolCatalog::with_static(HashMap::new(), Some(SymbolFilter::default()));
        let filter = rt.block_on(with_fallback.ensure("NOPEUSDT")).unwrap();
        assert_eq!(filter, SymbolFilter::default());
    }
}
