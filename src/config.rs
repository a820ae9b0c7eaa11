//! Configuration surface.
//!
//! A TOML file supplies the global block and per-symbol overrides; the
//! environment supplies credentials and optimizer tuning. Legacy camelCase
//! keys from older deployments are accepted via serde aliases.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::models::{OrderType, PositionMode, SignalDirection};

/// API credentials, environment-only. Never serialized.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiCredentials {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let api_key = std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY not set")?;
        let api_secret =
            std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET not set")?;
        Ok(Self {
            api_key,
            api_secret,
        })
    }

    /// Paper mode runs without venue credentials.
    pub fn paper() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Request-weight budget per minute.
    pub weight_limit_per_min: u32,
    /// Order-count budget per minute.
    pub order_limit_per_min: u32,
    /// Percent of budget held back for higher priorities.
    pub reserve_percent: f64,
    /// How long a deferred request may wait before failing.
    pub queue_timeout_ms: u64,
    /// Bounded queue capacity per priority.
    pub queue_capacity: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            weight_limit_per_min: 2400,
            order_limit_per_min: 1200,
            reserve_percent: 20.0,
            queue_timeout_ms: 30_000,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyTradeSettings {
    pub enabled: bool,
    /// Upper bound on any follower's position-size multiplier.
    pub max_multiplier: f64,
}

impl Default for CopyTradeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_multiplier: 10.0,
        }
    }
}

/// Carried for the external chat notifier; the core only stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}

/// Carried for the external dashboard; the core only stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub risk_percent: f64,
    #[serde(alias = "paperMode")]
    pub paper_mode: bool,
    #[serde(alias = "positionMode")]
    pub position_mode: PositionMode,
    #[serde(alias = "maxOpenPositions")]
    pub max_open_positions: usize,
    #[serde(alias = "useThresholdSystem")]
    pub use_threshold_system: bool,
    /// Account-level anti-flicker shared across symbols.
    pub hunter_cooldown_ms: i64,
    /// Liquidation retention window for the market-data store.
    pub liquidation_retention_days: i64,
    pub rate_limit: RateLimitSettings,
    pub copy_trading: CopyTradeSettings,
    pub telegram: TelegramSettings,
    pub server: ServerSettings,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            risk_percent: 1.0,
            paper_mode: true,
            position_mode: PositionMode::OneWay,
            max_open_positions: 5,
            use_threshold_system: true,
            hunter_cooldown_ms: 120_000,
            liquidation_retention_days: 7,
            rate_limit: RateLimitSettings::default(),
            copy_trading: CopyTradeSettings::default(),
            telegram: TelegramSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolSettings {
    #[serde(alias = "longVolumeThresholdUSDT")]
    pub long_volume_threshold_usdt: Option<f64>,
    #[serde(alias = "shortVolumeThresholdUSDT")]
    pub short_volume_threshold_usdt: Option<f64>,
    /// Legacy single threshold applied to both directions.
    #[serde(alias = "volumeThresholdUSDT")]
    pub volume_threshold_usdt: f64,
    /// Margin per entry, USDT.
    #[serde(alias = "tradeSize")]
    pub trade_size: f64,
    #[serde(alias = "longTradeSize")]
    pub long_trade_size: Option<f64>,
    #[serde(alias = "shortTradeSize")]
    pub short_trade_size: Option<f64>,
    #[serde(alias = "maxPositionMarginUSDT")]
    pub max_position_margin_usdt: f64,
    pub leverage: u32,
    #[serde(alias = "tpPercent")]
    pub tp_percent: f64,
    #[serde(alias = "slPercent")]
    pub sl_percent: f64,
    #[serde(alias = "orderType")]
    pub order_type: OrderType,
    #[serde(alias = "forceMarketEntry")]
    pub force_market_entry: bool,
    #[serde(alias = "priceOffsetBps")]
    pub price_offset_bps: f64,
    #[serde(alias = "usePostOnly")]
    pub use_post_only: bool,
    #[serde(alias = "maxSlippageBps")]
    pub max_slippage_bps: f64,
    #[serde(alias = "vwapProtection")]
    pub vwap_protection: bool,
    #[serde(alias = "vwapTimeframe")]
    pub vwap_timeframe: String,
    #[serde(alias = "vwapLookback")]
    pub vwap_lookback: u32,
    #[serde(alias = "useThreshold")]
    pub use_threshold: bool,
    #[serde(alias = "thresholdTimeWindow")]
    pub threshold_time_window_ms: i64,
    #[serde(alias = "thresholdCooldown")]
    pub threshold_cooldown_ms: i64,
    #[serde(alias = "maxPositionsPerPair")]
    pub max_positions_per_pair: usize,
    #[serde(alias = "maxLongPositions")]
    pub max_long_positions: Option<usize>,
    #[serde(alias = "maxShortPositions")]
    pub max_short_positions: Option<usize>,
    /// Hedge mode normally caps at one long + one short per symbol; set this
    /// to stack same-direction entries up to `max_positions_per_pair`.
    pub allow_pair_stacking: bool,
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            long_volume_threshold_usdt: None,
            short_volume_threshold_usdt: None,
            volume_threshold_usdt: 10_000.0,
            trade_size: 20.0,
            long_trade_size: None,
            short_trade_size: None,
            max_position_margin_usdt: 100.0,
            leverage: 10,
            tp_percent: 1.0,
            sl_percent: 5.0,
            order_type: OrderType::Limit,
            force_market_entry: false,
            price_offset_bps: 1.0,
            use_post_only: false,
            max_slippage_bps: 50.0,
            vwap_protection: false,
            vwap_timeframe: "1m".to_string(),
            vwap_lookback: 20,
            use_threshold: true,
            threshold_time_window_ms: 60_000,
            threshold_cooldown_ms: 30_000,
            max_positions_per_pair: 1,
            max_long_positions: None,
            max_short_positions: None,
            allow_pair_stacking: false,
        }
    }
}

impl SymbolSettings {
    pub fn threshold_for(&self, direction: SignalDirection) -> f64 {
        match direction {
            SignalDirection::Long => self
                .long_volume_threshold_usdt
                .unwrap_or(self.volume_threshold_usdt),
            SignalDirection::Short => self
                .short_volume_threshold_usdt
                .unwrap_or(self.volume_threshold_usdt),
        }
    }

    /// Margin budget for one entry in the given direction.
    pub fn margin_for(&self, direction: SignalDirection) -> f64 {
        match direction {
            SignalDirection::Long => self.long_trade_size.unwrap_or(self.trade_size),
            SignalDirection::Short => self.short_trade_size.unwrap_or(self.trade_size),
        }
    }

    pub fn direction_cap(&self, direction: SignalDirection) -> usize {
        match direction {
            SignalDirection::Long => self.max_long_positions.unwrap_or(self.max_positions_per_pair),
            SignalDirection::Short => self
                .max_short_positions
                .unwrap_or(self.max_positions_per_pair),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalSettings,
    pub symbols: BTreeMap<String, SymbolSettings>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (symbol, s) in &self.symbols {
            anyhow::ensure!(s.leverage >= 1, "{symbol}: leverage must be >= 1");
            anyhow::ensure!(s.trade_size > 0.0, "{symbol}: trade_size must be positive");
            anyhow::ensure!(
                s.tp_percent > 0.0 && s.sl_percent > 0.0,
                "{symbol}: tp_percent and sl_percent must be positive"
            );
            // Liquidation-distance guard: warn, do not refuse. The optimizer
            // rejects such combinations outright.
            let liq_distance_pct = 100.0 / s.leverage as f64;
            if s.sl_percent >= 0.9 * liq_distance_pct {
                warn!(
                    symbol = %symbol,
                    sl_percent = s.sl_percent,
                    leverage = s.leverage,
                    "stop-loss sits inside 90% of the liquidation distance"
                );
            }
        }
        Ok(())
    }

    /// Field-level differences, as dotted paths. Used to log config updates.
    pub fn diff(&self, other: &Config) -> Vec<String> {
        let a = serde_json::to_value(self).unwrap_or_default();
        let b = serde_json::to_value(other).unwrap_or_default();
        let mut changed = Vec::new();
        diff_values("", &a, &b, &mut changed);
        changed.sort();
        changed
    }
}

fn diff_values(path: &str, a: &serde_json::Value, b: &serde_json::Value, out: &mut Vec<String>) {
    use serde_json::Value;
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            for key in ma.keys().chain(mb.keys()) {
                let sub = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if out.iter().any(|p| *p == sub) {
                    continue;
                }
                match (ma.get(key), mb.get(key)) {
                    (Some(va), Some(vb)) => diff_values(&sub, va, vb, out),
                    _ => out.push(sub),
                }
            }
        }
        _ => {
            if a != b {
                out.push(path.to_string());
            }
        }
    }
}

pub type SharedConfig = Arc<parking_lot::RwLock<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(parking_lot::RwLock::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [global]
        paper_mode = true
        max_open_positions = 3
        position_mode = "hedge"

        [symbols.BTCUSDT]
        longVolumeThresholdUSDT = 15000.0
        volumeThresholdUSDT = 12000.0
        tradeSize = 25.0
        leverage = 20
        tpPercent = 0.8
        slPercent = 2.5

        [symbols.ASTERUSDT]
        volumeThresholdUSDT = 10000.0
    "#;

    #[test]
    fn parses_legacy_camel_case_keys() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.global.position_mode.is_hedge());
        let btc = &config.symbols["BTCUSDT"];
        assert_eq!(btc.leverage, 20);
        assert_eq!(btc.trade_size, 25.0);
        // Long uses the explicit override, short falls back to the legacy key.
        assert_eq!(btc.threshold_for(SignalDirection::Long), 15_000.0);
        assert_eq!(btc.threshold_for(SignalDirection::Short), 12_000.0);
    }

    #[test]
    fn direction_margin_falls_back_to_base() {
        let mut s = SymbolSettings::default();
        s.trade_size = 20.0;
        s.short_trade_size = Some(35.0);
        assert_eq!(s.margin_for(SignalDirection::Long), 20.0);
        assert_eq!(s.margin_for(SignalDirection::Short), 35.0);
    }

    #[test]
    fn diff_reports_dotted_paths() {
        let a: Config = toml::from_str(SAMPLE).unwrap();
        let mut b = a.clone();
        b.global.max_open_positions = 7;
        b.symbols.get_mut("BTCUSDT").unwrap().leverage = 15;
        let changed = a.diff(&b);
        assert!(changed.iter().any(|p| p == "global.max_open_positions"));
        assert!(changed.iter().any(|p| p == "symbols.BTCUSDT.leverage"));
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn validate_rejects_zero_leverage() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.symbols.get_mut("BTCUSDT").unwrap().leverage = 0;
        assert!(config.validate().is_err());
    }
}
