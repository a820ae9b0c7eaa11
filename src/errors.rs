//! Venue error taxonomy.
//!
//! The exchange reports failures as `{"code": <int>, "msg": "..."}`. Every
//! REST path parses that body into a closed set of kinds so callers can make
//! retry/surface decisions without string matching.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    #[error("rate limit exceeded: {msg}")]
    RateLimit { msg: String },

    #[error("insufficient balance: {msg}")]
    InsufficientBalance { msg: String },

    #[error("order would trigger immediately: {msg}")]
    WouldTriggerImmediately { msg: String },

    #[error("reduce-only order rejected: {msg}")]
    ReduceOnlyRejected { msg: String },

    #[error("position mode mismatch: {msg}")]
    PositionModeMismatch { msg: String },

    #[error("cannot change position mode with open orders/positions: {msg}")]
    PositionModeLocked { msg: String },

    #[error("notional below venue minimum: {msg}")]
    NotionalTooSmall { msg: String },

    #[error("price precision rejected: {msg}")]
    PricePrecision { msg: String },

    #[error("quantity precision rejected: {msg}")]
    QuantityPrecision { msg: String },

    #[error("unknown order: {msg}")]
    UnknownOrder { msg: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("symbol unknown and no fallback filter configured: {0}")]
    SymbolUnknown(String),

    #[error("api error {code}: {msg}")]
    Api { code: i64, msg: String },
}

// Venue error codes the core recognizes.
pub const CODE_RATE_LIMIT: i64 = -1003;
pub const CODE_INSUFFICIENT_BALANCE: i64 = -2010;
pub const CODE_MARGIN_INSUFFICIENT: i64 = -2019;
pub const CODE_UNKNOWN_ORDER: i64 = -2011;
pub const CODE_WOULD_TRIGGER: i64 = -2021;
pub const CODE_REDUCE_ONLY_REJECT: i64 = -2022;
pub const CODE_POSITION_MODE: i64 = -4061;
pub const CODE_NOTIONAL_TOO_SMALL: i64 = -4164;
pub const CODE_MODE_LOCKED_ORDERS: i64 = -5020;
pub const CODE_MODE_LOCKED_POSITIONS: i64 = -5021;
// Precision family: -1111 generic, -4014 price step, -1013 lot size.
pub const CODE_PRECISION: i64 = -1111;
pub const CODE_PRICE_STEP: i64 = -4014;
pub const CODE_LOT_SIZE: i64 = -1013;

impl ExchangeError {
    /// Map a venue `{code, msg}` body onto the taxonomy.
    pub fn from_api(code: i64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            CODE_RATE_LIMIT => ExchangeError::RateLimit { msg },
            CODE_INSUFFICIENT_BALANCE | CODE_MARGIN_INSUFFICIENT => {
                ExchangeError::InsufficientBalance { msg }
            }
            CODE_UNKNOWN_ORDER => ExchangeError::UnknownOrder { msg },
            CODE_WOULD_TRIGGER => ExchangeError::WouldTriggerImmediately { msg },
            CODE_REDUCE_ONLY_REJECT => ExchangeError::ReduceOnlyRejected { msg },
            CODE_POSITION_MODE => ExchangeError::PositionModeMismatch { msg },
            CODE_MODE_LOCKED_ORDERS | CODE_MODE_LOCKED_POSITIONS => {
                ExchangeError::PositionModeLocked { msg }
            }
            CODE_NOTIONAL_TOO_SMALL => ExchangeError::NotionalTooSmall { msg },
            CODE_PRICE_STEP => ExchangeError::PricePrecision { msg },
            CODE_LOT_SIZE => ExchangeError::QuantityPrecision { msg },
            CODE_PRECISION => {
                if msg.to_ascii_lowercase().contains("price") {
                    ExchangeError::PricePrecision { msg }
                } else {
                    ExchangeError::QuantityPrecision { msg }
                }
            }
            _ => ExchangeError::Api { code, msg },
        }
    }

    /// Retried by the REST layer (backoff applies). Everything else bubbles
    /// up to the caller on the first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transport(_) | ExchangeError::RateLimit { .. }
        )
    }

    /// Deterministic rejections: retrying with the same inputs cannot succeed.
    pub fn is_deterministic_reject(&self) -> bool {
        matches!(
            self,
            ExchangeError::NotionalTooSmall { .. }
                | ExchangeError::PricePrecision { .. }
                | ExchangeError::QuantityPrecision { .. }
        )
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_to_kinds() {
        assert!(matches!(
            ExchangeError::from_api(-1003, "too many requests"),
            ExchangeError::RateLimit { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-2019, "margin is insufficient"),
            ExchangeError::InsufficientBalance { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-4061, "order's position side does not match"),
            ExchangeError::PositionModeMismatch { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-2021, "would immediately trigger"),
            ExchangeError::WouldTriggerImmediately { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-4164, "notional must be no smaller than 5"),
            ExchangeError::NotionalTooSmall { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-2011, "unknown order sent"),
            ExchangeError::UnknownOrder { .. }
        ));
    }

    #[test]
    fn precision_family_splits_on_message() {
        assert!(matches!(
            ExchangeError::from_api(-1111, "Price not increased by tick size"),
            ExchangeError::PricePrecision { .. }
        ));
        assert!(matches!(
            ExchangeError::from_api(-1111, "Quantity has too much precision"),
            ExchangeError::QuantityPrecision { .. }
        ));
    }

    #[test]
    fn retry_policy_covers_transport_and_rate_limit() {
        assert!(ExchangeError::Transport("timeout".into()).is_retryable());
        assert!(ExchangeError::RateLimit { msg: String::new() }.is_retryable());
        assert!(!ExchangeError::from_api(-2010, "balance").is_retryable());
    }

    #[test]
    fn unknown_code_falls_through_to_api() {
        match ExchangeError::from_api(-9999, "strange") {
            ExchangeError::Api { code, .. } => assert_eq!(code, -9999),
            other => panic!("expected Api, got {other:?}"),
        }
    }
}
