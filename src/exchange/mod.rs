//! Venue integration: signed REST, rate limiting, symbol filters, price
//! caches, and the WebSocket stream readers.

pub mod client;
pub mod filters;
pub mod price_feed;
pub mod rate_limit;
pub mod streams;
pub mod types;

pub use client::{ExchangeClient, OrderParams, DEFAULT_REST_BASE, DEFAULT_WS_BASE};
pub use filters::{SymbolCatalog, SymbolFilter, Validation};
pub use price_feed::{PriceFeed, VwapReading};
pub use rate_limit::{Priority, RateLimitGovernor, RateLimitSnapshot};
