//! Local persistence: market data (liquidations, candle cache) and
//! operational state (follower wallets, error log).

pub mod liquidations;
pub mod operational;

pub use liquidations::{spawn_writer, LiquidationSink, LiquidationStats, LiquidationStore};
pub use operational::{
    FollowerPosition, FollowerPositionStatus, FollowerWallet, OperationalStore,
};
