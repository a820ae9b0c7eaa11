//! CascadeBot core library.
//!
//! A liquidation-cascade mean-reversion agent for USDT-M perpetual futures:
//! watches the public forced-order stream, opens counter-trend entries behind
//! a threshold/cooldown/VWAP gate, guards every position with stop-loss and
//! take-profit orders, mirrors master fills to follower wallets, and ships an
//! offline optimizer that replays stored liquidations against cached candles.

pub mod backtest;
pub mod config;
pub mod copytrade;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod hunter;
pub mod models;
pub mod position;
pub mod storage;
