//! # Funding Arb Backtest
//!
//! Backtester for a delta-neutral funding-rate arbitrage on Binance: hold
//! spot against an opposite perpetual futures leg whenever the funding rate
//! clears a threshold, and account for funding carry and basis moves.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Funding history and market-data archive retrieval
//! - `backtest`: Time alignment, PnL decomposition, driver and threshold sweeps
//! - `strategy`: Position state machine with threshold hysteresis
//! - `persistence`: SQLite run history
//! - `utils`: Time and decimal helpers

pub mod backtest;
pub mod config;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
