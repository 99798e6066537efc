//! Errors raised by the backtest core.

use crate::backtest::data::Market;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BacktestError {
    #[error("funding time {current} at index {index} precedes previous funding time {previous}")]
    NonMonotonicFundingTime {
        index: usize,
        previous: i64,
        current: i64,
    },

    #[error("duplicate funding time {funding_time} at index {index}")]
    DuplicateFundingTime { index: usize, funding_time: i64 },

    #[error("event {index} is for {found}, run is for {expected}")]
    MixedSymbols {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("threshold must be positive, got {0}")]
    InvalidThreshold(Decimal),

    #[error("{market} price at index {index} (funding time {funding_time}) is missing")]
    MissingPrice {
        index: usize,
        funding_time: i64,
        market: Market,
    },

    #[error("mark price at index {index} (funding time {funding_time}) is missing")]
    MissingMarkPrice { index: usize, funding_time: i64 },

    #[error("previous {market} price is zero at index {index}, basis return is undefined")]
    ZeroReferencePrice { index: usize, market: Market },

    #[error("input series lengths differ: {0}")]
    LengthMismatch(String),
}
