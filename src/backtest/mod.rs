//! Backtesting of the funding-rate hedge on historical data.
//!
//! This module provides:
//! - Funding CSV and day-partitioned price loading (`data`)
//! - Time alignment of funding events to price samples (`align`)
//! - Gap handling for unaligned events (`gaps`)
//! - PnL decomposition into funding and basis (`pnl`)
//! - The backtest driver and ledger export (`engine`)
//! - Performance metrics and threshold sweeps (`metrics`, `runner`)
//!
//! # Example
//!
//! ```rust,ignore
//! use funding_arb_backtest::backtest::{
//!     load_funding_csv, BacktestConfig, BacktestEngine, Market, PriceIndex, SampleFormat,
//!     TimestampUnit,
//! };
//!
//! let events = load_funding_csv("data/BTCUSDT_funding.csv")?;
//! let format = SampleFormat::AggTrades;
//! let spot =
//!     PriceIndex::load_dir("data/spot", Market::Spot, TimestampUnit::Micros, format, None)?;
//! let futures =
//!     PriceIndex::load_dir("data/futures", Market::Futures, TimestampUnit::Millis, format, None)?;
//!
//! let engine = BacktestEngine::new(BacktestConfig::default())?;
//! let result = engine.run(&events, &spot, &futures)?;
//! println!("{}", result.summary());
//! ```

mod align;
mod data;
mod engine;
mod error;
mod gaps;
mod metrics;
mod pnl;
mod runner;

pub use align::{enrich_events, AlignCursor, TimeAligner};
pub use data::{
    load_funding_csv, parse_funding_csv, write_funding_csv, DayPartition, EnrichedEvent,
    FundingEvent, Market, PriceIndex, PriceSample, SampleFormat, TimestampUnit,
};
pub use engine::{validate_events, BacktestEngine, BacktestResult, LedgerRow};
pub use error::BacktestError;
pub use gaps::{apply_gap_policy, GapPolicy, GapReport};
pub use metrics::BacktestMetrics;
pub use pnl::{basis_pnl, decompose, funding_pnl, PnlRecord};
pub use runner::{ParameterSpace, SweepResults, SweepRunner};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Absolute funding rate that opens a hedge
    pub threshold: Decimal,

    /// Treatment of events without an aligned price
    pub gap_policy: GapPolicy,

    /// Whether to keep every ledger row (sweeps usually only need metrics)
    pub record_ledger: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            threshold: dec!(0.0001),
            gap_policy: GapPolicy::Propagate,
            record_ledger: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backtest_config() {
        let config = BacktestConfig::default();
        assert_eq!(config.threshold, dec!(0.0001));
        assert_eq!(config.gap_policy, GapPolicy::Propagate);
        assert!(config.record_ledger);
    }
}
