//! Trading strategy logic.
//!
//! Contains the hedge position state machine that turns a funding-rate series
//! into raw and lagged position series.

mod position;

pub use position::{
    lag_positions, raw_positions, PositionSeries, PositionState, PositionStateMachine,
    PositionStats,
};
