//! Hedge position state machine.
//!
//! Each funding event yields a raw position decision: enter a hedge when the
//! rate crosses the threshold, hold it while a sub-threshold rate keeps the
//! same sign, flatten otherwise. The position that actually earns PnL at an
//! event is the one decided at the previous event.

use crate::backtest::BacktestError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hedge held across one funding period.
///
/// Futures and spot legs are always exact opposites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    /// (0, 0)
    #[default]
    Flat,
    /// (-1, +1): collect positive funding
    ShortFuturesLongSpot,
    /// (+1, -1): collect negative funding
    LongFuturesShortSpot,
}

impl PositionState {
    /// Futures leg, in {-1, 0, 1}.
    pub fn futures(self) -> i8 {
        match self {
            PositionState::Flat => 0,
            PositionState::ShortFuturesLongSpot => -1,
            PositionState::LongFuturesShortSpot => 1,
        }
    }

    /// Spot leg, always the negation of the futures leg.
    pub fn spot(self) -> i8 {
        -self.futures()
    }

    pub fn is_flat(self) -> bool {
        self == PositionState::Flat
    }

    /// Decide the raw position for one event.
    ///
    /// `self` is the raw position decided at the previous event.
    pub fn next(self, funding_rate: Decimal, threshold: Decimal, is_first_event: bool) -> Self {
        if is_first_event {
            return PositionState::Flat;
        }

        if funding_rate >= threshold {
            return PositionState::ShortFuturesLongSpot;
        }
        if funding_rate <= -threshold {
            return PositionState::LongFuturesShortSpot;
        }

        // |rate| < threshold: hysteresis band
        if funding_rate.is_zero() {
            return self;
        }
        match self {
            PositionState::ShortFuturesLongSpot if funding_rate > Decimal::ZERO => self,
            PositionState::LongFuturesShortSpot if funding_rate < Decimal::ZERO => self,
            _ => PositionState::Flat,
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::Flat => write!(f, "flat"),
            PositionState::ShortFuturesLongSpot => write!(f, "short_futures_long_spot"),
            PositionState::LongFuturesShortSpot => write!(f, "long_futures_short_spot"),
        }
    }
}

/// Raw decisions and the lagged positions derived from them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSeries {
    /// Position decided at each event
    pub raw: Vec<PositionState>,
    /// Position earning PnL at each event (`raw` shifted by one, `Flat` first)
    pub effective: Vec<PositionState>,
}

impl PositionSeries {
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Fold a funding-rate series into raw position decisions.
pub fn raw_positions<I>(rates: I, threshold: Decimal) -> Vec<PositionState>
where
    I: IntoIterator<Item = Decimal>,
{
    rates
        .into_iter()
        .enumerate()
        .scan(PositionState::Flat, |prev, (i, rate)| {
            let state = prev.next(rate, threshold, i == 0);
            *prev = state;
            Some(state)
        })
        .collect()
}

/// Shift raw decisions forward by one event; the first effective position is `Flat`.
pub fn lag_positions(raw: &[PositionState]) -> Vec<PositionState> {
    std::iter::once(PositionState::Flat)
        .chain(raw.iter().copied())
        .take(raw.len())
        .collect()
}

/// Converts funding rates into position series for a fixed entry threshold.
#[derive(Debug, Clone, Copy)]
pub struct PositionStateMachine {
    threshold: Decimal,
}

impl PositionStateMachine {
    pub fn new(threshold: Decimal) -> Result<Self, BacktestError> {
        if threshold <= Decimal::ZERO {
            return Err(BacktestError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn run<I>(&self, rates: I) -> PositionSeries
    where
        I: IntoIterator<Item = Decimal>,
    {
        let raw = raw_positions(rates, self.threshold);
        let effective = lag_positions(&raw);
        PositionSeries { raw, effective }
    }
}

/// Occupancy and transition counts of an effective position series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStats {
    pub flat_periods: usize,
    pub short_futures_periods: usize,
    pub long_futures_periods: usize,
    /// Transitions out of `Flat` or flips between hedges
    pub entries: usize,
    /// Transitions into `Flat` or flips between hedges
    pub exits: usize,
}

impl PositionStats {
    pub fn from_positions(positions: &[PositionState]) -> Self {
        let mut stats = Self::default();

        for state in positions {
            match state {
                PositionState::Flat => stats.flat_periods += 1,
                PositionState::ShortFuturesLongSpot => stats.short_futures_periods += 1,
                PositionState::LongFuturesShortSpot => stats.long_futures_periods += 1,
            }
        }

        for pair in positions.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            if prev == next {
                continue;
            }
            if !prev.is_flat() {
                stats.exits += 1;
            }
            if !next.is_flat() {
                stats.entries += 1;
            }
        }

        stats
    }

    pub fn invested_periods(&self) -> usize {
        self.short_futures_periods + self.long_futures_periods
    }
}

#[cfg(test)]
mod tests {
    use super::PositionState::*;
    use super::*;
    use rust_decimal_macros::dec;

    const THRESHOLD: Decimal = dec!(0.0001);

    #[test]
    fn test_first_event_is_always_flat() {
        assert_eq!(Flat.next(dec!(0.01), THRESHOLD, true), Flat);
        assert_eq!(ShortFuturesLongSpot.next(dec!(-0.01), THRESHOLD, true), Flat);
    }

    #[test]
    fn test_threshold_entry() {
        assert_eq!(Flat.next(dec!(0.0001), THRESHOLD, false), ShortFuturesLongSpot);
        assert_eq!(Flat.next(dec!(-0.0001), THRESHOLD, false), LongFuturesShortSpot);
        // Crossing flips an existing hedge directly
        assert_eq!(
            ShortFuturesLongSpot.next(dec!(-0.0002), THRESHOLD, false),
            LongFuturesShortSpot
        );
    }

    #[test]
    fn test_hysteresis_holds_same_sign() {
        assert_eq!(
            ShortFuturesLongSpot.next(dec!(0.00005), THRESHOLD, false),
            ShortFuturesLongSpot
        );
        assert_eq!(
            LongFuturesShortSpot.next(dec!(-0.00005), THRESHOLD, false),
            LongFuturesShortSpot
        );
    }

    #[test]
    fn test_opposite_sign_below_threshold_flattens() {
        assert_eq!(ShortFuturesLongSpot.next(dec!(-0.00002), THRESHOLD, false), Flat);
        assert_eq!(LongFuturesShortSpot.next(dec!(0.00002), THRESHOLD, false), Flat);
        // Flat never enters inside the band
        assert_eq!(Flat.next(dec!(0.00009), THRESHOLD, false), Flat);
    }

    #[test]
    fn test_zero_rate_carries_previous_state() {
        for state in [Flat, ShortFuturesLongSpot, LongFuturesShortSpot] {
            assert_eq!(state.next(Decimal::ZERO, THRESHOLD, false), state);
        }
    }

    #[test]
    fn test_documented_scenario() {
        let rates = [
            dec!(0.00015),
            dec!(0.00015),
            dec!(-0.00002),
            dec!(0.00000),
            dec!(-0.00015),
        ];
        let series = PositionStateMachine::new(THRESHOLD).unwrap().run(rates);

        assert_eq!(series.raw, vec![Flat, ShortFuturesLongSpot, Flat, Flat, LongFuturesShortSpot]);
        let futures: Vec<i8> = series.effective.iter().map(|p| p.futures()).collect();
        assert_eq!(futures, vec![0, 0, -1, 0, 0]);
    }

    #[test]
    fn test_lag_shifts_by_one() {
        let raw = vec![Flat, LongFuturesShortSpot, ShortFuturesLongSpot];
        assert_eq!(lag_positions(&raw), vec![Flat, Flat, LongFuturesShortSpot]);
        assert!(lag_positions(&[]).is_empty());
    }

    #[test]
    fn test_legs_are_opposite() {
        for state in [Flat, ShortFuturesLongSpot, LongFuturesShortSpot] {
            assert_eq!(state.spot(), -state.futures());
            assert!((-1..=1).contains(&state.futures()));
        }
    }

    #[test]
    fn test_effective_position_starts_flat() {
        let series = PositionStateMachine::new(THRESHOLD)
            .unwrap()
            .run([dec!(0.01), dec!(0.01)]);
        assert_eq!(series.effective[0], Flat);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_rejects_non_positive_threshold() {
        assert!(PositionStateMachine::new(Decimal::ZERO).is_err());
        assert!(PositionStateMachine::new(dec!(-0.0001)).is_err());
    }

    #[test]
    fn test_position_stats() {
        let stats = PositionStats::from_positions(&[
            Flat,
            ShortFuturesLongSpot,
            ShortFuturesLongSpot,
            LongFuturesShortSpot,
            Flat,
        ]);

        assert_eq!(stats.flat_periods, 2);
        assert_eq!(stats.short_futures_periods, 2);
        assert_eq!(stats.long_futures_periods, 1);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.exits, 2);
        assert_eq!(stats.invested_periods(), 3);
    }
}
