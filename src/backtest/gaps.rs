//! Handling of events that have no aligned price.

use crate::backtest::data::{EnrichedEvent, Market};
use crate::backtest::BacktestError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// What the driver does with events lacking a spot, futures, or mark price.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Leave gaps in place; PnL becomes undefined from the first gap on.
    #[default]
    Propagate,
    /// Reuse the last aligned value of the same series. Leading gaps stay.
    CarryLast,
    /// Drop incomplete events before positions are computed.
    Skip,
    /// Abort the run at the first gap.
    Fail,
}

impl fmt::Display for GapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GapPolicy::Propagate => "propagate",
            GapPolicy::CarryLast => "carry_last",
            GapPolicy::Skip => "skip",
            GapPolicy::Fail => "fail",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for GapPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "propagate" => Ok(GapPolicy::Propagate),
            "carry_last" => Ok(GapPolicy::CarryLast),
            "skip" => Ok(GapPolicy::Skip),
            "fail" => Ok(GapPolicy::Fail),
            other => anyhow::bail!(
                "Unknown gap policy '{}' (expected propagate, carry_last, skip, fail)",
                other
            ),
        }
    }
}

/// Counts of gaps seen and how they were treated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    pub missing_spot: usize,
    pub missing_futures: usize,
    pub missing_mark: usize,
    /// Values replaced by carry-forward
    pub filled: usize,
    /// Events dropped
    pub skipped: usize,
    /// Records whose previous price was zero
    #[serde(default)]
    pub zero_reference_prices: usize,
}

impl GapReport {
    pub fn has_gaps(&self) -> bool {
        self.missing_spot + self.missing_futures + self.missing_mark > 0
    }
}

/// Apply `policy` to aligned events.
pub fn apply_gap_policy(
    events: Vec<EnrichedEvent>,
    policy: GapPolicy,
) -> Result<(Vec<EnrichedEvent>, GapReport), BacktestError> {
    let mut report = GapReport::default();
    for event in &events {
        report.missing_spot += usize::from(event.spot.is_none());
        report.missing_futures += usize::from(event.futures.is_none());
        report.missing_mark += usize::from(event.event.mark_price.is_none());
    }

    let events = match policy {
        GapPolicy::Propagate => events,
        GapPolicy::Fail => {
            if let Some(err) = first_gap(&events) {
                return Err(err);
            }
            events
        }
        GapPolicy::Skip => {
            let before = events.len();
            let kept: Vec<EnrichedEvent> = events
                .into_iter()
                .filter(|e| e.is_fully_aligned() && e.event.mark_price.is_some())
                .collect();
            report.skipped = before - kept.len();
            kept
        }
        GapPolicy::CarryLast => {
            let mut events = events;
            let mut last_spot = None;
            let mut last_futures = None;
            let mut last_mark = None;

            for event in &mut events {
                carry(&mut event.spot, &mut last_spot, &mut report.filled);
                carry(&mut event.futures, &mut last_futures, &mut report.filled);
                carry(&mut event.event.mark_price, &mut last_mark, &mut report.filled);
            }
            events
        }
    };

    if report.has_gaps() {
        warn!(
            "Gaps under {} policy: spot={} futures={} mark={} filled={} skipped={}",
            policy,
            report.missing_spot,
            report.missing_futures,
            report.missing_mark,
            report.filled,
            report.skipped
        );
    }

    Ok((events, report))
}

fn carry<T: Copy>(slot: &mut Option<T>, last: &mut Option<T>, filled: &mut usize) {
    if let Some(value) = *slot {
        *last = Some(value);
    } else if last.is_some() {
        *slot = *last;
        *filled += 1;
    }
}

fn first_gap(events: &[EnrichedEvent]) -> Option<BacktestError> {
    events.iter().enumerate().find_map(|(index, e)| {
        let funding_time = e.event.funding_time;
        if e.spot.is_none() {
            Some(BacktestError::MissingPrice {
                index,
                funding_time,
                market: Market::Spot,
            })
        } else if e.futures.is_none() {
            Some(BacktestError::MissingPrice {
                index,
                funding_time,
                market: Market::Futures,
            })
        } else if e.event.mark_price.is_none() {
            Some(BacktestError::MissingMarkPrice {
                index,
                funding_time,
            })
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::data::{FundingEvent, PriceSample};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn event(time: i64, spot: Option<Decimal>, futures: Option<Decimal>) -> EnrichedEvent {
        EnrichedEvent {
            event: FundingEvent::new("BTCUSDT", time, dec!(0.0001)).with_mark_price(dec!(100)),
            spot: spot.map(|price| PriceSample {
                timestamp: time,
                price,
                market: Market::Spot,
            }),
            futures: futures.map(|price| PriceSample {
                timestamp: time,
                price,
                market: Market::Futures,
            }),
        }
    }

    fn gappy() -> Vec<EnrichedEvent> {
        vec![
            event(1, None, Some(dec!(10))),
            event(2, Some(dec!(20)), Some(dec!(21))),
            event(3, None, None),
            event(4, Some(dec!(40)), Some(dec!(41))),
        ]
    }

    #[test]
    fn test_propagate_leaves_events_untouched() {
        let (events, report) = apply_gap_policy(gappy(), GapPolicy::Propagate).unwrap();
        assert_eq!(events, gappy());
        assert_eq!(report.missing_spot, 2);
        assert_eq!(report.missing_futures, 1);
        assert_eq!(report.filled, 0);
    }

    #[test]
    fn test_carry_last_fills_from_previous_sample() {
        let (events, report) = apply_gap_policy(gappy(), GapPolicy::CarryLast).unwrap();

        // Leading gap has nothing to carry
        assert!(events[0].spot.is_none());
        assert_eq!(events[2].spot_price(), Some(dec!(20)));
        assert_eq!(events[2].spot_price_timestamp(), Some(2));
        assert_eq!(events[2].futures_price(), Some(dec!(21)));
        assert_eq!(report.filled, 2);
    }

    #[test]
    fn test_skip_drops_incomplete_events() {
        let (events, report) = apply_gap_policy(gappy(), GapPolicy::Skip).unwrap();
        let times: Vec<i64> = events.iter().map(|e| e.event.funding_time).collect();
        assert_eq!(times, vec![2, 4]);
        assert_eq!(report.skipped, 2);
    }

    #[test]
    fn test_fail_names_first_gap() {
        let err = apply_gap_policy(gappy(), GapPolicy::Fail).unwrap_err();
        assert_eq!(
            err,
            BacktestError::MissingPrice {
                index: 0,
                funding_time: 1,
                market: Market::Spot
            }
        );
    }

    #[test]
    fn test_fail_passes_complete_data() {
        let complete = vec![event(1, Some(dec!(1)), Some(dec!(1)))];
        let (events, report) = apply_gap_policy(complete, GapPolicy::Fail).unwrap();
        assert_eq!(events.len(), 1);
        assert!(!report.has_gaps());
    }

    #[test]
    fn test_parse_gap_policy() {
        assert_eq!("carry-last".parse::<GapPolicy>().unwrap(), GapPolicy::CarryLast);
        assert_eq!("FAIL".parse::<GapPolicy>().unwrap(), GapPolicy::Fail);
        assert!("impute".parse::<GapPolicy>().is_err());
        assert_eq!(GapPolicy::default().to_string(), "propagate");
    }
}
