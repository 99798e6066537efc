//! PnL decomposition into funding carry and price basis.
//!
//! For event `i` with effective position `(f, s)` (futures, spot legs):
//!
//! - funding: `-rate[i] * mark[i] * f`
//! - basis: `s * (spot[i] / spot[i-1] - 1) + f * (fut[i] / fut[i-1] - 1)`, zero at `i = 0`
//! - total: funding + basis
//! - cumulative: running sum of total
//!
//! Undefined inputs (missing prices) make the dependent values undefined and
//! the cumulative total stays undefined from that record on. Nothing is
//! imputed here; gap handling belongs to the caller.
//!
//! A zero reference price fails only its own record: the basis is left
//! undefined and the error is returned alongside the records.

use crate::backtest::data::{EnrichedEvent, Market};
use crate::backtest::BacktestError;
use crate::strategy::PositionState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// PnL of one funding period. `None` marks an undefined value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlRecord {
    pub funding_rate_pnl: Option<Decimal>,
    pub basis_pnl: Option<Decimal>,
    pub total_pnl: Option<Decimal>,
    pub cumulative_total_pnl: Option<Decimal>,
}

impl PnlRecord {
    /// True when every component is defined.
    pub fn is_defined(&self) -> bool {
        self.funding_rate_pnl.is_some()
            && self.basis_pnl.is_some()
            && self.total_pnl.is_some()
            && self.cumulative_total_pnl.is_some()
    }
}

/// Funding carry for one period. A short futures leg collects positive funding.
pub fn funding_pnl(
    funding_rate: Decimal,
    mark_price: Option<Decimal>,
    position: PositionState,
) -> Option<Decimal> {
    let mark = mark_price?;
    Some(-funding_rate * mark * Decimal::from(position.futures()))
}

/// Simple return of one market between consecutive events.
fn leg_return(
    events: &[EnrichedEvent],
    index: usize,
    market: Market,
) -> Result<Option<Decimal>, BacktestError> {
    let Some(current) = events[index].price(market) else {
        return Ok(None);
    };
    let Some(previous) = events[index - 1].price(market) else {
        return Ok(None);
    };

    if previous.is_zero() {
        return Err(BacktestError::ZeroReferencePrice { index, market });
    }

    let ratio = current
        .checked_div(previous)
        .ok_or(BacktestError::ZeroReferencePrice { index, market })?;
    Ok(Some(ratio - Decimal::ONE))
}

/// Basis PnL of record `index`.
pub fn basis_pnl(
    events: &[EnrichedEvent],
    index: usize,
    position: PositionState,
) -> Result<Option<Decimal>, BacktestError> {
    if index == 0 {
        // No prior price: both ratios are price[0] / price[0].
        let defined = events
            .first()
            .is_some_and(|event| event.is_fully_aligned());
        return Ok(defined.then_some(Decimal::ZERO));
    }

    let spot = leg_return(events, index, Market::Spot)?;
    let futures = leg_return(events, index, Market::Futures)?;

    Ok(match (spot, futures) {
        (Some(spot), Some(futures)) => Some(
            Decimal::from(position.spot()) * spot + Decimal::from(position.futures()) * futures,
        ),
        _ => None,
    })
}

/// Decomposed records plus the records that could not be computed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decomposition {
    pub records: Vec<PnlRecord>,
    /// One entry per failed record, in record order
    pub failures: Vec<BacktestError>,
}

/// Decompose PnL for every event given the effective (lagged) positions.
pub fn decompose(
    events: &[EnrichedEvent],
    positions: &[PositionState],
) -> Result<Decomposition, BacktestError> {
    if events.len() != positions.len() {
        return Err(BacktestError::LengthMismatch(format!(
            "{} events, {} positions",
            events.len(),
            positions.len()
        )));
    }

    let mut cumulative = Some(Decimal::ZERO);
    let mut records = Vec::with_capacity(events.len());
    let mut failures = Vec::new();

    for (index, (enriched, &position)) in events.iter().zip(positions).enumerate() {
        let funding = funding_pnl(
            enriched.event.funding_rate,
            enriched.event.mark_price,
            position,
        );
        let basis = basis_pnl(events, index, position).unwrap_or_else(|err| {
            failures.push(err);
            None
        });

        let total = match (funding, basis) {
            (Some(funding), Some(basis)) => Some(funding + basis),
            _ => None,
        };
        cumulative = cumulative.zip(total).map(|(c, t)| c + t);

        records.push(PnlRecord {
            funding_rate_pnl: funding,
            basis_pnl: basis,
            total_pnl: total,
            cumulative_total_pnl: cumulative,
        });
    }

    Ok(Decomposition { records, failures })
}
