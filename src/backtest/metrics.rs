//! Performance metrics for a backtest ledger.
//!
//! Computed over the defined prefix of the ledger, i.e. up to the first
//! record whose cumulative PnL is undefined.

use crate::backtest::engine::LedgerRow;
use crate::strategy::{PositionState, PositionStats};
use crate::utils::decimal::{from_f64, safe_div, to_f64};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const MILLIS_PER_YEAR: f64 = 365.0 * 86_400_000.0;

/// Backtest performance metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    /// Number of funding events in the ledger
    pub events: usize,
    /// Records whose cumulative PnL is defined
    pub defined_records: usize,
    /// First record with an undefined cumulative PnL
    pub first_undefined_index: Option<usize>,

    // PnL
    /// Sum of defined funding-rate PnL values
    pub total_funding_pnl: Decimal,
    /// Sum of defined basis PnL values
    pub total_basis_pnl: Decimal,
    /// Final cumulative total PnL, undefined if any record was
    pub cumulative_pnl: Option<Decimal>,

    // Risk
    /// Largest peak-to-trough fall of the cumulative PnL
    pub max_drawdown: Decimal,
    /// Duration of maximum drawdown in hours
    pub max_drawdown_duration_hours: i64,
    /// Annualized standard deviation of per-period total PnL
    pub volatility: Decimal,
    /// Sharpe ratio of per-period total PnL (0 risk-free rate)
    pub sharpe_ratio: Decimal,

    // Activity
    pub positions: PositionStats,
    /// Share of invested periods with positive total PnL, in percent
    pub win_rate: Decimal,

    /// Span between first and last funding event in days
    pub duration_days: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from a ledger.
    pub fn calculate(ledger: &[LedgerRow]) -> Self {
        if ledger.is_empty() {
            return Self::empty();
        }

        let positions: Vec<PositionState> = ledger.iter().map(|r| r.position).collect();

        let first_undefined_index = ledger
            .iter()
            .position(|r| r.pnl.cumulative_total_pnl.is_none());
        let defined = &ledger[..first_undefined_index.unwrap_or(ledger.len())];

        let total_funding_pnl = ledger.iter().filter_map(|r| r.pnl.funding_rate_pnl).sum();
        let total_basis_pnl = ledger.iter().filter_map(|r| r.pnl.basis_pnl).sum();
        let cumulative_pnl = ledger.last().and_then(|r| r.pnl.cumulative_total_pnl);

        let span_millis = defined
            .last()
            .zip(defined.first())
            .map(|(last, first)| last.funding_time() - first.funding_time())
            .unwrap_or(0);
        let duration_years = span_millis as f64 / MILLIS_PER_YEAR;

        let (max_drawdown, max_drawdown_duration_hours) = calculate_max_drawdown(defined);
        let period_pnl: Vec<Decimal> = defined.iter().filter_map(|r| r.pnl.total_pnl).collect();

        let invested: Vec<Decimal> = ledger
            .iter()
            .filter(|r| !r.position.is_flat())
            .filter_map(|r| r.pnl.total_pnl)
            .collect();
        let wins = invested.iter().filter(|p| **p > Decimal::ZERO).count();
        let win_rate = safe_div(Decimal::from(wins), Decimal::from(invested.len())) * dec!(100);

        let full_span = ledger[ledger.len() - 1].funding_time() - ledger[0].funding_time();

        Self {
            events: ledger.len(),
            defined_records: defined.len(),
            first_undefined_index,
            total_funding_pnl,
            total_basis_pnl,
            cumulative_pnl,
            max_drawdown,
            max_drawdown_duration_hours,
            volatility: calculate_volatility(&period_pnl, duration_years),
            sharpe_ratio: calculate_sharpe(&period_pnl, duration_years),
            positions: PositionStats::from_positions(&positions),
            win_rate,
            duration_days: full_span as f64 / 86_400_000.0,
        }
    }

    /// Create empty metrics.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Format metrics as a summary string.
    pub fn summary(&self) -> String {
        let cumulative = self
            .cumulative_pnl
            .map(|p| format!("{:.6}", p))
            .unwrap_or_else(|| "undefined".to_string());
        let undefined_from = self
            .first_undefined_index
            .map(|i| format!("record {}", i))
            .unwrap_or_else(|| "none".to_string());

        format!(
            r#"═══════════════════════════════════════════════
BACKTEST RESULTS ({:.1} days)
═══════════════════════════════════════════════
PNL
  Funding PnL:       {:.6}
  Basis PnL:         {:.6}
  Cumulative PnL:    {}
  Undefined From:    {}

RISK
  Max Drawdown:      {:.6}
  DD Duration:       {}h
  Volatility:        {:.4}
  Sharpe Ratio:      {:.3}

ACTIVITY
  Events:            {}
  Short Futures:     {} periods
  Long Futures:      {} periods
  Flat:              {} periods
  Entries / Exits:   {} / {}
  Win Rate:          {:.1}%
═══════════════════════════════════════════════"#,
            self.duration_days,
            self.total_funding_pnl,
            self.total_basis_pnl,
            cumulative,
            undefined_from,
            self.max_drawdown,
            self.max_drawdown_duration_hours,
            self.volatility,
            self.sharpe_ratio,
            self.events,
            self.positions.short_futures_periods,
            self.positions.long_futures_periods,
            self.positions.flat_periods,
            self.positions.entries,
            self.positions.exits,
            self.win_rate,
        )
    }
}

/// Maximum drawdown of the cumulative PnL and its duration in hours.
///
/// The series starts from a zero peak, so an initial loss counts as drawdown.
fn calculate_max_drawdown(ledger: &[LedgerRow]) -> (Decimal, i64) {
    let Some(first) = ledger.first() else {
        return (Decimal::ZERO, 0);
    };

    let mut peak = Decimal::ZERO;
    let mut peak_time = first.funding_time();
    let mut max_dd = Decimal::ZERO;
    let mut max_dd_duration = 0;

    for row in ledger {
        let Some(cumulative) = row.pnl.cumulative_total_pnl else {
            break;
        };

        if cumulative >= peak {
            peak = cumulative;
            peak_time = row.funding_time();
            continue;
        }

        let dd = peak - cumulative;
        if dd > max_dd {
            max_dd = dd;
        }
        let hours = Duration::milliseconds(row.funding_time() - peak_time).num_hours();
        if hours > max_dd_duration {
            max_dd_duration = hours;
        }
    }

    (max_dd, max_dd_duration)
}

fn mean_and_std(values: &[Decimal]) -> (f64, f64) {
    let values: Vec<f64> = values.iter().map(|v| to_f64(*v)).collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Annualized volatility of per-period PnL.
fn calculate_volatility(period_pnl: &[Decimal], duration_years: f64) -> Decimal {
    if period_pnl.len() < 2 || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let (_, std_dev) = mean_and_std(period_pnl);
    let periods_per_year = period_pnl.len() as f64 / duration_years;
    from_f64(std_dev * periods_per_year.sqrt())
}

/// Sharpe ratio of per-period PnL (assuming 0 risk-free rate).
fn calculate_sharpe(period_pnl: &[Decimal], duration_years: f64) -> Decimal {
    if period_pnl.is_empty() || duration_years <= 0.0 {
        return Decimal::ZERO;
    }

    let (mean, std_dev) = mean_and_std(period_pnl);
    if std_dev < 1e-12 {
        return Decimal::ZERO;
    }

    let periods_per_year = period_pnl.len() as f64 / duration_years;
    from_f64(mean * periods_per_year / (std_dev * periods_per_year.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::data::{EnrichedEvent, FundingEvent};
    use crate::backtest::pnl::PnlRecord;

    const PERIOD: i64 = 8 * 3_600_000;

    fn row(
        i: i64,
        position: PositionState,
        total: Option<Decimal>,
        cumulative: Option<Decimal>,
    ) -> LedgerRow {
        LedgerRow {
            enriched: EnrichedEvent {
                event: FundingEvent::new("BTCUSDT", 1759276800000 + i * PERIOD, dec!(0.0001)),
                spot: None,
                futures: None,
            },
            raw_position: position,
            position,
            pnl: PnlRecord {
                funding_rate_pnl: total,
                basis_pnl: total.map(|_| Decimal::ZERO),
                total_pnl: total,
                cumulative_total_pnl: cumulative,
            },
            failure: None,
        }
    }

    fn ledger_from_totals(totals: &[Decimal]) -> Vec<LedgerRow> {
        let mut cumulative = Decimal::ZERO;
        totals
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                cumulative += t;
                let position = if i == 0 {
                    PositionState::Flat
                } else {
                    PositionState::ShortFuturesLongSpot
                };
                row(i as i64, position, Some(t), Some(cumulative))
            })
            .collect()
    }

    #[test]
    fn test_empty_ledger() {
        let metrics = BacktestMetrics::calculate(&[]);
        assert_eq!(metrics.events, 0);
        assert_eq!(metrics.cumulative_pnl, None);
        assert_eq!(metrics.sharpe_ratio, Decimal::ZERO);
    }

    #[test]
    fn test_max_drawdown_calculation() {
        // Cumulative: 0, 5, 2, 1, 7
        let ledger = ledger_from_totals(&[dec!(0), dec!(5), dec!(-3), dec!(-1), dec!(6)]);
        let (max_dd, duration) = calculate_max_drawdown(&ledger);

        assert_eq!(max_dd, dec!(4));
        // Peak at record 1, trough still below peak at record 3: two periods
        assert_eq!(duration, 16);
    }

    #[test]
    fn test_initial_loss_is_drawdown() {
        let ledger = ledger_from_totals(&[dec!(-2), dec!(1)]);
        let (max_dd, _) = calculate_max_drawdown(&ledger);
        assert_eq!(max_dd, dec!(2));
    }

    #[test]
    fn test_totals_and_win_rate() {
        let ledger = ledger_from_totals(&[dec!(0), dec!(2), dec!(-1), dec!(3)]);
        let metrics = BacktestMetrics::calculate(&ledger);

        assert_eq!(metrics.total_funding_pnl, dec!(4));
        assert_eq!(metrics.total_basis_pnl, dec!(0));
        assert_eq!(metrics.cumulative_pnl, Some(dec!(4)));
        assert_eq!(metrics.defined_records, 4);
        assert_eq!(metrics.first_undefined_index, None);
        // 2 of 3 invested periods profitable
        assert!(metrics.win_rate > dec!(66) && metrics.win_rate < dec!(67));
        assert_eq!(metrics.positions.short_futures_periods, 3);
        assert_eq!(metrics.positions.entries, 1);
        assert!(metrics.sharpe_ratio > Decimal::ZERO);
        assert_eq!(metrics.duration_days, 1.0);
    }

    #[test]
    fn test_undefined_suffix_is_excluded() {
        let ledger = vec![
            row(0, PositionState::Flat, Some(dec!(0)), Some(dec!(0))),
            row(1, PositionState::Flat, Some(dec!(-3)), Some(dec!(-3))),
            row(2, PositionState::Flat, None, None),
            row(3, PositionState::Flat, Some(dec!(-10)), None),
        ];
        let metrics = BacktestMetrics::calculate(&ledger);

        assert_eq!(metrics.first_undefined_index, Some(2));
        assert_eq!(metrics.defined_records, 2);
        assert_eq!(metrics.cumulative_pnl, None);
        assert_eq!(metrics.max_drawdown, dec!(3));
        // Defined values still contribute to the component totals
        assert_eq!(metrics.total_funding_pnl, dec!(-13));
    }

    #[test]
    fn test_metrics_summary() {
        let ledger = ledger_from_totals(&[dec!(0), dec!(1.5)]);
        let summary = BacktestMetrics::calculate(&ledger).summary();

        assert!(summary.contains("Cumulative PnL:    1.500000"));
        assert!(summary.contains("Sharpe"));
        assert!(summary.contains("Undefined From:    none"));
    }
}
