//! Backtest driver.
//!
//! Runs one symbol's funding events through alignment, gap handling, the
//! position state machine, and PnL decomposition, producing the ledger.

use crate::backtest::align::enrich_events;
use crate::backtest::data::{EnrichedEvent, FundingEvent, PriceIndex};
use crate::backtest::gaps::{apply_gap_policy, GapReport};
use crate::backtest::metrics::BacktestMetrics;
use crate::backtest::pnl::{decompose, PnlRecord};
use crate::backtest::{BacktestConfig, BacktestError};
use crate::strategy::{PositionState, PositionStateMachine};
use crate::utils::time::{datetime_of_millis, format_compact};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// One ledger line: the aligned event, its positions, and its PnL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub enriched: EnrichedEvent,
    /// Position decided from this event's funding rate
    pub raw_position: PositionState,
    /// Position earning this event's PnL (decided one event earlier)
    pub position: PositionState,
    pub pnl: PnlRecord,
    /// Why this record's PnL could not be computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl LedgerRow {
    pub fn funding_time(&self) -> i64 {
        self.enriched.event.funding_time
    }
}

/// Flat CSV layout of a ledger row. Undefined values are written as empty cells.
#[derive(Debug, Serialize)]
struct LedgerCsvRow<'a> {
    symbol: &'a str,
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingTime_str")]
    funding_time_str: String,
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
    #[serde(rename = "markPrice")]
    mark_price: Option<Decimal>,
    #[serde(rename = "spotPrice")]
    spot_price: Option<Decimal>,
    #[serde(rename = "spotPriceTimestamp")]
    spot_price_timestamp: Option<i64>,
    #[serde(rename = "futuresPrice")]
    futures_price: Option<Decimal>,
    #[serde(rename = "futuresPriceTimestamp")]
    futures_price_timestamp: Option<i64>,
    futures_position: i8,
    spot_position: i8,
    #[serde(rename = "fundingRatePnL")]
    funding_rate_pnl: Option<Decimal>,
    #[serde(rename = "basisPnL")]
    basis_pnl: Option<Decimal>,
    #[serde(rename = "totalPnL")]
    total_pnl: Option<Decimal>,
    #[serde(rename = "cumulative_totalPnL")]
    cumulative_total_pnl: Option<Decimal>,
}

impl<'a> From<&'a LedgerRow> for LedgerCsvRow<'a> {
    fn from(row: &'a LedgerRow) -> Self {
        let event = &row.enriched.event;
        Self {
            symbol: &event.symbol,
            funding_time: event.funding_time,
            funding_time_str: format_compact(event.funding_time).unwrap_or_default(),
            funding_rate: event.funding_rate,
            mark_price: event.mark_price,
            spot_price: row.enriched.spot_price(),
            spot_price_timestamp: row.enriched.spot_price_timestamp(),
            futures_price: row.enriched.futures_price(),
            futures_price_timestamp: row.enriched.futures_price_timestamp(),
            futures_position: row.position.futures(),
            spot_position: row.position.spot(),
            funding_rate_pnl: row.pnl.funding_rate_pnl,
            basis_pnl: row.pnl.basis_pnl,
            total_pnl: row.pnl.total_pnl,
            cumulative_total_pnl: row.pnl.cumulative_total_pnl,
        }
    }
}

/// Complete result of a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub backtest_config: BacktestConfig,
    pub metrics: BacktestMetrics,
    pub gaps: GapReport,
    /// Empty when `record_ledger` is off
    pub ledger: Vec<LedgerRow>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub events_processed: usize,
}

impl BacktestResult {
    /// Export the ledger to a CSV file.
    pub fn ledger_to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create ledger file: {}", path.display()))?;
        self.write_ledger(file)
    }

    /// Write the ledger as CSV.
    pub fn write_ledger<W: std::io::Write>(&self, output: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(output);
        for row in &self.ledger {
            writer.serialize(LedgerCsvRow::from(row))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Get a summary string.
    pub fn summary(&self) -> String {
        let period = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => format!(
                "{} to {}",
                start.format("%Y-%m-%d %H:%M"),
                end.format("%Y-%m-%d %H:%M")
            ),
            _ => "n/a".to_string(),
        };
        let mut summary = format!(
            "{}\n\nSymbol: {}\nThreshold: {}\nGap Policy: {}\nBacktest Period: {}\nFunding Events: {}",
            self.metrics.summary(),
            self.symbol,
            self.backtest_config.threshold,
            self.backtest_config.gap_policy,
            period,
            self.events_processed,
        );
        if self.gaps.zero_reference_prices > 0 {
            summary.push_str(&format!(
                "\nFailed Records: {} (zero reference price)",
                self.gaps.zero_reference_prices
            ));
        }
        summary
    }
}

/// Check the funding-event preconditions: one symbol, strictly increasing times.
pub fn validate_events(events: &[FundingEvent]) -> Result<(), BacktestError> {
    let Some(first) = events.first() else {
        return Ok(());
    };

    for (index, pair) in events.windows(2).enumerate() {
        let (prev, cur) = (&pair[0], &pair[1]);
        let index = index + 1;

        if cur.symbol != first.symbol {
            return Err(BacktestError::MixedSymbols {
                index,
                expected: first.symbol.clone(),
                found: cur.symbol.clone(),
            });
        }
        if cur.funding_time == prev.funding_time {
            return Err(BacktestError::DuplicateFundingTime {
                index,
                funding_time: cur.funding_time,
            });
        }
        if cur.funding_time < prev.funding_time {
            return Err(BacktestError::NonMonotonicFundingTime {
                index,
                previous: prev.funding_time,
                current: cur.funding_time,
            });
        }
    }

    Ok(())
}

/// The backtest driver for one symbol.
#[derive(Debug, Clone)]
pub struct BacktestEngine {
    backtest_config: BacktestConfig,
    state_machine: PositionStateMachine,
}

impl BacktestEngine {
    /// Create a new backtest engine.
    pub fn new(backtest_config: BacktestConfig) -> Result<Self, BacktestError> {
        let state_machine = PositionStateMachine::new(backtest_config.threshold)?;
        Ok(Self {
            backtest_config,
            state_machine,
        })
    }

    /// Align `events` against both price indices and run the backtest.
    pub fn run(
        &self,
        events: &[FundingEvent],
        spot: &PriceIndex,
        futures: &PriceIndex,
    ) -> Result<BacktestResult, BacktestError> {
        validate_events(events)?;

        info!(
            "Aligning {} funding events against {} spot / {} futures samples",
            events.len(),
            spot.len(),
            futures.len()
        );
        let enriched = enrich_events(events, spot, futures);

        self.run_enriched(enriched)
    }

    /// Run the backtest on events that already carry aligned prices.
    pub fn run_enriched(
        &self,
        enriched: Vec<EnrichedEvent>,
    ) -> Result<BacktestResult, BacktestError> {
        let funding_events: Vec<FundingEvent> = enriched.iter().map(|e| e.event.clone()).collect();
        validate_events(&funding_events)?;

        let symbol = enriched
            .first()
            .map(|e| e.event.symbol.clone())
            .unwrap_or_default();

        let (enriched, mut gaps) = apply_gap_policy(enriched, self.backtest_config.gap_policy)?;

        let series = self
            .state_machine
            .run(enriched.iter().map(|e| e.event.funding_rate));
        let decomposition = decompose(&enriched, &series.effective)?;

        let mut ledger: Vec<LedgerRow> = enriched
            .into_iter()
            .zip(series.raw)
            .zip(series.effective)
            .zip(decomposition.records)
            .map(|(((enriched, raw_position), position), pnl)| LedgerRow {
                enriched,
                raw_position,
                position,
                pnl,
                failure: None,
            })
            .collect();

        for failure in decomposition.failures {
            warn!("Record failed: {}", failure);
            if let BacktestError::ZeroReferencePrice { index, .. } = &failure {
                gaps.zero_reference_prices += 1;
                if let Some(row) = ledger.get_mut(*index) {
                    row.failure = Some(failure.to_string());
                }
            }
        }

        if let Some(row) = ledger.iter().find(|r| r.pnl.cumulative_total_pnl.is_none()) {
            warn!(
                "Cumulative PnL undefined from funding time {} on",
                row.funding_time()
            );
        }

        let metrics = BacktestMetrics::calculate(&ledger);
        debug!(
            "Threshold {}: cumulative={:?} entries={}",
            self.backtest_config.threshold, metrics.cumulative_pnl, metrics.positions.entries
        );

        let start_time = ledger.first().and_then(|r| datetime_of_millis(r.funding_time()));
        let end_time = ledger.last().and_then(|r| datetime_of_millis(r.funding_time()));
        let events_processed = ledger.len();

        info!(
            "Backtest complete for {}: {} events, cumulative PnL {}",
            if symbol.is_empty() { "<empty>" } else { symbol.as_str() },
            events_processed,
            metrics
                .cumulative_pnl
                .map(|p| p.round_dp(8).to_string())
                .unwrap_or_else(|| "undefined".to_string())
        );

        Ok(BacktestResult {
            symbol,
            backtest_config: self.backtest_config.clone(),
            metrics,
            gaps,
            ledger: if self.backtest_config.record_ledger {
                ledger
            } else {
                Vec::new()
            },
            start_time,
            end_time,
            events_processed,
        })
    }
}
