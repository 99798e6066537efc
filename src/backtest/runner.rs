//! Threshold parameter sweep.
//!
//! Prices are aligned once; every combination then reruns the position state
//! machine and PnL decomposition on its own blocking task, bounded by a
//! semaphore.

use crate::backtest::align::enrich_events;
use crate::backtest::data::{EnrichedEvent, FundingEvent, PriceIndex};
use crate::backtest::engine::validate_events;
use crate::backtest::{BacktestConfig, BacktestEngine, BacktestResult, GapPolicy};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Defines the parameter space to explore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpace {
    pub thresholds: Vec<Decimal>,
    pub gap_policies: Vec<GapPolicy>,
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            thresholds: vec![
                dec!(0.00005),
                dec!(0.0001),
                dec!(0.0002),
                dec!(0.0003),
                dec!(0.0005),
            ],
            gap_policies: vec![GapPolicy::Propagate],
        }
    }
}

impl ParameterSpace {
    /// Create a minimal parameter space for quick testing.
    pub fn minimal() -> Self {
        Self {
            thresholds: vec![dec!(0.0001)],
            gap_policies: vec![GapPolicy::Propagate],
        }
    }

    /// Evenly spaced thresholds from `start` to `end` inclusive.
    pub fn threshold_range(start: Decimal, end: Decimal, step: Decimal) -> Result<Self> {
        anyhow::ensure!(step > Decimal::ZERO, "Sweep step must be positive, got {}", step);
        anyhow::ensure!(start > Decimal::ZERO, "Sweep start must be positive, got {}", start);
        anyhow::ensure!(end >= start, "Sweep end {} is below start {}", end, start);

        let mut thresholds = Vec::new();
        let mut threshold = start;
        while threshold <= end {
            thresholds.push(threshold);
            threshold += step;
        }

        Ok(Self {
            thresholds,
            ..Self::minimal()
        })
    }

    /// Count total number of combinations.
    pub fn combination_count(&self) -> usize {
        self.thresholds.len() * self.gap_policies.len()
    }

    /// Generate all config combinations.
    pub fn generate_configs(&self, base_config: &BacktestConfig) -> Vec<BacktestConfig> {
        let mut configs = Vec::with_capacity(self.combination_count());

        for &threshold in &self.thresholds {
            for &gap_policy in &self.gap_policies {
                configs.push(BacktestConfig {
                    threshold,
                    gap_policy,
                    ..base_config.clone()
                });
            }
        }

        configs
    }

    /// Describe a config's parameter values.
    pub fn describe_config(config: &BacktestConfig) -> String {
        format!(
            "threshold={:.4}% gaps={}",
            config.threshold * dec!(100),
            config.gap_policy
        )
    }
}

#[derive(Debug, Serialize)]
struct SweepCsvRow {
    threshold: Decimal,
    gap_policy: GapPolicy,
    cumulative_pnl: Option<Decimal>,
    funding_pnl: Decimal,
    basis_pnl: Decimal,
    sharpe_ratio: Decimal,
    max_drawdown: Decimal,
    invested_periods: usize,
    entries: usize,
    first_undefined_index: Option<usize>,
}

impl From<&BacktestResult> for SweepCsvRow {
    fn from(result: &BacktestResult) -> Self {
        let metrics = &result.metrics;
        Self {
            threshold: result.backtest_config.threshold,
            gap_policy: result.backtest_config.gap_policy,
            cumulative_pnl: metrics.cumulative_pnl,
            funding_pnl: metrics.total_funding_pnl,
            basis_pnl: metrics.total_basis_pnl,
            sharpe_ratio: metrics.sharpe_ratio,
            max_drawdown: metrics.max_drawdown,
            invested_periods: metrics.positions.invested_periods(),
            entries: metrics.positions.entries,
            first_undefined_index: metrics.first_undefined_index,
        }
    }
}

/// Results from a parameter sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResults {
    /// Successful runs, in combination order
    pub runs: Vec<BacktestResult>,

    /// Best run by Sharpe ratio
    pub best_by_sharpe: Option<usize>,

    /// Best run by final cumulative PnL; runs with undefined PnL never win
    pub best_by_pnl: Option<usize>,

    /// Total combinations tested
    pub total_combinations: usize,

    /// Successful runs
    pub successful_runs: usize,

    /// Failed runs
    pub failed_runs: usize,
}

impl SweepResults {
    fn from_runs(runs: Vec<BacktestResult>, total_combinations: usize, failed_runs: usize) -> Self {
        let best_by_sharpe = runs
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.metrics.sharpe_ratio)
            .map(|(i, _)| i);

        let best_by_pnl = runs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.metrics.cumulative_pnl.map(|pnl| (i, pnl)))
            .max_by_key(|(_, pnl)| *pnl)
            .map(|(i, _)| i);

        Self {
            successful_runs: runs.len(),
            runs,
            best_by_sharpe,
            best_by_pnl,
            total_combinations,
            failed_runs,
        }
    }

    /// Get the best result by Sharpe ratio.
    pub fn best_sharpe(&self) -> Option<&BacktestResult> {
        self.best_by_sharpe.map(|i| &self.runs[i])
    }

    /// Get the best result by cumulative PnL.
    pub fn best_pnl(&self) -> Option<&BacktestResult> {
        self.best_by_pnl.map(|i| &self.runs[i])
    }

    /// Export results to CSV.
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create sweep file: {}", path.display()))?;

        for result in &self.runs {
            writer.serialize(SweepCsvRow::from(result))?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Generate a summary comparison table.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str("PARAMETER SWEEP RESULTS\n");
        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str(&format!(
            "Total: {} | Successful: {} | Failed: {}\n\n",
            self.total_combinations, self.successful_runs, self.failed_runs
        ));

        for result in &self.runs {
            s.push_str(&format!(
                "  {:<32} PnL: {:>14} | Sharpe: {:>8.3} | MaxDD: {:.6}\n",
                ParameterSpace::describe_config(&result.backtest_config),
                describe_pnl(result.metrics.cumulative_pnl),
                result.metrics.sharpe_ratio,
                result.metrics.max_drawdown,
            ));
        }
        s.push('\n');

        if let Some(result) = self.best_sharpe() {
            s.push_str("BEST BY SHARPE RATIO:\n");
            s.push_str(&format!(
                "  Config: {}\n",
                ParameterSpace::describe_config(&result.backtest_config)
            ));
            s.push_str(&format!(
                "  Sharpe: {:.3} | PnL: {}\n\n",
                result.metrics.sharpe_ratio,
                describe_pnl(result.metrics.cumulative_pnl)
            ));
        }

        if let Some(result) = self.best_pnl() {
            s.push_str("BEST BY CUMULATIVE PNL:\n");
            s.push_str(&format!(
                "  Config: {}\n",
                ParameterSpace::describe_config(&result.backtest_config)
            ));
            s.push_str(&format!(
                "  PnL: {} | Sharpe: {:.3}\n",
                describe_pnl(result.metrics.cumulative_pnl),
                result.metrics.sharpe_ratio
            ));
        }

        s.push_str("═══════════════════════════════════════════════════════════════\n");

        s
    }
}

fn describe_pnl(pnl: Option<Decimal>) -> String {
    pnl.map(|p| format!("{:.6}", p))
        .unwrap_or_else(|| "undefined".to_string())
}

/// Parameter sweep runner for parallel backtesting.
pub struct SweepRunner {
    parameter_space: ParameterSpace,
    base_config: BacktestConfig,
    parallelism: usize,
}

impl SweepRunner {
    /// Create a new sweep runner.
    pub fn new(
        parameter_space: ParameterSpace,
        base_config: BacktestConfig,
        parallelism: usize,
    ) -> Self {
        Self {
            parameter_space,
            base_config,
            parallelism: parallelism.max(1),
        }
    }

    /// Align `events` against both indices on a blocking task, then run
    /// every combination.
    pub async fn run(
        &self,
        events: Vec<FundingEvent>,
        spot: Arc<PriceIndex>,
        futures: Arc<PriceIndex>,
    ) -> Result<SweepResults> {
        validate_events(&events)?;
        let enriched =
            tokio::task::spawn_blocking(move || enrich_events(&events, &spot, &futures))
                .await
                .context("Alignment task panicked")?;
        self.run_enriched(enriched).await
    }

    /// Run every combination on already aligned events.
    pub async fn run_enriched(&self, enriched: Vec<EnrichedEvent>) -> Result<SweepResults> {
        let configs = self.parameter_space.generate_configs(&self.base_config);
        let total_combinations = configs.len();

        info!(
            "Starting parameter sweep with {} combinations over {} events, parallelism={}",
            total_combinations,
            enriched.len(),
            self.parallelism
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let enriched = Arc::new(enriched);

        let mut handles = Vec::with_capacity(configs.len());

        for (i, config) in configs.into_iter().enumerate() {
            let sem = semaphore.clone();
            let events = enriched.clone();

            let handle = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;

                info!(
                    "[{}/{}] Testing: {}",
                    i + 1,
                    total_combinations,
                    ParameterSpace::describe_config(&config)
                );

                let outcome = tokio::task::spawn_blocking(move || {
                    BacktestEngine::new(config)?.run_enriched((*events).clone())
                })
                .await;

                match outcome {
                    Ok(Ok(result)) => {
                        info!(
                            "[{}/{}] Complete: Sharpe={:.3} PnL={}",
                            i + 1,
                            total_combinations,
                            result.metrics.sharpe_ratio,
                            describe_pnl(result.metrics.cumulative_pnl)
                        );
                        Some(result)
                    }
                    Ok(Err(e)) => {
                        warn!("[{}/{}] Failed: {}", i + 1, total_combinations, e);
                        None
                    }
                    Err(e) => {
                        warn!("[{}/{}] Task panicked: {}", i + 1, total_combinations, e);
                        None
                    }
                }
            });

            handles.push(handle);
        }

        // Collect results
        let mut runs = Vec::new();
        let mut failed_runs = 0;

        for handle in handles {
            match handle.await {
                Ok(Some(result)) => runs.push(result),
                Ok(None) => failed_runs += 1,
                Err(e) => {
                    warn!("Task panicked: {}", e);
                    failed_runs += 1;
                }
            }
        }

        Ok(SweepResults::from_runs(runs, total_combinations, failed_runs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::data::{Market, PriceSample, TimestampUnit};

    const OCT1: i64 = 1759276800000;
    const PERIOD: i64 = 8 * 3_600_000;

    fn sample_data() -> (Vec<FundingEvent>, PriceIndex, PriceIndex) {
        let rates = [
            dec!(0.0001),
            dec!(0.0003),
            dec!(0.00025),
            dec!(0.00005),
            dec!(-0.0002),
            dec!(0.0004),
        ];
        let prices = [dec!(100), dec!(101), dec!(100.5), dec!(102), dec!(101), dec!(103)];

        let events = rates
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                FundingEvent::new("BTCUSDT", OCT1 + i as i64 * PERIOD, r).with_mark_price(prices[i])
            })
            .collect();
        let samples = |market: Market, unit: TimestampUnit| {
            prices
                .iter()
                .enumerate()
                .map(|(i, &price)| PriceSample {
                    timestamp: unit.from_millis(OCT1 + i as i64 * PERIOD),
                    price,
                    market,
                })
                .collect()
        };

        (
            events,
            PriceIndex::from_samples(
                Market::Spot,
                TimestampUnit::Micros,
                samples(Market::Spot, TimestampUnit::Micros),
            ),
            PriceIndex::from_samples(
                Market::Futures,
                TimestampUnit::Millis,
                samples(Market::Futures, TimestampUnit::Millis),
            ),
        )
    }

    #[test]
    fn test_parameter_space_count() {
        let space = ParameterSpace {
            gap_policies: vec![GapPolicy::Propagate, GapPolicy::CarryLast],
            ..ParameterSpace::default()
        };
        assert_eq!(space.combination_count(), 10);
        assert_eq!(ParameterSpace::minimal().combination_count(), 1);
    }

    #[test]
    fn test_threshold_range() {
        let space =
            ParameterSpace::threshold_range(dec!(0.0001), dec!(0.0003), dec!(0.0001)).unwrap();
        assert_eq!(space.thresholds, vec![dec!(0.0001), dec!(0.0002), dec!(0.0003)]);

        assert!(ParameterSpace::threshold_range(dec!(0.0001), dec!(0.0003), dec!(0)).is_err());
        assert!(ParameterSpace::threshold_range(dec!(0), dec!(0.0003), dec!(0.0001)).is_err());
    }

    #[test]
    fn test_generate_configs() {
        let space = ParameterSpace {
            thresholds: vec![dec!(0.0001), dec!(0.0002)],
            gap_policies: vec![GapPolicy::Skip],
        };
        let configs = space.generate_configs(&BacktestConfig::default());

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].threshold, dec!(0.0001));
        assert_eq!(configs[1].threshold, dec!(0.0002));
        assert!(configs.iter().all(|c| c.gap_policy == GapPolicy::Skip));
    }

    #[test]
    fn test_describe_config() {
        let desc = ParameterSpace::describe_config(&BacktestConfig::default());
        assert!(desc.contains("threshold=0.0100%"));
        assert!(desc.contains("gaps=propagate"));
    }

    #[tokio::test]
    async fn test_sweep_runs_all_thresholds() {
        let (events, spot, futures) = sample_data();
        let runner = SweepRunner::new(ParameterSpace::default(), BacktestConfig::default(), 2);

        let results = runner
            .run(events, Arc::new(spot), Arc::new(futures))
            .await
            .unwrap();

        assert_eq!(results.total_combinations, 5);
        assert_eq!(results.successful_runs, 5);
        assert_eq!(results.failed_runs, 0);
        let thresholds: Vec<Decimal> = results
            .runs
            .iter()
            .map(|r| r.backtest_config.threshold)
            .collect();
        assert_eq!(thresholds, ParameterSpace::default().thresholds);
        assert!(results.best_pnl().is_some());
        assert!(results.summary().contains("PARAMETER SWEEP RESULTS"));
    }

    #[tokio::test]
    async fn test_sweep_matches_single_run() {
        let (events, spot, futures) = sample_data();
        let config = BacktestConfig::default();
        let single = BacktestEngine::new(config.clone())
            .unwrap()
            .run(&events, &spot, &futures)
            .unwrap();

        let runner = SweepRunner::new(ParameterSpace::minimal(), config, 1);
        let results = runner
            .run(events, Arc::new(spot), Arc::new(futures))
            .await
            .unwrap();

        assert_eq!(results.runs[0].metrics.cumulative_pnl, single.metrics.cumulative_pnl);
    }

    #[tokio::test]
    async fn test_sweep_counts_failed_runs() {
        let (mut events, spot, futures) = sample_data();
        events[2].mark_price = None;
        let space = ParameterSpace {
            thresholds: vec![dec!(0.0001), dec!(0.0002)],
            gap_policies: vec![GapPolicy::Propagate, GapPolicy::Fail],
        };
        let runner = SweepRunner::new(space, BacktestConfig::default(), 4);

        let results = runner
            .run(events, Arc::new(spot), Arc::new(futures))
            .await
            .unwrap();

        assert_eq!(results.total_combinations, 4);
        assert_eq!(results.successful_runs, 2);
        assert_eq!(results.failed_runs, 2);
        // Propagated runs have an undefined cumulative PnL
        assert!(results.best_pnl().is_none());
    }

    #[test]
    fn test_sweep_to_csv() {
        let (events, spot, futures) = sample_data();
        let result = BacktestEngine::new(BacktestConfig::default())
            .unwrap()
            .run(&events, &spot, &futures)
            .unwrap();
        let results = SweepResults::from_runs(vec![result], 1, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweep.csv");
        results.to_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("threshold,gap_policy,cumulative_pnl"));
        assert_eq!(text.lines().count(), 2);
    }
}
