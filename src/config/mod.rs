//! Configuration management for the backtester.
//!
//! Loads settings from an optional `config` file, `.env`, and `FARB__*`
//! environment variables (e.g. `FARB__STRATEGY__THRESHOLD=0.0002`).

use crate::backtest::{BacktestConfig, GapPolicy, SampleFormat, TimestampUnit};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Position and gap-handling parameters
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Input and output locations
    #[serde(default)]
    pub data: DataConfig,
    /// Binance endpoints and download behavior
    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Absolute funding rate that opens a hedge
    #[serde(default = "default_threshold")]
    pub threshold: Decimal,
    /// Treatment of events with no aligned price
    #[serde(default)]
    pub gap_policy: GapPolicy,
    /// Concurrent backtests during a sweep
    #[serde(default = "default_sweep_parallelism")]
    pub sweep_parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Symbol to backtest, e.g. BTCUSDT
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Funding-rate CSV produced by `fetch-funding`
    #[serde(default = "default_funding_csv")]
    pub funding_csv: String,
    /// Directory of extracted spot day files
    #[serde(default = "default_spot_dir")]
    pub spot_dir: String,
    /// Directory of extracted futures day files
    #[serde(default = "default_futures_dir")]
    pub futures_dir: String,
    #[serde(default = "default_sample_format")]
    pub spot_format: SampleFormat,
    #[serde(default = "default_sample_format")]
    pub futures_format: SampleFormat,
    /// Spot archives are in microseconds since 2025
    #[serde(default = "default_spot_unit")]
    pub spot_timestamp_unit: TimestampUnit,
    #[serde(default = "default_futures_unit")]
    pub futures_timestamp_unit: TimestampUnit,
    /// Where the ledger CSV is written
    #[serde(default = "default_ledger_csv")]
    pub ledger_csv: String,
    /// SQLite run history
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// USD-M futures REST base URL
    #[serde(default = "default_futures_api_url")]
    pub futures_api_url: String,
    /// Public bulk-data mirror
    #[serde(default = "default_archive_url")]
    pub archive_url: String,
    /// Largest time window per funding-history request
    #[serde(default = "default_max_window_days")]
    pub max_window_days: u32,
    /// Records per funding-history page (API maximum is 1000)
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Archive partitioning, `daily` or `monthly`
    #[serde(default = "default_archive_interval")]
    pub archive_interval: String,
    /// Candle width used for kline archives
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,
}

// Default value functions
fn default_threshold() -> Decimal {
    Decimal::new(1, 4) // 0.0001 (0.01% per funding period)
}

fn default_sweep_parallelism() -> usize {
    4
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_funding_csv() -> String {
    "data/fundingRate.csv".to_string()
}

fn default_spot_dir() -> String {
    "data/spot".to_string()
}

fn default_futures_dir() -> String {
    "data/futures".to_string()
}

fn default_sample_format() -> SampleFormat {
    SampleFormat::AggTrades
}

fn default_spot_unit() -> TimestampUnit {
    TimestampUnit::Micros
}

fn default_futures_unit() -> TimestampUnit {
    TimestampUnit::Millis
}

fn default_ledger_csv() -> String {
    "data/ledger.csv".to_string()
}

fn default_database_path() -> String {
    "data/backtests.db".to_string()
}

fn default_futures_api_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_archive_url() -> String {
    "https://data.binance.vision".to_string()
}

fn default_max_window_days() -> u32 {
    30
}

fn default_page_limit() -> u32 {
    1000
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_archive_interval() -> String {
    "daily".to_string()
}

fn default_kline_interval() -> String {
    "1m".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("FARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.strategy.threshold > Decimal::ZERO,
            "threshold must be positive"
        );

        anyhow::ensure!(
            self.strategy.sweep_parallelism >= 1,
            "sweep_parallelism must be at least 1"
        );

        anyhow::ensure!(!self.data.symbol.trim().is_empty(), "symbol must be set");

        anyhow::ensure!(
            self.fetch.max_window_days >= 1,
            "max_window_days must be at least 1"
        );

        anyhow::ensure!(
            (1..=1000).contains(&self.fetch.page_limit),
            "page_limit must be between 1 and 1000"
        );

        anyhow::ensure!(
            matches!(self.fetch.archive_interval.as_str(), "daily" | "monthly"),
            "archive_interval must be daily or monthly"
        );

        Ok(())
    }

    /// Backtest parameters from the strategy section.
    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            threshold: self.strategy.threshold,
            gap_policy: self.strategy.gap_policy,
            record_ledger: true,
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            gap_policy: GapPolicy::default(),
            sweep_parallelism: default_sweep_parallelism(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            funding_csv: default_funding_csv(),
            spot_dir: default_spot_dir(),
            futures_dir: default_futures_dir(),
            spot_format: default_sample_format(),
            futures_format: default_sample_format(),
            spot_timestamp_unit: default_spot_unit(),
            futures_timestamp_unit: default_futures_unit(),
            ledger_csv: default_ledger_csv(),
            database_path: default_database_path(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            futures_api_url: default_futures_api_url(),
            archive_url: default_archive_url(),
            max_window_days: default_max_window_days(),
            page_limit: default_page_limit(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            archive_interval: default_archive_interval(),
            kline_interval: default_kline_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backtest_config(), BacktestConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.strategy.threshold = dec!(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fetch.page_limit = 5000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.fetch.archive_interval = "hourly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"strategy": {"threshold": "0.0002", "gap_policy": "carry_last"}, "data": {"symbol": "ETHUSDT"}}"#,
        )
        .unwrap();

        assert_eq!(config.strategy.threshold, dec!(0.0002));
        assert_eq!(config.strategy.gap_policy, GapPolicy::CarryLast);
        assert_eq!(config.strategy.sweep_parallelism, 4);
        assert_eq!(config.data.symbol, "ETHUSDT");
        assert_eq!(config.data.spot_timestamp_unit, TimestampUnit::Micros);
        assert_eq!(config.fetch.max_window_days, 30);
    }
}
