//! Historical data for backtesting.
//!
//! Funding events are read from the funding-rate CSV produced by
//! `fetch-funding`. Price samples are read from day-partitioned aggTrades or
//! klines files (one directory per market) into a [`PriceIndex`].

use crate::utils::time::{day_of_millis, format_compact};
use anyhow::{ensure, Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Market a price sample was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Market::Spot => write!(f, "spot"),
            Market::Futures => write!(f, "futures"),
        }
    }
}

/// Native resolution of a market's sample timestamps.
///
/// Binance spot archives switched to microseconds; futures archives are in
/// milliseconds. Funding times are always milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Millis,
    Micros,
}

impl TimestampUnit {
    /// Multiplier from milliseconds to this unit.
    pub fn per_milli(self) -> i64 {
        match self {
            TimestampUnit::Millis => 1,
            TimestampUnit::Micros => 1_000,
        }
    }

    /// Convert an epoch-ms timestamp into this unit.
    pub fn from_millis(self, millis: i64) -> i64 {
        millis.saturating_mul(self.per_milli())
    }

    /// Convert a timestamp in this unit back to epoch-ms (truncating).
    pub fn to_millis(self, value: i64) -> i64 {
        value.div_euclid(self.per_milli())
    }
}

/// Layout of a day-partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SampleFormat {
    /// `agg_trade_id,price,quantity,first_trade_id,last_trade_id,transact_time,is_buyer_maker[,is_best_match]`
    AggTrades,
    /// `open_time,open,high,low,close,...`; the open price is used.
    Klines,
}

impl SampleFormat {
    /// Column indices of (timestamp, price).
    fn columns(self) -> (usize, usize) {
        match self {
            SampleFormat::AggTrades => (5, 1),
            SampleFormat::Klines => (0, 1),
        }
    }

    /// Datatype segment used in archive file names.
    pub fn datatype(self) -> &'static str {
        match self {
            SampleFormat::AggTrades => "aggTrades",
            SampleFormat::Klines => "klines",
        }
    }
}

/// A single funding settlement for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub symbol: String,
    /// Settlement time, epoch milliseconds UTC
    pub funding_time: i64,
    pub funding_rate: Decimal,
    /// Mark price at settlement, when the API reported one
    pub mark_price: Option<Decimal>,
}

impl FundingEvent {
    pub fn new(symbol: &str, funding_time: i64, funding_rate: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            funding_time,
            funding_rate,
            mark_price: None,
        }
    }

    pub fn with_mark_price(mut self, mark_price: Decimal) -> Self {
        self.mark_price = Some(mark_price);
        self
    }
}

/// A price observation in one market. `timestamp` is in the market's native unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: i64,
    pub price: Decimal,
    pub market: Market,
}

/// A funding event with the price samples aligned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    pub event: FundingEvent,
    pub spot: Option<PriceSample>,
    pub futures: Option<PriceSample>,
}

impl EnrichedEvent {
    pub fn spot_price(&self) -> Option<Decimal> {
        self.spot.map(|s| s.price)
    }

    pub fn spot_price_timestamp(&self) -> Option<i64> {
        self.spot.map(|s| s.timestamp)
    }

    pub fn futures_price(&self) -> Option<Decimal> {
        self.futures.map(|s| s.price)
    }

    pub fn futures_price_timestamp(&self) -> Option<i64> {
        self.futures.map(|s| s.timestamp)
    }

    /// Price for the given market, if one was aligned.
    pub fn price(&self, market: Market) -> Option<Decimal> {
        match market {
            Market::Spot => self.spot_price(),
            Market::Futures => self.futures_price(),
        }
    }

    /// True when both markets have an aligned price.
    pub fn is_fully_aligned(&self) -> bool {
        self.spot.is_some() && self.futures.is_some()
    }
}

/// Samples of one calendar day (UTC), in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayPartition {
    pub day: NaiveDate,
    pub samples: Vec<PriceSample>,
}

/// Read-only, day-partitioned price history of one market.
#[derive(Debug, Clone)]
pub struct PriceIndex {
    market: Market,
    unit: TimestampUnit,
    partitions: Vec<DayPartition>,
}

impl PriceIndex {
    /// Build an index from partitions. Partitions are ordered by day; the
    /// sort is stable so same-day partitions keep their given order.
    pub fn new(market: Market, unit: TimestampUnit, mut partitions: Vec<DayPartition>) -> Self {
        partitions.sort_by_key(|p| p.day);
        Self {
            market,
            unit,
            partitions,
        }
    }

    /// Build an index from loose samples, partitioning them by UTC day.
    /// Samples keep their relative order inside each day.
    pub fn from_samples(market: Market, unit: TimestampUnit, samples: Vec<PriceSample>) -> Self {
        Self::new(market, unit, split_by_day(unit, samples))
    }

    /// Load every `<SYMBOL>-<datatype>-<date>` partition file of a directory.
    ///
    /// The date is `YYYY-MM-DD` for daily files or `YYYY-MM` for monthly
    /// ones; monthly files are split into day partitions by sample time.
    /// Both `.csv` files and the `.zip` archives Binance publishes are read,
    /// the extracted `.csv` winning when both exist. When `symbol` is given,
    /// files for other symbols are ignored.
    pub fn load_dir<P: AsRef<Path>>(
        dir: P,
        market: Market,
        unit: TimestampUnit,
        format: SampleFormat,
        symbol: Option<&str>,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read price directory: {}", dir.display()))?;

        let mut files: BTreeMap<String, (PartitionSpan, PathBuf)> = BTreeMap::new();
        let mut undated = 0usize;
        for entry in entries {
            let path = entry?.path();
            let extension = path.extension().and_then(|e| e.to_str());
            if !matches!(extension, Some("csv") | Some("zip")) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(symbol) = symbol {
                if !stem.starts_with(&format!("{}-", symbol)) {
                    continue;
                }
            }
            let Some(span) = partition_span(stem) else {
                warn!("Skipping {}: no date in file name", path.display());
                undated += 1;
                continue;
            };
            let stem = stem.to_string();
            let replace = match files.get(&stem) {
                Some((_, existing)) => !is_csv(existing),
                None => true,
            };
            if replace {
                files.insert(stem, (span, path));
            }
        }

        let mut partitions = Vec::with_capacity(files.len());
        for (span, path) in files.into_values() {
            let samples = if is_csv(&path) {
                read_partition(&path, market, format)?
            } else {
                read_archive(&path, market, format)?
            };
            match span {
                PartitionSpan::Day(day) => {
                    debug!("Loaded {} {} samples for {}", samples.len(), market, day);
                    partitions.push(DayPartition { day, samples });
                }
                PartitionSpan::Month(month) => {
                    let days = split_by_day(unit, samples);
                    if days.is_empty() {
                        warn!("No samples in monthly file {}", path.display());
                    }
                    debug!(
                        "Split {} {} into {} days",
                        market,
                        month.format("%Y-%m"),
                        days.len()
                    );
                    partitions.extend(days);
                }
            }
        }

        ensure!(
            undated == 0 || !partitions.is_empty(),
            "No partition could be loaded from {}: {} matching files carry no date",
            dir.display(),
            undated
        );

        let index = Self::new(market, unit, partitions);
        info!(
            "Loaded {} {} partitions ({} samples) from {}",
            index.partitions.len(),
            market,
            index.len(),
            dir.display()
        );

        Ok(index)
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn unit(&self) -> TimestampUnit {
        self.unit
    }

    pub fn partitions(&self) -> &[DayPartition] {
        &self.partitions
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(|p| p.samples.is_empty())
    }

    /// First and last partition day.
    pub fn day_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match (self.partitions.first(), self.partitions.last()) {
            (Some(first), Some(last)) => Some((first.day, last.day)),
            _ => None,
        }
    }

    /// Position of the first partition dated on or after `day`.
    pub fn first_partition_from(&self, day: NaiveDate) -> usize {
        self.partitions.partition_point(|p| p.day < day)
    }
}

/// Date range covered by one partition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionSpan {
    Day(NaiveDate),
    /// First day of the month
    Month(NaiveDate),
}

/// Extract the trailing `YYYY-MM-DD` or `YYYY-MM` of a partition file stem.
fn partition_span(stem: &str) -> Option<PartitionSpan> {
    if let Some(day) = stem
        .len()
        .checked_sub(10)
        .and_then(|start| stem.get(start..))
        .and_then(|tail| NaiveDate::parse_from_str(tail, "%Y-%m-%d").ok())
    {
        return Some(PartitionSpan::Day(day));
    }

    let start = stem.len().checked_sub(7)?;
    let tail = stem.get(start..)?;
    if !stem[..start].ends_with('-') {
        return None;
    }
    NaiveDate::parse_from_str(&format!("{}-01", tail), "%Y-%m-%d")
        .ok()
        .map(PartitionSpan::Month)
}

fn is_csv(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("csv")
}

/// Group samples into day partitions, keeping their order inside each day.
fn split_by_day(unit: TimestampUnit, samples: Vec<PriceSample>) -> Vec<DayPartition> {
    let mut partitions: Vec<DayPartition> = Vec::new();

    for sample in samples {
        let Some(day) = day_of_millis(unit.to_millis(sample.timestamp)) else {
            continue;
        };
        match partitions.iter_mut().find(|p| p.day == day) {
            Some(partition) => partition.samples.push(sample),
            None => partitions.push(DayPartition {
                day,
                samples: vec![sample],
            }),
        }
    }

    partitions
}

fn read_partition(path: &Path, market: Market, format: SampleFormat) -> Result<Vec<PriceSample>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open partition: {}", path.display()))?;

    parse_samples(&mut reader, market, format)
        .with_context(|| format!("Failed to parse partition: {}", path.display()))
}

/// Read the first `.csv` entry of a zipped partition.
fn read_archive(path: &Path, market: Market, format: SampleFormat) -> Result<Vec<PriceSample>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive: {}", path.display()))?;

    let name = archive
        .file_names()
        .find(|name| name.ends_with(".csv"))
        .map(str::to_owned)
        .with_context(|| format!("No csv entry in archive: {}", path.display()))?;
    let entry = archive
        .by_name(&name)
        .with_context(|| format!("Failed to open {} in {}", name, path.display()))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(entry);

    parse_samples(&mut reader, market, format)
        .with_context(|| format!("Failed to parse {} in {}", name, path.display()))
}

/// Parse sample rows; a non-numeric first row is treated as a header.
pub(crate) fn parse_samples<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    market: Market,
    format: SampleFormat,
) -> Result<Vec<PriceSample>> {
    let (ts_col, price_col) = format.columns();
    let mut samples: Vec<PriceSample> = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let ts_field = record.get(ts_col).map(str::trim).unwrap_or_default();

        let timestamp: i64 = match ts_field.parse() {
            Ok(ts) => ts,
            Err(_) if row == 0 => continue,
            Err(e) => anyhow::bail!("Row {}: invalid timestamp '{}': {}", row + 1, ts_field, e),
        };

        let price_field = record.get(price_col).map(str::trim).unwrap_or_default();
        let price: Decimal = price_field
            .parse()
            .with_context(|| format!("Row {}: invalid price '{}'", row + 1, price_field))?;

        if let Some(prev) = samples.last() {
            ensure!(
                timestamp >= prev.timestamp,
                "Row {}: timestamp {} precedes {}",
                row + 1,
                timestamp,
                prev.timestamp
            );
        }

        samples.push(PriceSample {
            timestamp,
            price,
            market,
        });
    }

    Ok(samples)
}

/// Row of the funding-rate CSV.
#[derive(Debug, Serialize, Deserialize)]
struct FundingCsvRow {
    symbol: String,
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate", with = "rust_decimal::serde::str")]
    funding_rate: Decimal,
    #[serde(rename = "markPrice", default, with = "rust_decimal::serde::str_option")]
    mark_price: Option<Decimal>,
    #[serde(rename = "fundingTime_str", default, skip_deserializing)]
    funding_time_str: String,
}

/// Load funding events from a CSV file.
///
/// Expected CSV format:
/// ```csv
/// symbol,fundingTime,fundingRate,markPrice
/// BTCUSDT,1759276800000,0.00010000,114048.50000000
/// ```
pub fn load_funding_csv<P: AsRef<Path>>(path: P) -> Result<Vec<FundingEvent>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to read funding CSV: {}", path.display()))?;
    let events = parse_funding_csv(file)?;
    info!("Loaded {} funding events from {}", events.len(), path.display());
    Ok(events)
}

/// Parse funding events from CSV content.
pub fn parse_funding_csv<R: std::io::Read>(input: R) -> Result<Vec<FundingEvent>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);

    let mut events = Vec::new();
    for (line, row) in reader.deserialize::<FundingCsvRow>().enumerate() {
        let row = row.with_context(|| format!("Failed to parse funding row {}", line + 2))?;
        events.push(FundingEvent {
            symbol: row.symbol,
            funding_time: row.funding_time,
            funding_rate: row.funding_rate,
            mark_price: row.mark_price,
        });
    }

    Ok(events)
}

/// Write funding events as CSV, appending a readable `fundingTime_str` column.
pub fn write_funding_csv<W: std::io::Write>(output: W, events: &[FundingEvent]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(output);
    for event in events {
        writer.serialize(FundingCsvRow {
            symbol: event.symbol.clone(),
            funding_time: event.funding_time,
            funding_rate: event.funding_rate,
            mark_price: event.mark_price,
            funding_time_str: format_compact(event.funding_time).unwrap_or_default(),
        })?;
    }
    writer.flush()?;
    Ok(())
}
