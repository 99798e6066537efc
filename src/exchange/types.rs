//! Type definitions for Binance API responses.

use crate::backtest::FundingEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;

/// One entry of `GET /fapi/v1/fundingRate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRateRecord {
    pub symbol: String,
    pub funding_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub funding_rate: Decimal,
    /// Older settlements report an empty string
    #[serde(default, deserialize_with = "deserialize_optional_decimal")]
    pub mark_price: Option<Decimal>,
}

impl From<FundingRateRecord> for FundingEvent {
    fn from(record: FundingRateRecord) -> Self {
        Self {
            symbol: record.symbol,
            funding_time: record.funding_time,
            funding_rate: record.funding_rate,
            mark_price: record.mark_price,
        }
    }
}

fn deserialize_optional_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Decimal::from_str(value)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Error payload returned by Binance on 4xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

/// Outcome of one archive download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    /// File written
    Downloaded,
    /// File already present and overwrite disabled
    Skipped,
    /// Archive does not exist on the mirror
    Missing,
    /// Retries exhausted
    Failed,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Downloaded => write!(f, "downloaded"),
            DownloadStatus::Skipped => write!(f, "skipped"),
            DownloadStatus::Missing => write!(f, "missing"),
            DownloadStatus::Failed => write!(f, "failed"),
        }
    }
}
