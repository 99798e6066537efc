//! Binance data acquisition.
//!
//! - Funding-rate history from the USD-M futures REST API, split into
//!   bounded windows and pages
//! - Daily or monthly market-data archives from the public bulk-data mirror

mod archive;
mod client;
mod traits;
mod types;

pub use archive::{ArchiveDownloader, ArchiveInterval, ArchiveTarget, DownloadOutcome};
pub use client::BinanceDataClient;
pub use traits::{fetch_funding_history, FundingHistorySource};
pub use types::*;
