//! Downloader for the Binance public bulk-data mirror.
//!
//! Archives live at
//! `{root}/data/{market}/{interval}/{datatype}/{symbol}/{symbol}-{datatype}-{date}.zip`
//! (klines add the candle width as an extra directory and replace the
//! datatype in the file name). Each file is checked with HEAD, streamed to a
//! `.part` file and renamed into place once complete.

use crate::backtest::{Market, SampleFormat};
use crate::config::FetchConfig;
use crate::exchange::client::send_with_retry;
use crate::exchange::types::DownloadStatus;
use crate::utils::time::days_between;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

/// Archive partitioning on the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveInterval {
    Daily,
    Monthly,
}

impl ArchiveInterval {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(ArchiveInterval::Daily),
            "monthly" => Ok(ArchiveInterval::Monthly),
            other => {
                anyhow::bail!("Unknown archive interval '{}' (expected daily or monthly)", other)
            }
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ArchiveInterval::Daily => "daily",
            ArchiveInterval::Monthly => "monthly",
        }
    }

    /// Date label used in file names.
    fn label(self, date: NaiveDate) -> String {
        match self {
            ArchiveInterval::Daily => date.format("%Y-%m-%d").to_string(),
            ArchiveInterval::Monthly => date.format("%Y-%m").to_string(),
        }
    }
}

/// What to download: one symbol's datatype on one market.
#[derive(Debug, Clone)]
pub struct ArchiveTarget {
    pub symbol: String,
    pub market: Market,
    pub format: SampleFormat,
    /// Candle width, only used for klines
    pub kline_interval: String,
}

impl ArchiveTarget {
    fn market_path(&self) -> &'static str {
        match self.market {
            Market::Spot => "spot",
            Market::Futures => "futures/um",
        }
    }

    /// Relative URL path and file name of the archive for `label`.
    fn location(&self, interval: ArchiveInterval, label: &str) -> (String, String) {
        let datatype = self.format.datatype();
        match self.format {
            SampleFormat::AggTrades => {
                let file_name = format!("{}-{}-{}.zip", self.symbol, datatype, label);
                let path = format!(
                    "data/{}/{}/{}/{}/{}",
                    self.market_path(),
                    interval.as_str(),
                    datatype,
                    self.symbol,
                    file_name
                );
                (path, file_name)
            }
            SampleFormat::Klines => {
                let file_name = format!("{}-{}-{}.zip", self.symbol, self.kline_interval, label);
                let path = format!(
                    "data/{}/{}/{}/{}/{}/{}",
                    self.market_path(),
                    interval.as_str(),
                    datatype,
                    self.symbol,
                    self.kline_interval,
                    file_name
                );
                (path, file_name)
            }
        }
    }
}

/// Result of one planned archive.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub file_name: String,
    pub url: String,
    pub status: DownloadStatus,
}

/// Downloads market-data archives from the bulk-data mirror.
pub struct ArchiveDownloader {
    http: Client,
    base_url: String,
    interval: ArchiveInterval,
    max_retries: u32,
    retry_delay: Duration,
}

impl ArchiveDownloader {
    /// Create a new downloader from configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        // Archives can be large; allow far more than the API timeout
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_mul(4)))
            .user_agent(concat!("funding-arb-backtest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.archive_url.trim_end_matches('/').to_string(),
            interval: ArchiveInterval::parse(&config.archive_interval)?,
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Override the base delay between retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Absolute URL and file name of the archive covering `date`.
    pub fn archive_url(&self, target: &ArchiveTarget, date: NaiveDate) -> (String, String) {
        let (path, file_name) = target.location(self.interval, &self.interval.label(date));
        (format!("{}/{}", self.base_url, path), file_name)
    }

    /// Archives covering `start..=end`, one per day or month.
    pub fn plan(
        &self,
        target: &ArchiveTarget,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<(String, String)> {
        let mut planned: Vec<(String, String)> = Vec::new();
        for date in days_between(start, end) {
            let entry = self.archive_url(target, date);
            if planned.last() != Some(&entry) {
                planned.push(entry);
            }
        }
        planned
    }

    /// Whether the mirror has `url`. Any failure counts as absent.
    #[instrument(skip(self))]
    pub async fn exists(&self, url: &str) -> bool {
        match self.http.head(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                false
            }
        }
    }

    /// Download `url` to `dest`, writing through a `.part` file.
    #[instrument(skip(self))]
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        overwrite: bool,
    ) -> Result<DownloadStatus> {
        if !overwrite && tokio::fs::try_exists(dest).await.unwrap_or(false) {
            return Ok(DownloadStatus::Skipped);
        }

        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        let mut attempt = 0;
        loop {
            match self.fetch_to(url, &part).await {
                Ok(true) => {
                    tokio::fs::rename(&part, dest)
                        .await
                        .with_context(|| format!("Failed to move {} into place", part.display()))?;
                    return Ok(DownloadStatus::Downloaded);
                }
                Ok(false) => return Ok(DownloadStatus::Missing),
                Err(e) => {
                    let _ = tokio::fs::remove_file(&part).await;
                    if attempt >= self.max_retries {
                        warn!("Giving up on {}: {:#}", url, e);
                        return Ok(DownloadStatus::Failed);
                    }
                    attempt += 1;
                    warn!(
                        "Download of {} failed ({:#}), retry {}/{}",
                        url, e, attempt, self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay * (attempt + 1)).await;
                }
            }
        }
    }

    /// Stream `url` into `part`. `Ok(false)` when the archive does not exist.
    async fn fetch_to(&self, url: &str, part: &Path) -> Result<bool> {
        let response =
            send_with_retry(|| self.http.get(url), 0, self.retry_delay, "Archive download")
                .await?;
        let Some(mut response) = response else {
            return Ok(false);
        };

        let mut file = tokio::fs::File::create(part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;
        while let Some(chunk) = response.chunk().await.context("Archive stream interrupted")? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(true)
    }

    /// Download every archive of `target` between `start` and `end` into `dest_dir`.
    pub async fn download_range(
        &self,
        target: &ArchiveTarget,
        start: NaiveDate,
        end: NaiveDate,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<Vec<DownloadOutcome>> {
        anyhow::ensure!(start <= end, "Start date {} is after end date {}", start, end);
        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

        let planned = self.plan(target, start, end);
        info!(
            "Planned {} {} {} archives for {} from {} to {}",
            planned.len(),
            target.market,
            target.format.datatype(),
            target.symbol,
            start,
            end
        );

        let mut outcomes = Vec::with_capacity(planned.len());
        for (url, file_name) in planned {
            let status = if self.exists(&url).await {
                self.download(&url, &dest_dir.join(&file_name), overwrite).await?
            } else {
                DownloadStatus::Missing
            };
            info!("{}: {}", status, file_name);
            outcomes.push(DownloadOutcome {
                file_name,
                url,
                status,
            });
        }

        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARCHIVE_PATH: &str = "/data/futures/um/daily/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2025-10-01.zip";

    fn target(market: Market, format: SampleFormat) -> ArchiveTarget {
        ArchiveTarget {
            symbol: "BTCUSDT".to_string(),
            market,
            format,
            kline_interval: "1m".to_string(),
        }
    }

    fn downloader(base_url: &str, interval: &str) -> ArchiveDownloader {
        let config = FetchConfig {
            archive_url: base_url.to_string(),
            archive_interval: interval.to_string(),
            max_retries: 1,
            ..FetchConfig::default()
        };
        ArchiveDownloader::new(&config)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, d).unwrap()
    }

    #[test]
    fn test_archive_urls() {
        let dl = downloader("https://data.binance.vision/", "daily");

        let (url, name) = dl.archive_url(&target(Market::Futures, SampleFormat::AggTrades), day(1));
        assert_eq!(url, format!("https://data.binance.vision{}", ARCHIVE_PATH));
        assert_eq!(name, "BTCUSDT-aggTrades-2025-10-01.zip");

        let (url, _) = dl.archive_url(&target(Market::Spot, SampleFormat::AggTrades), day(2));
        assert_eq!(
            url,
            "https://data.binance.vision/data/spot/daily/aggTrades/BTCUSDT/BTCUSDT-aggTrades-2025-10-02.zip"
        );

        let (url, name) = dl.archive_url(&target(Market::Spot, SampleFormat::Klines), day(3));
        assert_eq!(
            url,
            "https://data.binance.vision/data/spot/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2025-10-03.zip"
        );
        assert_eq!(name, "BTCUSDT-1m-2025-10-03.zip");
    }

    #[test]
    fn test_plan_daily_and_monthly() {
        let s = target(Market::Futures, SampleFormat::AggTrades);

        let daily = downloader("http://x", "daily").plan(&s, day(1), day(10));
        assert_eq!(daily.len(), 10);

        let monthly = downloader("http://x", "monthly").plan(
            &s,
            day(30),
            NaiveDate::from_ymd_opt(2025, 11, 2).unwrap(),
        );
        let names: Vec<&str> = monthly.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["BTCUSDT-aggTrades-2025-10.zip", "BTCUSDT-aggTrades-2025-11.zip"]
        );
    }

    #[test]
    fn test_unknown_interval_is_rejected() {
        assert!(ArchiveInterval::parse("hourly").is_err());
    }

    #[tokio::test]
    async fn test_download_range_writes_files() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path(ARCHIVE_PATH))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(ARCHIVE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"PK\x03\x04zipdata".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&server.uri(), "daily");
        let futures = target(Market::Futures, SampleFormat::AggTrades);
        let outcomes = dl
            .download_range(&futures, day(1), day(2), dir.path(), true)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, DownloadStatus::Downloaded);
        // Nothing mounted for the second day
        assert_eq!(outcomes[1].status, DownloadStatus::Missing);

        let written = std::fs::read(dir.path().join("BTCUSDT-aggTrades-2025-10-01.zip")).unwrap();
        assert_eq!(written, b"PK\x03\x04zipdata");
        assert!(!dir.path().join("BTCUSDT-aggTrades-2025-10-01.zip.part").exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_skipped() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("BTCUSDT-aggTrades-2025-10-01.zip");
        std::fs::write(&dest, b"old").unwrap();

        let dl = downloader(&server.uri(), "daily");
        let url = format!("{}{}", server.uri(), ARCHIVE_PATH);

        let status = dl.download(&url, &dest, false).await.unwrap();
        assert_eq!(status, DownloadStatus::Skipped);
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_not_found_is_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&server.uri(), "daily");
        let url = format!("{}{}", server.uri(), ARCHIVE_PATH);

        let status = dl.download(&url, &dir.path().join("a.zip"), true).await.unwrap();
        assert_eq!(status, DownloadStatus::Missing);
    }

    #[tokio::test]
    async fn test_persistent_server_error_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&server.uri(), "daily");
        let url = format!("{}{}", server.uri(), ARCHIVE_PATH);
        let dest = dir.path().join("a.zip");

        let status = dl.download(&url, &dest, true).await.unwrap();
        assert_eq!(status, DownloadStatus::Failed);
        assert!(!dest.exists());
    }
}
