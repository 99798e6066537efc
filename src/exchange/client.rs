//! Binance public-data REST client.

use crate::backtest::FundingEvent;
use crate::config::FetchConfig;
use crate::exchange::traits::FundingHistorySource;
use crate::exchange::types::{ApiError, FundingRateRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const FUNDING_RATE_PATH: &str = "/fapi/v1/fundingRate";
const USER_AGENT: &str = concat!("funding-arb-backtest/", env!("CARGO_PKG_VERSION"));

/// Send `request` with retries on transport errors, 429 and 5xx.
///
/// Attempt `n` (0-based) is followed by a `retry_delay * (n + 2)` pause.
/// Returns `Ok(None)` on 404.
pub(crate) async fn send_with_retry<F>(
    build: F,
    max_retries: u32,
    retry_delay: Duration,
    what: &str,
) -> Result<Option<Response>>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0;
    loop {
        let failure = match build().send().await {
            Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
            Ok(response) if response.status().is_success() => return Ok(Some(response)),
            Ok(response)
                if response.status().is_server_error()
                    || response.status() == StatusCode::TOO_MANY_REQUESTS =>
            {
                format!("HTTP {}", response.status())
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<ApiError>(&body) {
                    Ok(err) => anyhow::bail!(
                        "{} failed: HTTP {} ({}: {})",
                        what,
                        status,
                        err.code,
                        err.msg
                    ),
                    Err(_) => anyhow::bail!("{} failed: HTTP {}: {}", what, status, body),
                }
            }
            Err(e) => e.to_string(),
        };

        if attempt >= max_retries {
            anyhow::bail!("{} failed after {} attempts: {}", what, attempt + 1, failure);
        }
        attempt += 1;
        let delay = retry_delay * (attempt + 1);
        warn!("{} failed ({}), retry {}/{} in {:?}", what, failure, attempt, max_retries, delay);
        tokio::time::sleep(delay).await;
    }
}

/// Client for the public Binance futures REST endpoints.
pub struct BinanceDataClient {
    http: Client,
    futures_base_url: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl BinanceDataClient {
    /// Create a new client from configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            futures_base_url: config.futures_api_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Override the base delay between retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Fetch one page of funding history. A 404 yields an empty page.
    #[instrument(skip(self))]
    pub async fn get_funding_rate_history(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<FundingRateRecord>> {
        let url = format!("{}{}", self.futures_base_url, FUNDING_RATE_PATH);
        let query = [
            ("symbol", symbol.to_string()),
            ("startTime", start_ms.to_string()),
            ("endTime", end_ms.to_string()),
            ("limit", limit.to_string()),
        ];

        let response = send_with_retry(
            || self.http.get(&url).query(&query),
            self.max_retries,
            self.retry_delay,
            "Funding rate request",
        )
        .await?;

        let Some(response) = response else {
            debug!("Funding history not found for {}", symbol);
            return Ok(Vec::new());
        };

        response
            .json()
            .await
            .context("Failed to parse funding rate response")
    }
}

#[async_trait]
impl FundingHistorySource for BinanceDataClient {
    async fn fetch_funding_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<FundingEvent>> {
        let records = self
            .get_funding_rate_history(symbol, start_ms, end_ms, limit)
            .await?;
        Ok(records.into_iter().map(FundingEvent::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::traits::fetch_funding_history;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> BinanceDataClient {
        let config = FetchConfig {
            futures_api_url: server.uri(),
            max_retries: 2,
            timeout_secs: 5,
            ..FetchConfig::default()
        };
        BinanceDataClient::new(&config)
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_get_funding_rate_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .and(query_param("symbol", "BTCUSDT"))
            .and(query_param("startTime", "1759276800000"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "fundingTime": 1759276800000_i64, "fundingRate": "0.00010000", "markPrice": "114048.5"},
                {"symbol": "BTCUSDT", "fundingTime": 1759305600000_i64, "fundingRate": "-0.00003000", "markPrice": ""}
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let records = client
            .get_funding_rate_history("BTCUSDT", 1759276800000, 1759363199999, 1000)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mark_price, Some(dec!(114048.5)));
        assert_eq!(records[1].funding_rate, dec!(-0.00003));
        assert_eq!(records[1].mark_price, None);
    }

    #[tokio::test]
    async fn test_not_found_is_empty_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let events = client
            .fetch_funding_page("BTCUSDT", 0, 1, 1000)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "BTCUSDT", "fundingTime": 1759276800000_i64, "fundingRate": "0.0001", "markPrice": "100"}
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let records = client
            .get_funding_rate_history("BTCUSDT", 0, 1, 1000)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let result = client.get_funding_rate_history("BTCUSDT", 0, 1, 1000).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"code": -1121, "msg": "Invalid symbol."})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client
            .get_funding_rate_history("NOPE", 0, 1, 1000)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid symbol"));
    }

    #[tokio::test]
    async fn test_history_through_client() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FUNDING_RATE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"symbol": "ETHUSDT", "fundingTime": 1759276800000_i64, "fundingRate": "0.0001", "markPrice": "4000"},
                {"symbol": "ETHUSDT", "fundingTime": 1759305600000_i64, "fundingRate": "0.0002", "markPrice": "4010"}
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let events =
            fetch_funding_history(&client, "ETHUSDT", 1759276800000, 1759363199999, 30, 1000)
                .await
                .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].mark_price, Some(dec!(4010)));
    }
}
