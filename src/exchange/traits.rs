//! Source-agnostic funding history retrieval.
//!
//! A source only has to answer single bounded requests. Splitting a long
//! range into windows and paging through full responses happens here:
//! - windows never exceed `max_window_days`
//! - a page of exactly `limit` records triggers a follow-up request
//! - results are sorted by funding time with duplicates removed

use crate::backtest::FundingEvent;
use async_trait::async_trait;
use tracing::{debug, info};

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Anything that can answer a bounded funding-history request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FundingHistorySource: Send + Sync {
    /// Funding events of `symbol` with `start_ms <= fundingTime <= end_ms`,
    /// oldest first, at most `limit` of them.
    async fn fetch_funding_page(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> anyhow::Result<Vec<FundingEvent>>;
}

/// Funding history of `symbol` between `start_ms` and `end_ms` inclusive.
pub async fn fetch_funding_history(
    source: &dyn FundingHistorySource,
    symbol: &str,
    start_ms: i64,
    end_ms: i64,
    max_window_days: u32,
    limit: u32,
) -> anyhow::Result<Vec<FundingEvent>> {
    anyhow::ensure!(
        start_ms <= end_ms,
        "Start time {} is after end time {}",
        start_ms,
        end_ms
    );
    anyhow::ensure!(max_window_days >= 1, "Window must be at least one day");
    anyhow::ensure!(limit >= 1, "Page limit must be at least 1");

    let window = i64::from(max_window_days) * MILLIS_PER_DAY;
    let mut events: Vec<FundingEvent> = Vec::new();
    let mut window_start = start_ms;

    while window_start <= end_ms {
        let window_end = window_start.saturating_add(window - 1).min(end_ms);
        let mut page_start = window_start;

        loop {
            let page = source
                .fetch_funding_page(symbol, page_start, window_end, limit)
                .await?;
            let page_len = page.len();
            let last_time = page.last().map(|e| e.funding_time);

            debug!(
                "Fetched {} funding records for {} in [{}, {}]",
                page_len, symbol, page_start, window_end
            );
            events.extend(
                page.into_iter()
                    .filter(|e| e.funding_time >= page_start && e.funding_time <= window_end),
            );

            match last_time {
                Some(last) if page_len >= limit as usize && last < window_end => {
                    page_start = last + 1;
                }
                _ => break,
            }
        }

        window_start = window_end.saturating_add(1);
        if window_end == i64::MAX {
            break;
        }
    }

    events.sort_by_key(|e| e.funding_time);
    events.dedup_by_key(|e| e.funding_time);

    info!("Fetched {} funding events for {}", events.len(), symbol);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use rust_decimal_macros::dec;

    const OCT1: i64 = 1759276800000;
    const PERIOD: i64 = 8 * 3_600_000;

    fn event(i: i64) -> FundingEvent {
        FundingEvent::new("BTCUSDT", OCT1 + i * PERIOD, dec!(0.0001))
    }

    #[tokio::test]
    async fn test_single_window_single_page() {
        let mut source = MockFundingHistorySource::new();
        source
            .expect_fetch_funding_page()
            .with(function(|s: &str| s == "BTCUSDT"), eq(OCT1), eq(OCT1 + 2 * PERIOD), eq(1000))
            .times(1)
            .returning(|_, _, _, _| Ok(vec![event(0), event(1), event(2)]));

        let events = fetch_funding_history(&source, "BTCUSDT", OCT1, OCT1 + 2 * PERIOD, 30, 1000)
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_range_is_split_into_windows() {
        let mut source = MockFundingHistorySource::new();
        let day = MILLIS_PER_DAY;

        source
            .expect_fetch_funding_page()
            .with(always(), eq(OCT1), eq(OCT1 + day - 1), always())
            .times(1)
            .returning(|_, _, _, _| Ok(vec![event(0), event(1), event(2)]));
        source
            .expect_fetch_funding_page()
            .with(always(), eq(OCT1 + day), eq(OCT1 + day + 3_600_000), always())
            .times(1)
            .returning(|_, _, _, _| Ok(vec![event(3)]));

        let end = OCT1 + day + 3_600_000;
        let events = fetch_funding_history(&source, "BTCUSDT", OCT1, end, 1, 1000)
            .await
            .unwrap();

        let times: Vec<i64> = events.iter().map(|e| e.funding_time).collect();
        assert_eq!(times, vec![OCT1, OCT1 + PERIOD, OCT1 + 2 * PERIOD, OCT1 + 3 * PERIOD]);
    }

    #[tokio::test]
    async fn test_full_page_is_followed_up() {
        let mut source = MockFundingHistorySource::new();
        let end = OCT1 + 10 * PERIOD;

        source
            .expect_fetch_funding_page()
            .with(always(), eq(OCT1), eq(end), eq(2))
            .times(1)
            .returning(|_, _, _, _| Ok(vec![event(0), event(1)]));
        source
            .expect_fetch_funding_page()
            .with(always(), eq(OCT1 + PERIOD + 1), eq(end), eq(2))
            .times(1)
            .returning(|_, _, _, _| Ok(vec![event(2)]));

        let events = fetch_funding_history(&source, "BTCUSDT", OCT1, end, 30, 2)
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicates_are_removed() {
        let mut source = MockFundingHistorySource::new();
        source
            .expect_fetch_funding_page()
            .returning(|_, _, _, _| Ok(vec![event(1), event(0), event(1)]));

        let events = fetch_funding_history(&source, "BTCUSDT", OCT1, OCT1 + PERIOD, 30, 1000)
            .await
            .unwrap();

        assert_eq!(events, vec![event(0), event(1)]);
    }

    #[tokio::test]
    async fn test_source_error_is_propagated() {
        let mut source = MockFundingHistorySource::new();
        source
            .expect_fetch_funding_page()
            .returning(|_, _, _, _| Err(anyhow::anyhow!("boom")));

        let result = fetch_funding_history(&source, "BTCUSDT", OCT1, OCT1 + PERIOD, 30, 1000).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejects_inverted_range() {
        let source = MockFundingHistorySource::new();
        let result = fetch_funding_history(&source, "BTCUSDT", OCT1, OCT1 - 1, 30, 1000).await;
        assert!(result.is_err());
    }
}
