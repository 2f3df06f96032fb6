use crate::{
    error::HistoryError,
    feed::binance::{AggTrade, decode_agg_trades},
    trade::Trade,
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};

/// Binance spot REST base url.
pub const BINANCE_SPOT_REST_BASE: &str = "https://api.binance.com";

/// Width of the time window requested while searching for the first trade.
pub const PAGE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Maximum records Binance returns per `aggTrades` request.
pub const PAGE_LIMIT: usize = 1000;

/// Pause between consecutive requests to stay within Binance rate limits.
pub const REQUEST_PACING: Duration = Duration::from_millis(100);

/// Default upper bound on the number of trades loaded for one backtest.
pub const DEFAULT_MAX_RECORDS: usize = 500_000;

/// Position of the next `aggTrades` request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PageCursor {
    /// No trade found yet. Request the window `[start_ms, start_ms + PAGE_WINDOW)`.
    Time { start_ms: i64 },
    /// Continue from the aggregate trade id following the last one received.
    FromId(u64),
}

impl PageCursor {
    /// Advance past `page`, returning the entries that fall before `end_ms` and the next cursor,
    /// or `None` once the range is exhausted.
    fn advance(self, page: Vec<AggTrade>, end_ms: i64) -> (Vec<AggTrade>, Option<PageCursor>) {
        let Some(last_id) = page.last().map(|entry| entry.id) else {
            return match self {
                PageCursor::Time { start_ms } => {
                    let next_ms = page_end_ms(start_ms, end_ms);
                    let next = (next_ms < end_ms).then_some(PageCursor::Time { start_ms: next_ms });
                    (page, next)
                }
                // Caught up with the most recent trade
                PageCursor::FromId(_) => (page, None),
            };
        };

        let received = page.len();
        let kept = page
            .into_iter()
            .take_while(|entry| entry.trade.occurred_at().timestamp_millis() < end_ms)
            .collect::<Vec<_>>();

        let next = (kept.len() == received).then_some(PageCursor::FromId(last_id + 1));
        (kept, next)
    }
}

fn page_end_ms(start_ms: i64, end_ms: i64) -> i64 {
    (start_ms + PAGE_WINDOW.as_millis() as i64).min(end_ms)
}

/// Pages the Binance `/api/v3/aggTrades` endpoint into [`Trade`]s for offline replay.
///
/// The first page is located by time window. Once a trade is found, pages continue by
/// aggregate trade id (`fromId`), so trades sharing a millisecond across a page boundary are
/// never skipped.
#[derive(Debug, Clone)]
pub struct BinanceHistory {
    client: reqwest::Client,
    base_url: String,
    max_records: usize,
    pacing: Duration,
}

impl Default for BinanceHistory {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: BINANCE_SPOT_REST_BASE.to_string(),
            max_records: DEFAULT_MAX_RECORDS,
            pacing: REQUEST_PACING,
        }
    }
}

impl BinanceHistory {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Fetch every aggregate trade for `symbol` (eg/ "BTCUSDT") in `[start, end)`, oldest first,
    /// truncated to `max_records`.
    pub async fn fetch(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Trade>, HistoryError> {
        if start >= end {
            return Err(HistoryError::Range {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }

        let url = format!("{}/api/v3/aggTrades", self.base_url.trim_end_matches('/'));
        let end_ms = end.timestamp_millis();
        let mut cursor = Some(PageCursor::Time {
            start_ms: start.timestamp_millis(),
        });
        let mut trades = Vec::new();
        let mut requests = 0u64;

        info!(%symbol, %start, %end, "fetching historical trades");

        while let Some(current) = cursor {
            if trades.len() >= self.max_records {
                break;
            }

            let page = self.fetch_page(&url, symbol, current, end_ms).await?;
            requests += 1;

            let (kept, next) = current.advance(page, end_ms);
            trades.extend(kept.into_iter().map(|entry| entry.trade));
            cursor = next;

            if requests % 10 == 0 {
                debug!(requests, trades = trades.len(), ?cursor, "history fetch progress");
            }

            if cursor.is_some() {
                tokio::time::sleep(self.pacing).await;
            }
        }

        trades.truncate(self.max_records);
        info!(%symbol, requests, trades = trades.len(), "historical trades fetched");
        Ok(trades)
    }

    async fn fetch_page(
        &self,
        url: &str,
        symbol: &str,
        cursor: PageCursor,
        end_ms: i64,
    ) -> Result<Vec<AggTrade>, HistoryError> {
        let mut query = vec![
            ("symbol", symbol.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        match cursor {
            // Binance treats endTime as inclusive
            PageCursor::Time { start_ms } => {
                query.push(("startTime", start_ms.to_string()));
                query.push(("endTime", (page_end_ms(start_ms, end_ms) - 1).to_string()));
            }
            PageCursor::FromId(id) => query.push(("fromId", id.to_string())),
        }

        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|error| HistoryError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HistoryError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|error| HistoryError::Request(error.to_string()))?;

        Ok(decode_agg_trades(&body)?)
    }
}
