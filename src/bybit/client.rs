// =============================================================================
// Market Data Client — paginated Bybit v5 public REST
// =============================================================================
//
// All reads go through `/v5/market/*`. Responses use the envelope
// `{retCode, retMsg, result: {list, nextPageCursor}}`; only retCode == 0 is
// success regardless of the HTTP status. Pagination is cursor-based with
// limit=1000 (the API maximum).
//
// Retry policy lives here: transport faults and retCode 10016 are retried up
// to 4 attempts with exponential backoff (base 0.5s), honoring a Retry-After
// header when the exchange sends one. Auth, timestamp and parameter errors
// fail immediately.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bybit::error::BybitError;
use crate::bybit::rate_limit::RateLimiter;
use crate::market_data::InstantTicker;
use crate::types::{Category, FundingInfo, InstrumentLimits};

/// Maximum page size supported by /v5/market endpoints.
const PAGE_LIMIT: u32 = 1000;
/// Attempts for a single logical request (1 initial + 3 retries).
const MAX_ATTEMPTS: u32 = 4;
/// Base backoff between retries.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// One OHLC bar, reduced to the fields the volatility cache consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kline {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Public market-data REST client. Cheap to clone; the HTTP pool and the
/// rate limiter are shared.
#[derive(Clone)]
pub struct MarketDataClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
}

struct RequestFailure {
    error: BybitError,
    retry_after: Option<Duration>,
}

impl MarketDataClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            limiter,
        }
    }

    // -------------------------------------------------------------------------
    // C1 operations
    // -------------------------------------------------------------------------

    /// Fetch funding rate, 24h turnover and next funding time for every
    /// symbol in `category`. Aggregates across pages; symbols without a
    /// parseable funding rate are skipped.
    pub async fn fetch_funding_map(
        &self,
        category: Category,
    ) -> Result<HashMap<String, FundingInfo>, BybitError> {
        let mut funding_map = HashMap::new();
        let mut cursor = String::new();
        let mut page: u32 = 0;

        loop {
            page += 1;
            let mut params = vec![
                ("category".to_string(), category.as_str().to_string()),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor".to_string(), cursor.clone()));
            }

            let result = self
                .request_result("/v5/market/tickers", &params)
                .await
                .map_err(|e| Self::with_page_context(e, page, funding_map.len()))?;

            for ticker in result["list"].as_array().into_iter().flatten() {
                let Some(symbol) = ticker["symbol"].as_str().filter(|s| !s.is_empty()) else {
                    continue;
                };
                let Some(funding_rate) = parse_opt_f64(&ticker["fundingRate"]) else {
                    continue;
                };
                let turnover_24h = parse_opt_f64(&ticker["turnover24h"]).unwrap_or(0.0);
                let next_funding_time = ticker["nextFundingTime"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .or_else(|| ticker["nextFundingTime"].as_i64().map(|v| v.to_string()));

                funding_map.insert(
                    symbol.to_string(),
                    FundingInfo {
                        funding_rate,
                        turnover_24h,
                        next_funding_time,
                    },
                );
            }

            match result["nextPageCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }

        debug!(category = %category, symbols = funding_map.len(), pages = page, "funding map fetched");
        Ok(funding_map)
    }

    /// Fetch spreads (as a fraction of the mid price) for the requested
    /// symbols. Scans the paginated tickers endpoint, filters locally, and
    /// short-circuits once every requested symbol was seen. Pagination
    /// failures abandon the scan; any still-missing symbol then gets one
    /// unary fallback call whose errors are swallowed.
    pub async fn fetch_spreads(
        &self,
        category: Category,
        symbols: &[String],
    ) -> Result<HashMap<String, f64>, BybitError> {
        let wanted: HashSet<&str> = symbols.iter().map(|s| s.as_str()).collect();
        let mut found: HashMap<String, f64> = HashMap::new();
        let mut cursor = String::new();
        let mut page: u32 = 0;

        'pages: loop {
            page += 1;
            let mut params = vec![
                ("category".to_string(), category.as_str().to_string()),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor".to_string(), cursor.clone()));
            }

            let result = match self.request_result("/v5/market/tickers", &params).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(category = %category, page, error = %e, "spread scan aborted, falling back to unary lookups");
                    break 'pages;
                }
            };

            for ticker in result["list"].as_array().into_iter().flatten() {
                let Some(symbol) = ticker["symbol"].as_str() else { continue };
                if !wanted.contains(symbol) {
                    continue;
                }
                if let Some(spread) = spread_from_ticker(ticker) {
                    found.insert(symbol.to_string(), spread);
                }
            }

            if found.len() >= wanted.len() {
                break;
            }
            match result["nextPageCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }

        // Unary fallback for whatever the scan missed.
        for symbol in symbols {
            if found.contains_key(symbol) {
                continue;
            }
            match self.fetch_single_spread(category, symbol).await {
                Ok(Some(spread)) => {
                    found.insert(symbol.clone(), spread);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "spread fallback failed");
                }
            }
        }

        debug!(category = %category, requested = symbols.len(), found = found.len(), "spreads fetched");
        Ok(found)
    }

    async fn fetch_single_spread(
        &self,
        category: Category,
        symbol: &str,
    ) -> Result<Option<f64>, BybitError> {
        let params = vec![
            ("category".to_string(), category.as_str().to_string()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let result = self.request_result("/v5/market/tickers", &params).await?;
        let ticker = result["list"].as_array().and_then(|l| l.first());
        Ok(ticker.and_then(spread_from_ticker))
    }

    /// Fetch a single symbol's ticker as an [`InstantTicker`] seed for the
    /// turbo path when no streaming tick has arrived yet.
    pub async fn fetch_instrument_ticker(
        &self,
        category: Category,
        symbol: &str,
    ) -> Result<InstantTicker, BybitError> {
        let params = vec![
            ("category".to_string(), category.as_str().to_string()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let result = self.request_result("/v5/market/tickers", &params).await?;
        let ticker = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| BybitError::Malformed(format!("no ticker returned for {symbol}")))?;

        Ok(InstantTicker {
            funding_rate: parse_opt_f64(&ticker["fundingRate"]),
            turnover_24h: parse_opt_f64(&ticker["turnover24h"]),
            bid: parse_opt_f64(&ticker["bid1Price"]),
            ask: parse_opt_f64(&ticker["ask1Price"]),
            next_funding_time: ticker["nextFundingTime"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .or_else(|| ticker["nextFundingTime"].as_i64())
                .map(|ms| ms / 1000),
            mark_price: parse_opt_f64(&ticker["markPrice"]),
            last_price: parse_opt_f64(&ticker["lastPrice"]),
            updated_at: chrono::Utc::now().timestamp(),
        })
    }

    /// List every trading perpetual in `category` from instruments-info
    /// (paginated).
    pub async fn fetch_instruments(&self, category: Category) -> Result<Vec<String>, BybitError> {
        let mut symbols = Vec::new();
        let mut cursor = String::new();
        let mut page: u32 = 0;

        loop {
            page += 1;
            let mut params = vec![
                ("category".to_string(), category.as_str().to_string()),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
            ];
            if !cursor.is_empty() {
                params.push(("cursor".to_string(), cursor.clone()));
            }

            let result = self
                .request_result("/v5/market/instruments-info", &params)
                .await
                .map_err(|e| Self::with_page_context(e, page, symbols.len()))?;

            for inst in result["list"].as_array().into_iter().flatten() {
                let status = inst["status"].as_str().unwrap_or("");
                let contract = inst["contractType"].as_str().unwrap_or("");
                if status != "Trading" {
                    continue;
                }
                // Only perpetual contracts; dated futures share the endpoint.
                if !contract.contains("Perpetual") && !contract.is_empty() {
                    continue;
                }
                if let Some(symbol) = inst["symbol"].as_str().filter(|s| !s.is_empty()) {
                    symbols.push(symbol.to_string());
                }
            }

            match result["nextPageCursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }

        debug!(category = %category, count = symbols.len(), "instrument universe fetched");
        Ok(symbols)
    }

    /// True when `symbol` exists and trades in `category`.
    pub async fn validate_symbol(&self, category: Category, symbol: &str) -> Result<bool, BybitError> {
        let params = vec![
            ("category".to_string(), category.as_str().to_string()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let result = self
            .request_result("/v5/market/instruments-info", &params)
            .await?;
        Ok(result["list"].as_array().is_some_and(|l| !l.is_empty()))
    }

    /// Tick size / qty step / min order qty for one instrument.
    pub async fn fetch_instrument_limits(
        &self,
        category: Category,
        symbol: &str,
    ) -> Result<InstrumentLimits, BybitError> {
        let params = vec![
            ("category".to_string(), category.as_str().to_string()),
            ("symbol".to_string(), symbol.to_string()),
        ];
        let result = self
            .request_result("/v5/market/instruments-info", &params)
            .await?;
        let inst = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| BybitError::Malformed(format!("instrument {symbol} not found")))?;

        let defaults = InstrumentLimits::default();
        Ok(InstrumentLimits {
            tick_size: parse_opt_f64(&inst["priceFilter"]["tickSize"]).unwrap_or(defaults.tick_size),
            qty_step: parse_opt_f64(&inst["lotSizeFilter"]["qtyStep"]).unwrap_or(defaults.qty_step),
            min_order_qty: parse_opt_f64(&inst["lotSizeFilter"]["minOrderQty"])
                .unwrap_or(defaults.min_order_qty),
        })
    }

    /// Fetch the most recent `limit` klines for `symbol` at `interval`
    /// minutes, oldest first.
    ///
    /// Kline array indices: [0] startTime, [1] open, [2] high, [3] low,
    /// [4] close, [5] volume, [6] turnover.
    pub async fn fetch_klines(
        &self,
        category: Category,
        symbol: &str,
        interval_min: u32,
        limit: u32,
    ) -> Result<Vec<Kline>, BybitError> {
        let params = vec![
            ("category".to_string(), category.as_str().to_string()),
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval_min.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let result = self.request_result("/v5/market/kline", &params).await?;

        let mut klines = Vec::new();
        for entry in result["list"].as_array().into_iter().flatten() {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 5 {
                warn!(symbol, "skipping malformed kline entry with {} elements", arr.len());
                continue;
            }
            let (Some(high), Some(low), Some(close)) = (
                parse_opt_f64(&arr[2]),
                parse_opt_f64(&arr[3]),
                parse_opt_f64(&arr[4]),
            ) else {
                continue;
            };
            klines.push(Kline { high, low, close });
        }

        // The API returns newest first.
        klines.reverse();
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send one logical GET with rate limiting and retries, validate the
    /// envelope, and return the `result` object.
    async fn request_result(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, BybitError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.limiter.acquire().await;

            match self.send_once(&url, params).await {
                Ok(result) => return Ok(result),
                Err(failure) => {
                    if failure.error.is_retryable() && attempt < MAX_ATTEMPTS {
                        let backoff = failure
                            .retry_after
                            .unwrap_or_else(|| BACKOFF_BASE * 2u32.pow(attempt - 1));
                        warn!(
                            url = %url,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %failure.error,
                            "retrying request"
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(failure.error);
                }
            }
        }
    }

    async fn send_once(&self, url: &str, params: &[(String, String)]) -> Result<Value, RequestFailure> {
        let response = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| RequestFailure {
                error: BybitError::Transport(e),
                retry_after: None,
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);

        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(RequestFailure {
                error: BybitError::HttpStatus {
                    status: status.as_u16(),
                    detail: detail.chars().take(200).collect(),
                },
                retry_after,
            });
        }

        let body: Value = response.json().await.map_err(|e| RequestFailure {
            error: BybitError::Transport(e),
            retry_after: None,
        })?;

        let ret_code = body["retCode"].as_i64().unwrap_or(0);
        if ret_code != 0 {
            let ret_msg = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(RequestFailure {
                error: BybitError::from_ret_code(ret_code, ret_msg),
                retry_after,
            });
        }

        Ok(body["result"].clone())
    }

    /// Attach pagination progress to a mid-scan failure.
    fn with_page_context(error: BybitError, page: u32, collected: usize) -> BybitError {
        match error.ret_code() {
            Some(code) => BybitError::Upstream {
                code,
                message: error.to_string(),
                page,
                collected,
            },
            None => error,
        }
    }
}

impl std::fmt::Debug for MarketDataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Parse helpers
// -------------------------------------------------------------------------

/// Parse a JSON value that may be a string or a number into f64. Returns
/// None for empty strings and non-numeric values.
pub fn parse_opt_f64(val: &Value) -> Option<f64> {
    if let Some(s) = val.as_str() {
        if s.is_empty() {
            return None;
        }
        s.parse::<f64>().ok()
    } else {
        val.as_f64()
    }
}

/// Spread fraction from a ticker object's bid1Price/ask1Price, mid-price
/// denominated. None unless both sides are strictly positive.
fn spread_from_ticker(ticker: &Value) -> Option<f64> {
    let bid = parse_opt_f64(&ticker["bid1Price"])?;
    let ask = parse_opt_f64(&ticker["ask1Price"])?;
    if bid <= 0.0 || ask <= 0.0 {
        return None;
    }
    let mid = (ask + bid) / 2.0;
    if mid <= 0.0 {
        return None;
    }
    Some((ask - bid) / mid)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_opt_f64_accepts_strings_and_numbers() {
        assert_eq!(parse_opt_f64(&json!("0.0001")), Some(0.0001));
        assert_eq!(parse_opt_f64(&json!(12.5)), Some(12.5));
        assert_eq!(parse_opt_f64(&json!("")), None);
        assert_eq!(parse_opt_f64(&json!("abc")), None);
        assert_eq!(parse_opt_f64(&json!(null)), None);
    }

    #[test]
    fn spread_uses_mid_price() {
        let ticker = json!({"bid1Price": "100.0", "ask1Price": "101.0"});
        let spread = spread_from_ticker(&ticker).unwrap();
        // (101 - 100) / 100.5
        assert!((spread - 1.0 / 100.5).abs() < 1e-12);
    }

    #[test]
    fn spread_requires_both_sides_positive() {
        assert!(spread_from_ticker(&json!({"bid1Price": "0", "ask1Price": "101"})).is_none());
        assert!(spread_from_ticker(&json!({"bid1Price": "100", "ask1Price": ""})).is_none());
        assert!(spread_from_ticker(&json!({"ask1Price": "101"})).is_none());
    }

    #[test]
    fn page_context_wraps_ret_code_errors_only() {
        let api_err = BybitError::from_ret_code(10001, "bad cursor");
        let wrapped = MarketDataClient::with_page_context(api_err, 2, 1500);
        match wrapped {
            BybitError::Upstream { code, page, collected, .. } => {
                assert_eq!(code, 10001);
                assert_eq!(page, 2);
                assert_eq!(collected, 1500);
            }
            other => panic!("expected Upstream, got {other:?}"),
        }

        let transport = BybitError::Malformed("broken".into());
        let untouched = MarketDataClient::with_page_context(transport, 1, 0);
        assert!(matches!(untouched, BybitError::Malformed(_)));
    }
}
