use super::{FetchError, OhlcSource};
use crate::models::Candle;
use async_trait::async_trait;
use chrono::DateTime;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const KRAKEN_API_BASE: &str = "https://api.kraken.com";
const RATE_LIMIT_RPM: u32 = 24; // public endpoints: keep ~2.5s between calls
const MAX_RETRIES: u32 = 3;

// Type alias for the rate limiter to simplify signatures
type KrakenRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for Kraken public REST endpoints (OHLC + Ticker).
///
/// This struct is cloneable to allow sharing across async tasks.
/// All clones share the same rate limiter.
#[derive(Clone)]
pub struct KrakenClient {
    client: Client,
    base_url: String,
    pair: String,
    rate_limiter: Arc<KrakenRateLimiter>,
}

impl KrakenClient {
    pub fn new(pair: &str) -> Self {
        Self::with_base_url(pair, KRAKEN_API_BASE)
    }

    /// Point the client at a different host (used by HTTP-mocked tests).
    pub fn with_base_url(pair: &str, base_url: &str) -> Self {
        // Construction happens once at startup; a client without the
        // timeouts must never be handed out.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap_or(NonZeroU32::MIN));
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            pair: pair.to_string(),
            rate_limiter,
        }
    }

    /// Make a rate-limited request with retry logic, returning the
    /// `result` object of the Kraken envelope.
    async fn get_result(&self, path_and_query: &str) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let mut last_error = String::new();

        for attempt in 1..=MAX_RETRIES {
            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let payload: Value = response.json().await?;

                        // Envelope: {"error": [..], "result": {..}}
                        if let Some(errors) = payload.get("error").and_then(Value::as_array) {
                            if !errors.is_empty() {
                                let joined = errors
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .collect::<Vec<_>>()
                                    .join(", ");
                                return Err(FetchError::Api(joined));
                            }
                        }

                        return payload
                            .get("result")
                            .cloned()
                            .ok_or_else(|| FetchError::Payload("missing result".to_string()));
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Kraken returned {}, backing off for {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        last_error = format!("HTTP {status}");
                        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    // Other 4xx - don't retry
                    return Err(FetchError::Status(status));
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(FetchError::Transport(e)),
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts: MAX_RETRIES,
            last: last_error,
        })
    }
}

fn parse_number(v: &Value) -> Option<f64> {
    v.as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| v.as_f64())
}

/// One OHLC row: `[ts, open, high, low, close, vwap, volume, count]`,
/// prices as strings.
fn candle_from_row(row: &Value) -> Option<Candle> {
    let row = row.as_array()?;
    if row.len() < 8 {
        return None;
    }
    Some(Candle {
        time: DateTime::from_timestamp(row[0].as_i64()?, 0)?,
        open: parse_number(&row[1])?,
        high: parse_number(&row[2])?,
        low: parse_number(&row[3])?,
        close: parse_number(&row[4])?,
        vwap: parse_number(&row[5])?,
        volume: parse_number(&row[6])?,
        trades: u32::try_from(row[7].as_i64()?).ok()?,
    })
}

#[async_trait]
impl OhlcSource for KrakenClient {
    async fn fetch_ohlc(
        &self,
        interval_minutes: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut query = format!(
            "/0/public/OHLC?pair={}&interval={}",
            self.pair, interval_minutes
        );
        if let Some(since) = since {
            query.push_str(&format!("&since={since}"));
        }

        let result = self.get_result(&query).await?;
        let rows = result
            .as_object()
            .and_then(|obj| obj.iter().find(|(k, _)| *k != "last"))
            .and_then(|(_, v)| v.as_array())
            .ok_or_else(|| FetchError::Payload("no OHLC rows for pair".to_string()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            match candle_from_row(row) {
                Some(c) => candles.push(c),
                None => tracing::debug!("dropping malformed OHLC row: {row}"),
            }
        }
        Ok(candles)
    }

    async fn last_price(&self) -> Result<f64, FetchError> {
        let query = format!("/0/public/Ticker?pair={}", self.pair);
        let result = self.get_result(&query).await?;

        result
            .as_object()
            .and_then(|obj| obj.values().next())
            .and_then(|v| v.get("c"))
            .and_then(|c| c.get(0))
            .and_then(parse_number)
            .ok_or_else(|| FetchError::Payload("missing last price".to_string()))
    }
}
