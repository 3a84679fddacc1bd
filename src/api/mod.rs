pub mod kraken;

pub use kraken::KrakenClient;

use crate::models::Candle;
use async_trait::async_trait;
use thiserror::Error;

/// Failure taxonomy for the market-data boundary.
///
/// Transient variants are retried inside the client; whatever surfaces to
/// the feed or the verifier is recoverable and handled by logging and
/// skipping that cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(reqwest::StatusCode),

    /// Error reported inside the Kraken payload (bad pair, bad interval).
    /// Not retryable: the same request would fail the same way.
    #[error("kraken error: {0}")]
    Api(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Range-fetch side of the market-data source.
///
/// The feed and the verifier depend on this abstraction rather than the
/// concrete REST client so they can be driven by a scripted source in
/// tests.
#[async_trait]
pub trait OhlcSource: Send + Sync {
    /// All available candles for the interval with `time >= since`,
    /// oldest first. `since` is a unix timestamp in seconds.
    async fn fetch_ohlc(
        &self,
        interval_minutes: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Last traded price for the configured pair.
    async fn last_price(&self) -> Result<f64, FetchError>;
}
