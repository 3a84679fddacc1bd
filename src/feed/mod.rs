pub mod verifier;

pub use verifier::{CandleVerifier, VerifyOutcome};

use crate::api::OhlcSource;
use crate::models::{minute_floor, Candle};
use crate::store::CandleStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// History seeded before the reference time so the breakout levels can be
/// computed immediately on startup.
const PRIME_DEPTH: usize = 10;

/// Candles accepted by the startup priming pass, split by whether they
/// precede the reference time (the caller labels them differently in the
/// audit journal).
#[derive(Debug, Default)]
pub struct PrimeReport {
    pub primed: Vec<Candle>,
    pub backfilled: Vec<Candle>,
}

/// Pulls newly closed candles from the market-data source and appends
/// them to the store, advancing a per-interval watermark.
///
/// The poll loop is the sole appender; everything else only reads or
/// corrects in place.
pub struct IngestionFeed<S> {
    source: Arc<S>,
    store: CandleStore,
    intervals: Vec<(String, u32)>,
    watermarks: HashMap<String, i64>,
}

impl<S: OhlcSource> IngestionFeed<S> {
    pub fn new(source: Arc<S>, store: CandleStore, intervals: Vec<(String, u32)>) -> Self {
        Self {
            source,
            store,
            intervals,
            watermarks: HashMap::new(),
        }
    }

    /// Last-ingested unix timestamp for an interval, if any.
    pub fn watermark(&self, interval: &str) -> Option<i64> {
        self.watermarks.get(interval).copied()
    }

    /// One ingestion cycle: per interval, fetch since the watermark, keep
    /// only closed candles, append those strictly newer than the store's
    /// tail, then advance the watermark. Idempotent when upstream has
    /// nothing new.
    ///
    /// Returns the newly accepted candles as (interval, candle) pairs so
    /// the caller can journal them and notify the close-subscribers.
    /// A fetch failure skips that interval for this cycle.
    pub async fn poll_once(&mut self) -> crate::Result<Vec<(String, Candle)>> {
        let now = Utc::now();
        let mut accepted = Vec::new();

        for (name, minutes) in self.intervals.clone() {
            let since = self.watermarks.get(&name).copied();
            let candles = match self.source.fetch_ohlc(minutes, since).await {
                Ok(candles) => candles,
                Err(e) => {
                    tracing::warn!(interval = %name, "fetch failed, skipping cycle: {e}");
                    continue;
                }
            };

            let mut last_time = self.store.last_time(&name)?;
            for candle in candles {
                if !candle.is_closed(now) {
                    continue;
                }
                if last_time.map_or(true, |t| candle.time > t) && self.store.append(&name, candle.clone())? {
                    last_time = Some(candle.time);
                    accepted.push((name.clone(), candle));
                }
            }

            if let Some(t) = last_time {
                self.watermarks.insert(name.clone(), t.timestamp());
            }
        }

        Ok(accepted)
    }

    /// Seed the 1m ring at startup: up to [`PRIME_DEPTH`] closed candles
    /// ending at the effective reference time (the reference minute
    /// clamped to now), then a backfill of everything closed since. Sets
    /// the watermark so the first `poll_once` continues seamlessly.
    pub async fn prime(&mut self, reference_time: DateTime<Utc>) -> crate::Result<PrimeReport> {
        let now = Utc::now();
        let effective_ref = reference_time.min(minute_floor(now));
        let mut report = PrimeReport::default();

        let Some((name, minutes)) = self.intervals.first().cloned() else {
            return Ok(report);
        };

        let since = effective_ref.timestamp() - (PRIME_DEPTH as i64 + 5) * 60 * minutes as i64;
        let fetched = self.source.fetch_ohlc(minutes, Some(since)).await?;

        let mut seed: Vec<Candle> = fetched
            .iter()
            .filter(|c| c.is_closed(now) && c.time <= effective_ref)
            .cloned()
            .collect();
        if seed.len() > PRIME_DEPTH {
            seed.drain(..seed.len() - PRIME_DEPTH);
        }
        for candle in seed {
            if self.store.append(&name, candle.clone())? {
                report.primed.push(candle);
            }
        }

        // Everything closed after the seeded window, in one more pass.
        let post_since = report
            .primed
            .last()
            .map(|c| c.time)
            .unwrap_or(effective_ref);
        let post = self
            .source
            .fetch_ohlc(minutes, Some(post_since.timestamp()))
            .await?;
        for candle in post {
            if candle.is_closed(now)
                && candle.time > post_since
                && self.store.append(&name, candle.clone())?
            {
                report.backfilled.push(candle);
            }
        }

        let last = self
            .store
            .last_time(&name)?
            .unwrap_or(effective_ref - Duration::minutes(1));
        self.watermarks.insert(name, last.timestamp());

        tracing::info!(
            primed = report.primed.len(),
            backfilled = report.backfilled.len(),
            "seeded candle history up to {effective_ref}"
        );
        Ok(report)
    }
}
